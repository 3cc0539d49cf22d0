use std::path::Path;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;
use tracing::{debug, info};

use crate::{
    chunking::DEFAULT_MAX_DOCUMENT_LENGTH,
    error::{Error, Result},
    retrieval::ModelConfig,
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "MAGNET_MODEL";

/// Checkpoint file that must exist for a reference to be usable.
const CHECKPOINT_CONFIG: &str = "config.json";
/// Sentence-transformers metadata carrying the document length.
const SENTENCE_TRANSFORMERS_CONFIG: &str = "config_sentence_transformers.json";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// The model reference from `MAGNET_MODEL`, or the default checkpoint.
pub fn model_from_env() -> String {
    checkpoint_or_default(std::env::var(MODEL_ENV_VAR).ok())
}

/// A blank override counts as unset.
fn checkpoint_or_default(configured: Option<String>) -> String {
    configured
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string())
}

/// Resolve a checkpoint reference without loading any weights.
///
/// `model_ref` is either a local directory containing `config.json` or a
/// Hugging Face hub id. The document length comes from the checkpoint's
/// sentence-transformers configuration when present.
pub fn resolve_checkpoint(model_ref: &str) -> Result<ModelConfig> {
    let load_error = |reason: String| Error::ModelLoad {
        model: model_ref.to_string(),
        reason,
    };

    if model_ref.trim().is_empty() {
        return Err(load_error("empty model reference".into()));
    }

    let local = Path::new(model_ref);
    let (model_id, st_config) = if local.is_dir() {
        if !local.join(CHECKPOINT_CONFIG).is_file() {
            return Err(load_error(format!(
                "{} has no {CHECKPOINT_CONFIG}",
                local.display()
            )));
        }
        let st_config = local.join(SENTENCE_TRANSFORMERS_CONFIG);
        (
            model_ref.to_string(),
            st_config.is_file().then_some(st_config),
        )
    } else {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| load_error(e.to_string()))?;
        let repo = api.model(model_ref.to_string());
        repo.get(CHECKPOINT_CONFIG)
            .map_err(|e| load_error(e.to_string()))?;
        (model_ref.to_string(), repo.get(SENTENCE_TRANSFORMERS_CONFIG).ok())
    };

    let doc_maxlen = st_config
        .as_deref()
        .and_then(read_document_length)
        .unwrap_or(DEFAULT_MAX_DOCUMENT_LENGTH);

    debug!(model = %model_id, doc_maxlen, "resolved checkpoint");
    Ok(ModelConfig {
        model_id,
        doc_maxlen,
    })
}

fn read_document_length(path: &Path) -> Option<usize> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    value
        .get("document_length")?
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
}

/// Manages the ColBERT encoder lifecycle, supporting lazy loading on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl ModelManager {
    /// Creates a `ModelManager` for `model_id`. Nothing is loaded until the
    /// first encode call.
    pub fn with_model_id(model_id: impl Into<String>) -> Self {
        Self {
            model: None,
            model_id: model_id.into(),
        }
    }

    /// Returns the model ID that will be (or has been) loaded.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            info!(model = %self.model_id, "loading ColBERT model");
            let loaded: std::result::Result<ColBERT, _> =
                ColBERT::from(&self.model_id)
                    .with_device(default_device())
                    .try_into();
            let colbert = loaded.map_err(|e| Error::ModelLoad {
                model: self.model_id.clone(),
                reason: e.to_string(),
            })?;
            self.model = Some(colbert);
        }

        self.model.as_mut().ok_or_else(|| Error::ModelLoad {
            model: self.model_id.clone(),
            reason: "model failed to initialize".into(),
        })
    }

    /// Encodes document texts into token-level embeddings of shape
    /// `[B, T, D]`.
    pub fn encode_documents(&mut self, texts: &[String]) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        model
            .encode(texts, false)
            .map_err(|e| Error::Inference(e.to_string()))
    }

    /// Encodes queries into token-level embeddings, one `[Q, D]` tensor per
    /// query, on the CPU.
    pub fn encode_queries(&mut self, queries: &[String]) -> Result<Vec<Tensor>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.ensure_loaded()?;
        let embeddings = model
            .encode(queries, true)
            .map_err(|e| Error::Inference(e.to_string()))?
            .to_device(&Device::Cpu)?;

        let (batch, _tokens, _dim) = embeddings.dims3()?;
        (0..batch)
            .map(|i| -> Result<Tensor> { Ok(embeddings.get(i)?) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::with_model_id("custom/model");
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!manager.is_loaded());
    }

    #[test]
    fn blank_override_falls_back_to_default_checkpoint() {
        assert_eq!(checkpoint_or_default(None), DEFAULT_MODEL_ID);
        assert_eq!(checkpoint_or_default(Some("  ".into())), DEFAULT_MODEL_ID);
        assert_eq!(
            checkpoint_or_default(Some(" org/colbert ".into())),
            "org/colbert"
        );
    }

    #[test]
    fn local_checkpoint_reads_document_length() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.json"), "{}").unwrap();
        std::fs::write(
            tmp.path().join("config_sentence_transformers.json"),
            r#"{"document_length": 300, "query_length": 32}"#,
        )
        .unwrap();

        let model_ref = tmp.path().to_string_lossy().to_string();
        let config = resolve_checkpoint(&model_ref).unwrap();
        assert_eq!(config.model_id, model_ref);
        assert_eq!(config.doc_maxlen, 300);
    }

    #[test]
    fn local_checkpoint_defaults_document_length() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.json"), "{}").unwrap();

        let config =
            resolve_checkpoint(&tmp.path().to_string_lossy()).unwrap();
        assert_eq!(config.doc_maxlen, DEFAULT_MAX_DOCUMENT_LENGTH);
    }

    #[test]
    fn directory_without_config_is_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_checkpoint(&tmp.path().to_string_lossy()).unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }

    #[test]
    fn empty_reference_is_load_error() {
        assert!(matches!(
            resolve_checkpoint("  "),
            Err(Error::ModelLoad { .. })
        ));
    }
}
