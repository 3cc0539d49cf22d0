use candle_core::{Device, Tensor};
use tracing::debug;

use crate::{
    corpus::Passage,
    embedding_db::{EmbeddingDb, EmbeddingMatrix},
    error::{Error, Result},
    model_manager::ModelManager,
};

/// Number of passages encoded per forward pass.
pub const ENCODE_BATCH_SIZE: usize = 32;

/// Encode passages in batches and store their embeddings next to the
/// passage records.
///
/// Takes `(passage_id, passage)` pairs. Each batch is written in its own
/// transaction. Returns the number of passages stored.
pub fn embed_and_store(
    model: &mut ModelManager,
    db: &EmbeddingDb,
    passages: &[(u64, Passage)],
) -> Result<usize> {
    let mut stored = 0;

    for (batch_no, batch) in passages.chunks(ENCODE_BATCH_SIZE).enumerate() {
        let texts: Vec<String> =
            batch.iter().map(|(_, p)| p.content.clone()).collect();
        let embeddings = model.encode_documents(&texts)?;
        let matrices = split_batch(&embeddings, batch.len())?;

        let entries: Vec<(u64, &Passage, &EmbeddingMatrix)> = batch
            .iter()
            .zip(&matrices)
            .map(|((id, passage), matrix)| (*id, passage, matrix))
            .collect();
        db.store_batch(&entries)?;

        stored += entries.len();
        debug!(batch = batch_no, stored, total = passages.len(), "encoded passages");
    }

    Ok(stored)
}

/// Split a `[B, T, D]` batch tensor into one matrix per passage.
pub(crate) fn split_batch(
    embeddings: &Tensor,
    expected: usize,
) -> Result<Vec<EmbeddingMatrix>> {
    let (batch_size, _num_tokens, dimension) = embeddings.dims3()?;
    if batch_size != expected {
        return Err(Error::Inference(format!(
            "encoder returned {batch_size} embeddings for {expected} passages"
        )));
    }

    (0..batch_size)
        .map(|i| {
            let flat = embeddings.get(i)?.flatten_all()?.to_vec1::<f32>()?;
            let num_tokens = flat.len() / dimension.max(1);
            EmbeddingMatrix::new(num_tokens as u32, dimension as u32, flat)
        })
        .collect()
}

/// Convert a stored matrix into a `[T, D]` tensor on the CPU.
pub fn matrix_to_tensor(matrix: &EmbeddingMatrix) -> Result<Tensor> {
    Ok(Tensor::from_vec(
        matrix.data.clone(),
        (matrix.num_tokens as usize, matrix.dimension as usize),
        &Device::Cpu,
    )?)
}
