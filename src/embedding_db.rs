use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::{
    corpus::Passage,
    error::{Error, Result},
};

const EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("embeddings");

const PASSAGES: TableDefinition<u64, &str> = TableDefinition::new("passages");

/// Header size: 4 bytes token count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// Stores per-token embedding matrices and passage records of one index,
/// both keyed by passage id.
///
/// Binary format per embedding entry:
/// - 4 bytes: token count T (u32 LE)
/// - 4 bytes: embedding dimension D (u32 LE)
/// - T * D * 4 bytes: f32 LE values in row-major order
///
/// Passage records are stored as JSON.
pub struct EmbeddingDb {
    db: Database,
}

/// A passage id with everything persisted for it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPassage {
    pub passage_id: u64,
    pub passage: Passage,
    pub embedding: EmbeddingMatrix,
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use magnet::embedding_db::EmbeddingDb;
    ///
    /// let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
    /// assert_eq!(db.len().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_table(PASSAGES)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store passages with their embeddings in a single transaction.
    ///
    /// Uses `insert_reserve` for zero-copy embedding writes.
    pub fn store_batch(
        &self,
        entries: &[(u64, &Passage, &EmbeddingMatrix)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut embeddings = txn.open_table(EMBEDDINGS)?;
            let mut passages = txn.open_table(PASSAGES)?;

            for (passage_id, passage, matrix) in entries {
                matrix.check_shape()?;

                let byte_len =
                    HEADER_SIZE + std::mem::size_of_val(matrix.data.as_slice());
                let mut guard = embeddings.insert_reserve(*passage_id, byte_len)?;
                let dest = guard.as_mut();
                dest[0..4].copy_from_slice(&matrix.num_tokens.to_le_bytes());
                dest[4..8].copy_from_slice(&matrix.dimension.to_le_bytes());
                dest[HEADER_SIZE..]
                    .copy_from_slice(bytemuck::cast_slice(&matrix.data));
                drop(guard);

                let record = serde_json::to_string(passage)?;
                passages.insert(*passage_id, record.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Retrieve one embedding matrix. `None` if absent or malformed.
    pub fn load_embedding(
        &self,
        passage_id: u64,
    ) -> Result<Option<EmbeddingMatrix>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table
            .get(passage_id)?
            .and_then(|guard| EmbeddingMatrix::decode(guard.value())))
    }

    /// Load every passage that has both a record and a well-formed
    /// embedding, in passage id order.
    pub fn load_all(&self) -> Result<Vec<StoredPassage>> {
        let txn = self.db.begin_read()?;
        let embeddings = txn.open_table(EMBEDDINGS)?;
        let passages = txn.open_table(PASSAGES)?;

        let mut stored = Vec::new();
        for entry in passages.iter()? {
            let (key, value) = entry?;
            let passage_id = key.value();
            let passage: Passage = serde_json::from_str(value.value())?;

            let Some(embedding) = embeddings
                .get(passage_id)?
                .and_then(|guard| EmbeddingMatrix::decode(guard.value()))
            else {
                continue;
            };

            stored.push(StoredPassage {
                passage_id,
                passage,
                embedding,
            });
        }

        Ok(stored)
    }

    /// Number of stored passage records.
    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PASSAGES)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}

/// A token-level embedding matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    pub num_tokens: u32,
    pub dimension: u32,
    /// Flat array of f32 values in row-major order:
    /// `data[token_idx * dimension + dim_idx]`.
    pub data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn new(num_tokens: u32, dimension: u32, data: Vec<f32>) -> Result<Self> {
        let matrix = Self {
            num_tokens,
            dimension,
            data,
        };
        matrix.check_shape()?;
        Ok(matrix)
    }

    fn check_shape(&self) -> Result<()> {
        let expected = (self.num_tokens as usize) * (self.dimension as usize);
        if self.data.len() != expected {
            return Err(Error::Inference(format!(
                "embedding has {} values, expected {} tokens x {} dimensions",
                self.data.len(),
                self.num_tokens,
                self.dimension
            )));
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let num_tokens =
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let dimension =
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let expected_len =
            HEADER_SIZE + (num_tokens as usize) * (dimension as usize) * 4;
        if bytes.len() != expected_len {
            return None;
        }

        // The value slice is not guaranteed to be 4-byte aligned.
        let data: Vec<f32> = bytes[HEADER_SIZE..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Some(Self {
            num_tokens,
            dimension,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, EmbeddingDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
        (tmp, db)
    }

    fn passage(doc: &str, chunk_index: usize, content: &str) -> Passage {
        Passage {
            document_id: doc.to_string(),
            document_ordinal: 0,
            chunk_index,
            content: content.to_string(),
        }
    }

    fn matrix(num_tokens: u32, dimension: u32) -> EmbeddingMatrix {
        let data = (0..num_tokens * dimension).map(|i| i as f32 * 0.5).collect();
        EmbeddingMatrix::new(num_tokens, dimension, data).unwrap()
    }

    #[test]
    fn store_and_load_all() {
        let (_tmp, db) = test_db();
        let first = passage("a", 0, "alpha");
        let second = passage("a", 1, "beta");
        let m1 = matrix(3, 4);
        let m2 = matrix(2, 4);

        db.store_batch(&[(1, &second, &m2), (0, &first, &m1)]).unwrap();

        let stored = db.load_all().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].passage_id, 0);
        assert_eq!(stored[0].passage, first);
        assert_eq!(stored[0].embedding, m1);
        assert_eq!(stored[1].embedding.num_tokens, 2);
        assert_eq!(db.len().unwrap(), 2);
    }

    #[test]
    fn load_single_embedding() {
        let (_tmp, db) = test_db();
        let m = matrix(2, 3);
        db.store_batch(&[(42, &passage("d", 0, "x"), &m)]).unwrap();

        assert_eq!(db.load_embedding(42).unwrap(), Some(m));
        assert!(db.load_embedding(999).unwrap().is_none());
    }

    #[test]
    fn wrong_shape_is_rejected() {
        assert!(matches!(
            EmbeddingMatrix::new(2, 3, vec![1.0, 2.0]),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn malformed_bytes_decode_to_none() {
        assert!(EmbeddingMatrix::decode(&[1, 2, 3]).is_none());

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(EmbeddingMatrix::decode(&bytes).is_none());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        let m = matrix(1, 2);

        {
            let db = EmbeddingDb::open(&path).unwrap();
            db.store_batch(&[(5, &passage("doc", 0, "kept"), &m)]).unwrap();
        }

        let db = EmbeddingDb::open(&path).unwrap();
        let stored = db.load_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].passage.content, "kept");
        assert_eq!(stored[0].embedding, m);
    }
}
