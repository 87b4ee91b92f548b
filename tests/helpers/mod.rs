#![allow(dead_code)]

use cairn::db::{OpenOptions, Store};
use cairn::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use std::path::Path;
use tempfile::TempDir;

/// Open a fresh in-memory store with every migration applied.
pub fn test_store() -> Store {
    Store::open_in_memory(&OpenOptions::default()).unwrap()
}

/// An in-memory store with the vector extension disabled.
pub fn keyword_only_store() -> Store {
    Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap()
}

/// A file-backed store in a fresh temp directory. Keep the `TempDir` alive
/// for as long as the store is used.
pub fn file_store() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let store = open_at(&tmp.path().join("cairn.db"), true);
    (tmp, store)
}

pub fn open_at(path: &Path, vector: bool) -> Store {
    Store::open(path, &OpenOptions::default().vector_extension(vector)).unwrap()
}

/// Generate a deterministic 384-dim embedding with a spike at position `seed`.
/// Distinct seeds give orthogonal vectors.
pub fn test_embedding(seed: u8) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed as usize % EMBEDDING_DIM] = 1.0;
    v
}

/// Embeds text onto the axis of its first byte, so texts that start with the
/// same letter are identical and texts that don't are orthogonal.
pub struct FirstLetterEmbedder;

impl EmbeddingProvider for FirstLetterEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(test_embedding(text.bytes().next().unwrap_or(0)))
    }
}
