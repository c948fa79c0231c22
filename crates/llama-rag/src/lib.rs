//! # llama-rag
//!
//! Retrieval side of llama-rag: an append-only in-memory [`KnowledgeStore`]
//! with keyword-overlap scoring, the [`Retriever`] trait it implements, and
//! prompt augmentation with the best match.

pub mod error;
pub mod prompt;
pub mod store;

pub use error::{RagError, Result};
pub use prompt::augment_prompt;
pub use store::{score, KnowledgeStore, ScoredDocument};

/// Represents a retrieved document chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Insertion index of the document in its store.
    pub id: usize,
    pub text: String,
    pub score: f32,
}

/// Core trait for retrieval.
pub trait Retriever: Send + Sync {
    /// Retrieve up to `top_k` relevant chunks for a query, best first.
    fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>>;
}
