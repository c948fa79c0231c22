//! Error types for llama-rag.

use std::path::PathBuf;

/// Result type for llama-rag operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in llama-rag operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("failed to read knowledge file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
