//! Append-only knowledge store with keyword-overlap retrieval.
//!
//! Scoring is deliberately naive and must stay exactly as is: a document's
//! score is the number of whitespace-delimited query tokens that occur as a
//! case-sensitive *substring* of the document (partial words count, repeated
//! query tokens count again). The best match is the first document with the
//! strictly highest non-zero score.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{RagError, Result};
use crate::{Chunk, Retriever};

/// A document together with its retrieval score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredDocument<'a> {
    /// Insertion index.
    pub index: usize,
    pub text: &'a str,
    pub score: usize,
}

/// Ordered collection of free-text documents.
///
/// # Invariants
/// - Documents are never empty.
/// - Insertion order is identity; nothing is deduplicated or removed.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeStore {
    documents: Vec<String>,
}

/// Query token separators: the C locale `isspace` set.
fn is_query_separator(c: char) -> bool {
    c.is_ascii_whitespace() || c == '\x0b'
}

/// Number of query tokens found as substrings of `document`.
pub fn score(document: &str, query: &str) -> usize {
    query
        .split(is_query_separator)
        .filter(|word| !word.is_empty())
        .filter(|word| document.contains(word))
        .count()
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a document. Empty text is ignored and reported as `false`.
    pub fn add_document(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            tracing::debug!("ignoring empty knowledge document");
            return false;
        }
        self.documents.push(text);
        true
    }

    /// Best-effort bulk load: one document per non-empty line.
    ///
    /// A missing or unreadable file adds nothing and is only logged.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        match self.try_load_file(path) {
            Ok(added) => added,
            Err(err) => {
                tracing::warn!("{err}");
                0
            }
        }
    }

    /// Load one document per non-empty line, surfacing I/O errors.
    ///
    /// Lines are decoded lossily; a trailing `\n` or `\r\n` is stripped. Lines
    /// read before an error stay in the store.
    pub fn try_load_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let read_err = |source| RagError::ReadFile {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = BufReader::new(File::open(path).map_err(read_err)?);
        let mut buf = Vec::new();
        let mut added = 0;
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(read_err)?;
            if n == 0 {
                break;
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            if self.add_document(String::from_utf8_lossy(&buf)) {
                added += 1;
            }
        }

        tracing::debug!(path = %path.display(), added, "loaded knowledge file");
        Ok(added)
    }

    /// The first document with the strictly highest non-zero score.
    pub fn best_match(&self, query: &str) -> Option<ScoredDocument<'_>> {
        let mut best: Option<ScoredDocument<'_>> = None;
        for (index, doc) in self.documents.iter().enumerate() {
            let s = score(doc, query);
            if s > best.map_or(0, |b| b.score) {
                best = Some(ScoredDocument {
                    index,
                    text: doc,
                    score: s,
                });
            }
        }
        best
    }

    /// Text of [`best_match`](Self::best_match), `None` when nothing scores.
    pub fn retrieve_best_match(&self, query: &str) -> Option<&str> {
        self.best_match(query).map(|m| m.text)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.documents.iter().map(String::as_str)
    }
}

impl Retriever for KnowledgeStore {
    fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Chunk>> {
        let mut scored: Vec<(usize, usize)> = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, score(doc, query)))
            .filter(|&(_, s)| s > 0)
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(i, s)| Chunk {
                id: i,
                text: self.documents[i].clone(),
                score: s as f32,
            })
            .collect())
    }
}
