//! Decode batches.
//!
//! A [`DecodeBatch`] pairs each token with its absolute position and sequence
//! tag. Batches are transient: build one, hand it to
//! [`DecodeContext::decode`](crate::DecodeContext::decode), drop it.
//!
//! A batch also says whether it opens a new prompt or continues a generation
//! with the token just sampled. Native backends ignore the distinction; a
//! backend that scripts its output per generation step relies on it.

use crate::{LlamaError, Pos, Result, SeqId, TokenId};

/// One token slot in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: Pos,
    pub seq_id: SeqId,
    /// Whether the backend should produce logits for this slot.
    pub logits: bool,
}

/// A contiguous chunk of tokens submitted to one decode call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeBatch {
    entries: Vec<BatchEntry>,
    capacity: usize,
    prompt: bool,
}

impl DecodeBatch {
    /// Empty prompt batch able to hold `capacity` tokens.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            prompt: true,
        }
    }

    /// Batch covering a whole prompt: positions `start..start + n`, sequence 0,
    /// logits requested only for the final token.
    pub fn for_prompt(tokens: &[TokenId], start: Pos) -> Self {
        let mut batch = Self::with_capacity(tokens.len());
        let last = tokens.len().saturating_sub(1);
        batch.entries.extend(tokens.iter().enumerate().map(|(i, &token)| BatchEntry {
            token,
            pos: start + i as Pos,
            seq_id: 0,
            logits: i == last,
        }));
        batch
    }

    /// Single-token batch for one incremental decode step.
    pub fn single(token: TokenId, pos: Pos) -> Self {
        let mut batch = Self::for_prompt(&[token], pos);
        batch.prompt = false;
        batch
    }

    /// Whether this batch starts a prompt rather than feeding back a
    /// sampled token.
    pub fn is_prompt(&self) -> bool {
        self.prompt
    }

    /// Append a token. Fails once the batch is full.
    pub fn add(&mut self, token: TokenId, pos: Pos, seq_id: SeqId, logits: bool) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(LlamaError::BatchFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id,
            logits,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Position of the first entry.
    pub fn first_pos(&self) -> Option<Pos> {
        self.entries.first().map(|e| e.pos)
    }

    /// Position of the last entry.
    pub fn last_pos(&self) -> Option<Pos> {
        self.entries.last().map(|e| e.pos)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
