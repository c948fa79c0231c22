//! # llama-sampling
//!
//! Token selection for llama-rag.
//!
//! A decode step produces one logit per vocabulary entry. The generation loop
//! wraps them in a [`TokenDataArray`] and hands it to a [`TokenSampler`], which
//! marks the chosen candidate. Only greedy (argmax) selection ships today; the
//! trait is the seam for other strategies.

use llama_engine::TokenId;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    NoValidTokens,
    SelectionOutOfRange { selected: usize, len: usize },
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens to select"),
            SamplingError::SelectionOutOfRange { selected, len } => {
                write!(f, "Selected index {selected} outside {len} candidates")
            }
        }
    }
}

impl std::error::Error for SamplingError {}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// One vocabulary candidate for the current step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    /// Probability slot for strategies that normalize; greedy leaves it at 0.
    pub p: f32,
}

/// Candidate set for one decode step plus the sampler's choice.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDataArray {
    pub data: Vec<TokenData>,
    /// Index into `data` chosen by the sampler.
    pub selected: Option<usize>,
    pub sorted: bool,
}

impl TokenDataArray {
    /// Pair every vocabulary id with its logit.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            selected: None,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Token ID of the selected candidate, checked against the array bounds.
    pub fn selected_token(&self) -> SamplingResult<TokenId> {
        match self.selected {
            None => Err(SamplingError::NoValidTokens),
            Some(idx) if idx >= self.data.len() => Err(SamplingError::SelectionOutOfRange {
                selected: idx,
                len: self.data.len(),
            }),
            Some(idx) => Ok(self.data[idx].id),
        }
    }
}

/// A token selection strategy.
pub trait TokenSampler: Send {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    /// Mark the chosen candidate in `candidates.selected`.
    fn apply(&mut self, candidates: &mut TokenDataArray);

    /// Apply and return the selected token ID.
    fn sample(&mut self, candidates: &mut TokenDataArray) -> SamplingResult<TokenId> {
        if candidates.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        self.apply(candidates);
        candidates.selected_token()
    }
}

/// Argmax selection. Deterministic: on equal logits the lowest index wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl GreedySampler {
    pub fn new() -> Self {
        Self
    }
}

impl TokenSampler for GreedySampler {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn apply(&mut self, candidates: &mut TokenDataArray) {
        if candidates.data.is_empty() {
            candidates.selected = None;
            return;
        }
        let mut best = 0;
        for (i, cand) in candidates.data.iter().enumerate().skip(1) {
            if cand.logit > candidates.data[best].logit {
                best = i;
            }
        }
        candidates.selected = Some(best);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_logits_pairs_ids() {
        let arr = TokenDataArray::from_logits(&[0.5, -1.0, 2.0]);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.data[2].id, 2);
        assert_eq!(arr.data[1].logit, -1.0);
        assert!(arr.data.iter().all(|d| d.p == 0.0));
        assert_eq!(arr.selected, None);
        assert!(!arr.sorted);
    }

    #[test]
    fn greedy_sampling() {
        let mut arr = TokenDataArray::from_logits(&[1.0, 10.0, 2.0, 0.5]);
        let token = GreedySampler::new().sample(&mut arr).unwrap();
        assert_eq!(token, 1);
        assert_eq!(arr.selected, Some(1));
    }

    #[test]
    fn greedy_ties_pick_first() {
        let mut arr = TokenDataArray::from_logits(&[3.0, 7.0, 7.0, 1.0]);
        assert_eq!(GreedySampler.sample(&mut arr).unwrap(), 1);
    }

    #[test]
    fn greedy_handles_all_negative() {
        let mut arr = TokenDataArray::from_logits(&[-5.0, -1.0, -3.0]);
        assert_eq!(GreedySampler.sample(&mut arr).unwrap(), 1);
    }

    #[test]
    fn empty_logits() {
        let mut arr = TokenDataArray::from_logits(&[]);
        assert_eq!(
            GreedySampler.sample(&mut arr),
            Err(SamplingError::InvalidLogits)
        );
        GreedySampler.apply(&mut arr);
        assert_eq!(arr.selected, None);
    }

    #[test]
    fn out_of_range_selection_is_rejected() {
        let mut arr = TokenDataArray::from_logits(&[1.0, 2.0]);
        arr.selected = Some(5);
        assert_eq!(
            arr.selected_token(),
            Err(SamplingError::SelectionOutOfRange { selected: 5, len: 2 })
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(
            SamplingError::NoValidTokens.to_string(),
            "No valid tokens to select"
        );
        assert_eq!(
            SamplingError::SelectionOutOfRange { selected: 3, len: 2 }.to_string(),
            "Selected index 3 outside 2 candidates"
        );
    }
}
