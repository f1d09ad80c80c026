//! Token counting service.
//!
//! Counting is injected into [`AiBridge`](crate::AiBridge) as an
//! `Arc<dyn TokenCounter>` instead of living in a process-wide tokenizer.
//! Implementations hold no per-request state.

use std::sync::Arc;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character-ratio approximation (about 4 characters per token for English).
#[derive(Debug, Clone)]
pub struct CharacterEstimator {
    chars_per_token: f64,
}

impl CharacterEstimator {
    pub fn new() -> Self {
        Self::with_ratio(4.0)
    }
    pub fn with_ratio(r: f64) -> Self {
        Self { chars_per_token: r }
    }
}

impl Default for CharacterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for CharacterEstimator {
    fn count(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Pick an estimator for `model`. Claude models tokenize slightly denser text.
pub fn counter_for_model(model: &str) -> Arc<dyn TokenCounter> {
    if model.to_lowercase().contains("claude") {
        Arc::new(CharacterEstimator::with_ratio(3.5))
    } else {
        Arc::new(CharacterEstimator::new())
    }
}
