//! Token usage tracking types.

use serde::{Deserialize, Serialize};

/// Token usage for one model call, or accumulated over several.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    /// Tokens occupying the context window after this call.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    /// Merge another usage into this one (accumulate).
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_counts_cache_traffic() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            reasoning_tokens: 3,
            cache_read_tokens: 100,
            cache_write_tokens: 7,
        };
        assert_eq!(usage.total(), 122);
    }

    #[test]
    fn merge_accumulates() {
        let mut usage = Usage::new(1, 2);
        usage.merge(&Usage::new(3, 4));
        assert_eq!(usage, Usage::new(4, 6));
    }
}
