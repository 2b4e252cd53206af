//! Shared output-size policy for tool results.
//!
//! Head truncation by lines, then by bytes on a line boundary.

use crate::config::LoopConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationPolicy {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl TruncationPolicy {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self { max_lines, max_bytes }
    }

    pub fn from_config(config: &LoopConfig) -> Self {
        Self::new(config.tool_output_max_lines, config.tool_output_max_bytes)
    }

    /// Truncated text with the notice appended when anything was cut.
    pub fn apply(&self, text: &str) -> String {
        let result = truncate_head(text, self.max_lines, self.max_bytes);
        match result.notice() {
            Some(notice) => format!("{}{}", result.text, notice),
            None => result.text,
        }
    }
}

impl Default for TruncationPolicy {
    fn default() -> Self {
        Self::from_config(&LoopConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationResult {
    pub text: String,
    pub was_truncated: bool,
    pub lines_shown: usize,
    pub lines_total: usize,
    pub bytes_shown: usize,
    pub bytes_total: usize,
}

impl TruncationResult {
    pub fn notice(&self) -> Option<String> {
        if !self.was_truncated {
            return None;
        }
        Some(format!(
            "\n\n[Output truncated: showed {} of {} lines ({}/{} bytes)]",
            self.lines_shown, self.lines_total, self.bytes_shown, self.bytes_total,
        ))
    }
}

/// Keep the first `max_lines` lines, then at most `max_bytes` bytes.
pub fn truncate_head(text: &str, max_lines: usize, max_bytes: usize) -> TruncationResult {
    let bytes_total = text.len();
    let lines: Vec<&str> = text.lines().collect();
    let lines_total = lines.len();

    if lines_total <= max_lines && bytes_total <= max_bytes {
        return TruncationResult {
            text: text.to_string(),
            was_truncated: false,
            lines_shown: lines_total,
            lines_total,
            bytes_shown: bytes_total,
            bytes_total,
        };
    }

    let joined = lines[..lines_total.min(max_lines)].join("\n");
    let kept = if joined.len() > max_bytes {
        let mut cut = max_bytes;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        let end = joined[..cut].rfind('\n').unwrap_or(cut);
        joined[..end].to_string()
    } else {
        joined
    };

    TruncationResult {
        lines_shown: kept.lines().count(),
        bytes_shown: kept.len(),
        text: kept,
        was_truncated: true,
        lines_total,
        bytes_total,
    }
}
