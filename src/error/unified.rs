//! Error classification.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Aborted,
    Authentication,
    RateLimit,
    Server,
    Api,
    OutputLength,
    Busy,
    Permission,
    NotFound,
    Storage,
    Configuration,
    Serialization,
    ToolExecution,
    InvalidInput,
    InvalidState,
    Unknown,
}
