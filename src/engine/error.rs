use chrono::NaiveDateTime;
use serde::Serialize;
use ulid::Ulid;

use super::conflict::ConflictReport;

/// Flat classification of [`EngineError`], used in outcomes and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Input,
    Range,
    EmptyResult,
    Conflict,
    NotFound,
    Concurrency,
    Storage,
    LimitExceeded,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Range => "range",
            ErrorKind::EmptyResult => "empty_result",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Storage => "storage",
            ErrorKind::LimitExceeded => "limit_exceeded",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("out of range: {0}")]
    Range(String),
    #[error("rule produced no bookable sessions ({dropped} dropped inside the lead-time buffer)")]
    EmptyResult { dropped: usize },
    #[error("{0}")]
    Conflict(Box<ConflictReport>),
    #[error("series not found: {0}")]
    SeriesNotFound(Ulid),
    #[error("series {series_id} has no occurrence starting at {start}")]
    OccurrenceNotFound { series_id: Ulid, start: NaiveDateTime },
    #[error("concurrency: {0}")]
    Concurrency(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Input(_) => ErrorKind::Input,
            EngineError::Range(_) => ErrorKind::Range,
            EngineError::EmptyResult { .. } => ErrorKind::EmptyResult,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::SeriesNotFound(_) | EngineError::OccurrenceNotFound { .. } => ErrorKind::NotFound,
            EngineError::Concurrency(_) => ErrorKind::Concurrency,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
        }
    }

    /// Only lock timeouts and lost commit races are worth replaying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Concurrency(_))
    }

    pub fn conflict(&self) -> Option<&ConflictReport> {
        match self {
            EngineError::Conflict(report) => Some(report),
            _ => None,
        }
    }
}

impl From<ConflictReport> for EngineError {
    fn from(report: ConflictReport) -> Self {
        EngineError::Conflict(Box::new(report))
    }
}
