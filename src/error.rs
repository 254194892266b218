use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Vector search error: {0}")]
    VectorSearch(String),

    #[error("SQL generation failed: {0}")]
    GenerationFailed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl NlqError {
    /// Whether the error came from an auxiliary service being unreachable or slow.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, NlqError::ServiceUnavailable(_) | NlqError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, NlqError>;
