use thiserror::Error;

/// Errors surfaced by [`crate::AvCheckClient`].
///
/// Every failure path returns one of these immediately; the client never
/// retries or swallows an error.
#[derive(Debug, Error)]
pub enum AvCheckError {
    #[error("AvCheck API key must be provided via AVCHECK_API_KEY")]
    ApiKeyMissing,
    #[error("invalid task input: {0}")]
    InvalidInput(String),
    #[error("invalid response from AvCheck: {0}")]
    InvalidResponse(String),
    #[error("task `{task_id}` not found")]
    TaskNotFound { task_id: String },
    #[error("engine `{engine}` not present in task results")]
    EngineNotFound { engine: String },
    #[error("task `{task_id}` still pending after {polls} status request(s)")]
    TaskIncomplete { task_id: String, polls: u32 },
    #[error("AvCheck request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl AvCheckError {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }
}

pub type Result<T, E = AvCheckError> = std::result::Result<T, E>;
