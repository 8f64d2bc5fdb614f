use thiserror::Error;

/// Transport-level errors from the draw API.
///
/// These never escape [`DrawClient::submit`](crate::DrawClient::submit) or
/// [`DrawClient::poll`](crate::DrawClient::poll); they are folded into a
/// `{code: -1}` envelope there. Task units see them through the `try_*`
/// variants so consecutive failures can be counted.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The API returned a non-success HTTP status.
    #[error("Draw API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The response body was not the expected JSON.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Why a task unit finished without producing an image.
///
/// Each variant maps to the short reason string shown to the user via
/// [`TaskFailure::short_reason`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The API rejected the submission with a non-zero code.
    #[error("{0}")]
    SubmissionFailed(String),

    /// The submission request itself could not be completed.
    #[error("{0}")]
    SubmissionException(String),

    /// Polling hit the consecutive transport failure limit.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Polling returned a non-zero code other than "not ready".
    #[error("{0}")]
    ApiError(String),

    /// The result image could not be fetched or written.
    #[error("{0}")]
    DownloadFailed(String),

    /// The job succeeded but carried no result images.
    #[error("No results found")]
    NoResults,

    /// The poll payload could not be interpreted.
    #[error("{0}")]
    ProcessingError(String),

    /// The remote job itself failed.
    #[error("{reason}")]
    JobFailed {
        reason: String,
        detail: Option<String>,
    },
}

impl TaskFailure {
    /// Short human-readable reason, as shown next to a failed task.
    pub fn short_reason(&self) -> &str {
        match self {
            TaskFailure::SubmissionFailed(_) => "Submission failed",
            TaskFailure::SubmissionException(_) => "Submission Exception",
            TaskFailure::NetworkError(_) => "Network Error",
            TaskFailure::ApiError(_) => "API Error",
            TaskFailure::DownloadFailed(_) => "Download Failed",
            TaskFailure::NoResults => "No Results",
            TaskFailure::ProcessingError(_) => "Processing Error",
            TaskFailure::JobFailed { reason, .. } => reason,
        }
    }
}

/// Errors from the local history ledger.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for HistoryError {
    fn from(err: anyhow::Error) -> Self {
        HistoryError::Other(format!("{:#}", err))
    }
}

/// Errors from loading or saving the application config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_reasons() {
        assert_eq!(
            TaskFailure::SubmissionFailed("bad".into()).short_reason(),
            "Submission failed"
        );
        assert_eq!(TaskFailure::NoResults.short_reason(), "No Results");
        assert_eq!(
            TaskFailure::NetworkError("timeout".into()).short_reason(),
            "Network Error"
        );
        let failed = TaskFailure::JobFailed {
            reason: "content_policy".into(),
            detail: Some("flagged".into()),
        };
        assert_eq!(failed.short_reason(), "content_policy");
        assert_eq!(failed.to_string(), "content_policy");
    }

    #[test]
    fn test_no_results_message() {
        assert_eq!(TaskFailure::NoResults.to_string(), "No results found");
    }

    #[test]
    fn test_api_error_messages() {
        let http = ApiError::Http {
            status: 404,
            body: "gone".into(),
        };
        assert_eq!(http.to_string(), "Draw API returned HTTP 404: gone");
        assert_eq!(
            ApiError::InvalidResponse("empty body".into()).to_string(),
            "Invalid response: empty body"
        );
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err = anyhow::anyhow!("disk full").context("Failed to insert history row");
        let converted: HistoryError = err.into();
        let msg = converted.to_string();
        assert!(msg.contains("Failed to insert history row"));
        assert!(msg.contains("disk full"));
    }
}
