use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No classification provider available: {0}")]
    ProviderUnavailable(String),

    #[error("No match found: {0}")]
    NoMatch(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    /// Stable machine-readable kind, used for per-record error accounting and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::ProviderUnavailable(_) => "provider_unavailable",
            PipelineError::NoMatch(_) => "no_match",
            PipelineError::ValidationFailed(_) => "validation_failed",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Internal(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_)
            | PipelineError::Toml(_)
            | PipelineError::Database(_)
            | PipelineError::Http(_) => "internal",
        }
    }

    /// Errors scoped to a single record; everything else aborts a run.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            PipelineError::ProviderUnavailable(_)
                | PipelineError::NoMatch(_)
                | PipelineError::ValidationFailed(_)
                | PipelineError::NotFound(_)
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PipelineError::Internal(message.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PipelineError::Internal(format!("lock poisoned: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(PipelineError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            PipelineError::ProviderUnavailable("x".into()).kind(),
            "provider_unavailable"
        );
        assert_eq!(PipelineError::NoMatch("x".into()).kind(), "no_match");
        let io = PipelineError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), "internal");
    }

    #[test]
    fn provider_failures_are_record_scoped() {
        assert!(PipelineError::ProviderUnavailable("all down".into()).is_record_scoped());
        assert!(!PipelineError::Internal("db gone".into()).is_record_scoped());
        assert!(!PipelineError::Timeout("grace".into()).is_record_scoped());
    }
}
