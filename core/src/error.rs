use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("source error from {connector}: {details}")]
    Source { connector: String, details: String },

    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimit { retry_after_secs: u64 },

    #[error("cache unavailable: {0}")]
    Cache(String),

    #[error("conditional write conflict for key: {0}")]
    Conflict(String),

    #[error("output delivery failed: {0}")]
    Output(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors worth retrying on a later trigger without operator involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::RateLimit { .. }
                | Error::Source { .. }
                | Error::Cache(_)
                | Error::Output(_)
                | Error::Conflict(_)
                | Error::Io(_)
        )
    }

    /// Errors that require a configuration or credential change to clear.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Auth(_) | Error::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let transient = Error::RateLimit { retry_after_secs: 30 };
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let fatal = Error::Auth("token rejected".to_string());
        assert!(fatal.is_fatal());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn conflict_is_retryable_not_fatal() {
        let conflict = Error::Conflict("pointer/rest/corp".to_string());
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal());
    }
}
