//! Handler error classification
//!
//! Handlers return `HandlerError`; the dispatch layer only needs to know
//! whether the failure may be retried. Anything converted from a plain
//! `anyhow::Error` is retryable; `HandlerError::fatal` bypasses the retry
//! budget and sends the row straight to `FAILED`.

#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct HandlerError {
    #[source]
    source: anyhow::Error,
    retryable: bool,
}

impl HandlerError {
    pub fn retryable(source: impl Into<anyhow::Error>) -> Self {
        Self {
            source: source.into(),
            retryable: true,
        }
    }

    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            source: source.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.source
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::retryable(err)
    }
}

/// Classify the error side of a `Result` inline.
pub trait HandlerResultExt<T> {
    fn fatal(self) -> Result<T, HandlerError>;
    fn retryable(self) -> Result<T, HandlerError>;
}

impl<T, E> HandlerResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn fatal(self) -> Result<T, HandlerError> {
        self.map_err(HandlerError::fatal)
    }

    fn retryable(self) -> Result<T, HandlerError> {
        self.map_err(HandlerError::retryable)
    }
}
