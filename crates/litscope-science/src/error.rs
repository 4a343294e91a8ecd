use litscope_core::LitscopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScienceError {
    #[error("invalid DOI: {0}")]
    InvalidDoi(String),

    #[error("invalid ISBN: {0}")]
    InvalidIsbn(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error from {0}: {1}")]
    ApiError(String, String),

    #[error("rate limit from {0}, retry after {1}s")]
    RateLimit(String, u64),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("BibTeX error at line {line}: {message}")]
    Bibtex { line: u32, message: String },

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("identifier not found: {0}")]
    IdentifierNotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, ScienceError>;

impl From<ScienceError> for LitscopeError {
    fn from(err: ScienceError) -> Self {
        match err {
            ScienceError::Http(_)
            | ScienceError::ApiError(..)
            | ScienceError::RateLimit(..)
            | ScienceError::SourceUnavailable(_)
            | ScienceError::Runtime(_) => LitscopeError::ServiceNotAvailable(err.to_string()),
            ScienceError::IdentifierNotFound(id) => LitscopeError::RecordNotFoundInPrepSource(id),
            ScienceError::InvalidDoi(_) | ScienceError::InvalidIsbn(_) => {
                LitscopeError::NotEnoughDataToIdentify(err.to_string())
            }
            ScienceError::Parse(_) | ScienceError::Bibtex { .. } => {
                LitscopeError::RecordNotParsable(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_failures_disable_the_endpoint() {
        let err: LitscopeError = ScienceError::RateLimit("crossref".into(), 60).into();
        assert!(err.is_fatal_to_endpoint());

        let err: LitscopeError = ScienceError::IdentifierNotFound("10.1234/x".into()).into();
        assert!(err.is_skippable());
    }
}
