use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("{service} API error {status}: {body}")]
    ApiError {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;
