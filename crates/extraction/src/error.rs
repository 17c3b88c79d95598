use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read PDF: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("PDF has no pages")]
    EmptyDocument,
    #[error("LLM request failed: {0}")]
    Llm(String),
    #[error("layout memory error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ExtractError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Pdf(_) | Self::EmptyDocument => ErrorCode::Pdf,
            Self::Llm(_) => ErrorCode::Llm,
            Self::Storage(_) => ErrorCode::Storage,
        }
    }
}

impl From<&ExtractError> for ApiError {
    fn from(value: &ExtractError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}

impl From<reqwest::Error> for ExtractError {
    fn from(value: reqwest::Error) -> Self {
        Self::Llm(value.to_string())
    }
}
