use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid server url: {0}")]
    InvalidServerUrl(#[from] url::ParseError),
    #[error("failed to read form: {0}")]
    Form(String),
    #[error("request to extraction service failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("response was not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
