pub mod error;
pub mod layout_search;
pub mod llm;
pub mod pdf_parser;
pub mod pipeline;
pub mod preprocessor;

pub use error::ExtractError;
pub use llm::{LlmClient, MissingLlmClient, OpenAiClient, OpenAiConfig};
pub use pipeline::Pipeline;
