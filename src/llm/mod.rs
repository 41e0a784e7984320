pub mod client;
pub mod models;
pub mod parse;
pub mod prompts;

pub use client::{invoke_with_timeout, ModelClient, ModelError, ModelRequest, ModelResponse, OpenRouterClient};
pub use models::{merge_usage, ModelRole, Usage};
pub use parse::ParseError;
