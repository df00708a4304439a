pub mod client;
pub mod types;

pub use client::OpenAIClient;
pub use types::*;

pub use crate::models::openai::*;
