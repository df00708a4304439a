//! A small OpenAI / Azure OpenAI chat-completion client.
//!
//! This crate exists to give the drafting and sanity oracles a single
//! provider-agnostic [`client::LlmClient`] trait, so the pipeline never
//! depends on a concrete HTTP client directly.
//!
//! ```rust,no_run
//! use pg_gateway_llm::openai::OpenAIClient;
//! use pg_gateway_llm::client::LlmClient;
//! use pg_gateway_llm::types::{CompletionRequest, Message};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OpenAIClient::new("your-openai-api-key")?;
//! let response = client
//!     .complete(CompletionRequest {
//!         messages: vec![Message::user("Hello!")],
//!         max_tokens: 256,
//!         model: "gpt-4o-mini".to_string(),
//!         system: None,
//!         temperature: Some(0.0),
//!         top_p: None,
//!         stop_sequences: None,
//!         response_format: None,
//!     })
//!     .await?;
//! println!("{:?}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
pub mod openai;
pub mod providers;
pub mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAIClient;
