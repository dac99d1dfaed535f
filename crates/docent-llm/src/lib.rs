//! Completion and embedding provider abstraction with Ollama and OpenAI-compatible backends.

pub mod any;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use any::AnyProvider;
pub use error::LlmError;
pub use provider::{CompletionOptions, LlmProvider, Message, Role};
