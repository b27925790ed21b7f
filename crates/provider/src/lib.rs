//! HTTP client for the external extraction provider. Speaks the
//! OpenAI-compatible chat-completions format with an image attachment.

mod client;
mod types;

pub use client::HttpExtractionProvider;
