//! Contract with the external extraction provider.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ProviderUsage;

/// One extraction call: the image to analyse plus the instruction block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub model: String,
    pub token_budget: u32,
    pub system_instruction: String,
    /// Either an http(s) URL or a `data:` URI carrying the base64 payload.
    pub image_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResponse {
    /// Structured or free-form text exactly as returned.
    pub content: String,
    pub usage: ProviderUsage,
    /// Model that actually served the call, when the provider reports it.
    pub model: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(
        &self,
        request: ExtractionRequest,
    ) -> Result<ExtractionResponse, ProviderError>;
}
