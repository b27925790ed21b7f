use std::time::Duration;

use any2json_domain::config::ProviderConfig;
use any2json_domain::model::ProviderUsage;
use any2json_domain::provider::{
    ExtractionProvider, ExtractionRequest, ExtractionResponse, ProviderError,
};
use async_trait::async_trait;
use reqwest::ClientBuilder;
use tracing::{debug, warn};

use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, ContentPart, ImageUrl, MessageContent,
};

/// Error bodies are truncated to this many characters before being surfaced.
const MAX_ERROR_DETAIL: usize = 512;

/// Calls a chat-completions endpoint with the image attached to the user turn.
#[derive(Debug, Clone)]
pub struct HttpExtractionProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpExtractionProvider {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key,
            timeout,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Self::new(
            config.api_url(),
            config.api_key().map(str::to_string),
            config.timeout(),
        )
    }

    fn map_send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl ExtractionProvider for HttpExtractionProvider {
    async fn extract(
        &self,
        request: ExtractionRequest,
    ) -> Result<ExtractionResponse, ProviderError> {
        let body = ChatRequest {
            model: &request.model,
            max_tokens: request.token_budget,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(&request.system_instruction),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: "Convert this image to JSON.",
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: &request.image_reference,
                            },
                        },
                    ]),
                },
            ],
        };

        let mut builder = self.client.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        debug!(model = request.model, budget = request.token_budget, "calling extraction provider");

        let response = builder.send().await.map_err(|err| self.map_send_error(err))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_DETAIL)
                .collect::<String>();
            warn!(status = status.as_u16(), "extraction provider rejected the call");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let payload: ChatResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::Malformed(err.to_string())
            }
        })?;

        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("response carried no message content".into()))?;
        let usage = payload.usage.unwrap_or_default();

        Ok(ExtractionResponse {
            content,
            usage: ProviderUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            model: payload.model,
        })
    }
}
