use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, error, warn};

use crate::error::ServiceError;
use crate::model::{ProviderUsage, UserId};
use crate::provider::{ExtractionProvider, ExtractionRequest, ProviderError};
use crate::storage::KvStore;

use super::metering::MeteringService;

pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// Body of a conversion call as posted by clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversionRequest {
    pub input: Option<String>,
    pub max_tokens: Option<u32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    Brief,
    Detailed,
    Comprehensive,
}

impl DetailLevel {
    pub fn for_budget(max_tokens: u32) -> Self {
        match max_tokens {
            0..=299 => DetailLevel::Brief,
            300..=999 => DetailLevel::Detailed,
            _ => DetailLevel::Comprehensive,
        }
    }

    fn description(self) -> &'static str {
        match self {
            DetailLevel::Brief => "brief: key facts only, one or two sentences",
            DetailLevel::Detailed => "detailed: all visible elements, full text, relationships",
            DetailLevel::Comprehensive => {
                "comprehensive: every detail, spatial relationships, colors, fonts"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Auto,
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Resolves the requested kind to the one actually processed.
    fn resolve(raw: Option<&str>) -> Result<Self, ServiceError> {
        let raw = raw.map(str::trim).filter(|value| !value.is_empty());
        let kind = match raw {
            None => MediaKind::Auto,
            Some(value) => value
                .to_ascii_lowercase()
                .parse()
                .map_err(|_| ServiceError::InvalidInput(format!("unknown type '{value}'")))?,
        };
        match kind {
            MediaKind::Auto | MediaKind::Image => Ok(MediaKind::Image),
            other => Err(ServiceError::InvalidInput(format!(
                "type '{}' not yet supported; supported: image",
                other.as_ref()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
enum ConversionStage {
    Received,
    Validated,
    ProviderCalled,
    ProviderSucceeded,
    ProviderFailed,
    ResultNormalized,
    Metered,
    Responded,
    ErrorResponded,
}

fn stage(user_id: &UserId, stage: ConversionStage) {
    debug!(user_id = %user_id, stage = stage.as_ref(), "conversion");
}

/// Image reference forwarded to the provider: a remote URL or a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Url(String),
    DataUri(String),
}

impl InputSource {
    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ServiceError::InvalidInput("input is required".into()));
        }
        if let Some(rest) = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"))
        {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            if host.is_empty() || raw.chars().any(char::is_whitespace) {
                return Err(invalid_input_source());
            }
            return Ok(InputSource::Url(raw.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("data:") {
            let (header, payload) = rest.split_once(',').ok_or_else(invalid_input_source)?;
            let media = header
                .strip_suffix(";base64")
                .ok_or_else(invalid_input_source)?;
            let subtype = media.strip_prefix("image/").ok_or_else(invalid_input_source)?;
            if subtype.is_empty() || STANDARD.decode(payload).is_err() {
                return Err(invalid_input_source());
            }
            return Ok(InputSource::DataUri(raw.to_string()));
        }

        let bytes = STANDARD.decode(raw).map_err(|_| invalid_input_source())?;
        let mime = sniff_image(&bytes).ok_or_else(invalid_input_source)?;
        Ok(InputSource::DataUri(format!("data:{mime};base64,{raw}")))
    }

    pub fn as_reference(&self) -> &str {
        match self {
            InputSource::Url(value) | InputSource::DataUri(value) => value,
        }
    }
}

fn invalid_input_source() -> ServiceError {
    ServiceError::InvalidInput(
        "input must be an http(s) URL or a base64-encoded image".into(),
    )
}

fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] => Some("image/bmp"),
        _ => None,
    }
}

fn default_schema() -> Value {
    json!({
        "summary": "brief description",
        "elements": [{"id": "string", "type": "string", "content": "string"}],
        "text": "any text found, or null",
        "metadata": {"dimensions": "string", "colors": ["string"]}
    })
}

fn schema_text(schema: Option<&Value>) -> Result<String, ServiceError> {
    match schema {
        None | Some(Value::Null) => Ok(default_schema().to_string()),
        Some(Value::Object(_)) => Ok(schema.map(Value::to_string).unwrap_or_default()),
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Some(_) => Err(ServiceError::InvalidInput(
            "schema must be a JSON object or a non-empty string".into(),
        )),
    }
}

fn instruction(level: DetailLevel, max_tokens: u32, schema: &str) -> String {
    format!(
        "Analyze this image and return JSON.\n\
         Detail level: {}\n\
         Target: ~{max_tokens} tokens output.\n\n\
         Return a single valid JSON object following this schema:\n{schema}\n\n\
         Be concise but complete within the token budget. Respond with JSON only.",
        level.description()
    )
}

/// Parses provider text as a JSON object, tolerating markdown code fences.
/// Anything else is wrapped as `{"raw": text}`.
pub fn normalize_output(content: &str) -> Map<String, Value> {
    let trimmed = content.trim();
    let body = strip_fences(trimmed);
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("raw".into(), Value::String(content.to_string()));
            map
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (`json`) on the opening fence line.
    let rest = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn tokens_used(usage: &ProviderUsage) -> u64 {
    if usage.total_tokens > 0 {
        usage.total_tokens
    } else {
        usage.prompt_tokens.saturating_add(usage.completion_tokens)
    }
}

/// Validates a conversion request, calls the extraction provider and bills
/// the caller for successful calls.
#[derive(Clone)]
pub struct ConversionService<S> {
    provider: Arc<dyn ExtractionProvider>,
    metering: MeteringService<S>,
    model: String,
    timeout: Duration,
}

impl<S: KvStore> ConversionService<S> {
    pub fn new(
        provider: Arc<dyn ExtractionProvider>,
        metering: MeteringService<S>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            metering,
            model: model.into(),
            timeout,
        }
    }

    pub async fn handle(
        &self,
        user_id: &UserId,
        request: ConversionRequest,
    ) -> Result<Value, ServiceError> {
        stage(user_id, ConversionStage::Received);
        let prepared = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(err) => {
                stage(user_id, ConversionStage::ErrorResponded);
                return Err(err);
            }
        };
        stage(user_id, ConversionStage::Validated);

        self.metering.ensure_user(user_id).await?;

        stage(user_id, ConversionStage::ProviderCalled);
        let response = match tokio::time::timeout(self.timeout, self.provider.extract(prepared))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.timeout)))
        {
            Ok(response) => response,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "extraction provider failed");
                stage(user_id, ConversionStage::ProviderFailed);
                stage(user_id, ConversionStage::ErrorResponded);
                return Err(err.into());
            }
        };
        stage(user_id, ConversionStage::ProviderSucceeded);

        let mut output = normalize_output(&response.content);
        stage(user_id, ConversionStage::ResultNormalized);

        let cost = self.metering.cost_of(&response.usage);
        if let Err(err) = self.metering.apply_usage(user_id, cost).await {
            error!(user_id = %user_id, cost, error = %err, "failed to record usage after provider success");
            stage(user_id, ConversionStage::ErrorResponded);
            return Err(ServiceError::Internal(format!("failed to record usage: {err}")));
        }
        stage(user_id, ConversionStage::Metered);

        output.insert(
            "_meta".into(),
            json!({
                "tokensUsed": tokens_used(&response.usage),
                "cost": cost,
                "model": response.model.unwrap_or_else(|| self.model.clone()),
                "processedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        );
        stage(user_id, ConversionStage::Responded);
        Ok(Value::Object(output))
    }

    fn prepare(&self, request: &ConversionRequest) -> Result<ExtractionRequest, ServiceError> {
        let source = InputSource::parse(request.input.as_deref().unwrap_or_default())?;
        MediaKind::resolve(request.kind.as_deref())?;
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 {
            return Err(ServiceError::InvalidInput(
                "max_tokens must be at least 1".into(),
            ));
        }
        let schema = schema_text(request.schema.as_ref())?;

        Ok(ExtractionRequest {
            model: self.model.clone(),
            token_budget: max_tokens,
            system_instruction: instruction(DetailLevel::for_budget(max_tokens), max_tokens, &schema),
            image_reference: source.as_reference().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::BillingConfig;
    use crate::model::{ApiKey, Email, Pricing, User};
    use crate::provider::ExtractionResponse;
    use crate::services::locks::KeyedLocks;
    use crate::storage::{user_key, InMemoryKvStore, Namespace};

    const PNG_HEADER: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    struct FakeProvider {
        reply: Result<ExtractionResponse, ProviderError>,
        delay: Duration,
        calls: Mutex<Vec<ExtractionRequest>>,
    }

    impl FakeProvider {
        fn replying(content: &str) -> Self {
            Self {
                reply: Ok(ExtractionResponse {
                    content: content.to_string(),
                    usage: ProviderUsage {
                        prompt_tokens: 1000,
                        completion_tokens: 200,
                        total_tokens: 1200,
                    },
                    model: Some("vision-1".into()),
                }),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: ProviderError) -> Self {
            Self {
                reply: Err(err),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ExtractionRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExtractionProvider for FakeProvider {
        async fn extract(
            &self,
            request: ExtractionRequest,
        ) -> Result<ExtractionResponse, ProviderError> {
            self.calls.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }
    }

    struct Harness {
        service: ConversionService<InMemoryKvStore>,
        metering: MeteringService<InMemoryKvStore>,
        provider: Arc<FakeProvider>,
        user: UserId,
    }

    async fn harness(provider: FakeProvider) -> Harness {
        let store = InMemoryKvStore::new();
        let user = UserId::new("u1");
        let record = User::new(
            user.clone(),
            Email::parse("a@x.com").unwrap(),
            "hash".into(),
            ApiKey::new("a2j_test"),
        );
        store
            .put(
                Namespace::Users,
                &user_key(&user),
                &serde_json::to_string(&record).unwrap(),
            )
            .await
            .unwrap();

        let billing = BillingConfig::new(
            Pricing {
                input_rate: 0.000_002,
                output_rate: 0.000_01,
            },
            1.5,
        )
        .unwrap();
        let metering = MeteringService::new(store, KeyedLocks::default(), billing);
        let provider = Arc::new(provider);
        let service = ConversionService::new(
            provider.clone(),
            metering.clone(),
            "configured-model",
            Duration::from_millis(200),
        );
        Harness {
            service,
            metering,
            provider,
            user,
        }
    }

    fn url_request() -> ConversionRequest {
        ConversionRequest {
            input: Some("https://example.com/cat.png".into()),
            ..Default::default()
        }
    }

    #[test]
    fn detail_level_follows_budget() {
        assert_eq!(DetailLevel::for_budget(1), DetailLevel::Brief);
        assert_eq!(DetailLevel::for_budget(299), DetailLevel::Brief);
        assert_eq!(DetailLevel::for_budget(300), DetailLevel::Detailed);
        assert_eq!(DetailLevel::for_budget(999), DetailLevel::Detailed);
        assert_eq!(DetailLevel::for_budget(1000), DetailLevel::Comprehensive);
    }

    #[test]
    fn input_sources_are_classified() {
        assert_eq!(
            InputSource::parse(" https://example.com/a.png ").unwrap(),
            InputSource::Url("https://example.com/a.png".into())
        );
        assert!(InputSource::parse("https:///nohost").is_err());
        assert!(InputSource::parse("http://exa mple.com").is_err());

        let uri = format!("data:image/png;base64,{}", STANDARD.encode(PNG_HEADER));
        assert_eq!(
            InputSource::parse(&uri).unwrap(),
            InputSource::DataUri(uri.clone())
        );
        assert!(InputSource::parse("data:text/plain;base64,aGVsbG8=").is_err());
        assert!(InputSource::parse("data:image/png;base64,%%%").is_err());

        let raw = STANDARD.encode(PNG_HEADER);
        assert_eq!(
            InputSource::parse(&raw).unwrap(),
            InputSource::DataUri(format!("data:image/png;base64,{raw}"))
        );
        assert!(InputSource::parse(&STANDARD.encode("plain text")).is_err());
        assert!(InputSource::parse("hello world").is_err());
        assert!(InputSource::parse("").is_err());
    }

    #[test]
    fn output_normalization() {
        let fenced = "```json\n{\"summary\": \"a cat\"}\n```";
        assert_eq!(normalize_output(fenced)["summary"], "a cat");
        assert_eq!(normalize_output("{\"a\": 1}")["a"], 1);
        assert_eq!(normalize_output("A cat on a mat.")["raw"], "A cat on a mat.");
        assert_eq!(normalize_output("[1, 2]")["raw"], "[1, 2]");
    }

    #[test]
    fn token_count_prefers_total_and_saturates() {
        let reported = ProviderUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 20,
        };
        assert_eq!(tokens_used(&reported), 20);

        let summed = ProviderUsage {
            total_tokens: 0,
            ..reported
        };
        assert_eq!(tokens_used(&summed), 15);

        let huge = ProviderUsage {
            prompt_tokens: u64::MAX,
            completion_tokens: 1,
            total_tokens: 0,
        };
        assert_eq!(tokens_used(&huge), u64::MAX);
    }

    #[tokio::test]
    async fn successful_conversion_is_billed_once() {
        let h = harness(FakeProvider::replying(
            "```json\n{\"summary\": \"a cat\", \"elements\": []}\n```",
        ))
        .await;

        let output = h.service.handle(&h.user, url_request()).await.unwrap();
        assert_eq!(output["summary"], "a cat");

        let expected = (1000.0 * 0.000_002 + 200.0 * 0.000_01) * 1.5;
        let meta = &output["_meta"];
        assert_eq!(meta["tokensUsed"], 1200);
        assert_eq!(meta["cost"].as_f64().unwrap(), expected);
        assert_eq!(meta["model"], "vision-1");
        assert!(meta["processedAt"].as_str().unwrap().ends_with('Z'));

        let user = h.metering.ensure_user(&h.user).await.unwrap();
        assert_eq!(user.used, expected);

        let calls = h.provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].token_budget, DEFAULT_MAX_TOKENS);
        assert_eq!(calls[0].model, "configured-model");
        assert_eq!(calls[0].image_reference, "https://example.com/cat.png");
        assert!(calls[0].system_instruction.contains("detailed"));
        assert!(calls[0].system_instruction.contains("\"elements\""));
    }

    #[tokio::test]
    async fn unparseable_output_falls_back_to_raw_and_still_bills() {
        let h = harness(FakeProvider::replying("just prose")).await;
        let output = h.service.handle(&h.user, url_request()).await.unwrap();
        assert_eq!(output["raw"], "just prose");
        assert!(output["_meta"].is_object());
        assert!(h.metering.ensure_user(&h.user).await.unwrap().used > 0.0);
    }

    #[tokio::test]
    async fn provider_failure_is_not_billed() {
        let h = harness(FakeProvider::failing(ProviderError::Status {
            status: 500,
            detail: "upstream exploded".into(),
        }))
        .await;

        let err = h.service.handle(&h.user, url_request()).await.unwrap_err();
        match err {
            ServiceError::Gateway { detail } => assert!(detail.contains("upstream exploded")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(h.metering.ensure_user(&h.user).await.unwrap().used, 0.0);
    }

    #[tokio::test]
    async fn slow_provider_times_out_without_charge() {
        let mut provider = FakeProvider::replying("{}");
        provider.delay = Duration::from_secs(5);
        let h = harness(provider).await;

        let err = h.service.handle(&h.user, url_request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Gateway { .. }));
        assert_eq!(h.metering.ensure_user(&h.user).await.unwrap().used, 0.0);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_provider() {
        let h = harness(FakeProvider::replying("{}")).await;
        let cases = [
            ConversionRequest {
                input: Some("hello world".into()),
                ..Default::default()
            },
            ConversionRequest::default(),
            ConversionRequest {
                kind: Some("video".into()),
                ..url_request()
            },
            ConversionRequest {
                max_tokens: Some(0),
                ..url_request()
            },
            ConversionRequest {
                schema: Some(json!([1, 2])),
                ..url_request()
            },
        ];
        for request in cases {
            assert!(matches!(
                h.service.handle(&h.user, request).await.unwrap_err(),
                ServiceError::InvalidInput(_)
            ));
        }
        assert!(h.provider.calls().is_empty());
        assert_eq!(h.metering.ensure_user(&h.user).await.unwrap().used, 0.0);
    }

    #[tokio::test]
    async fn caller_schema_and_budget_shape_the_instruction() {
        let h = harness(FakeProvider::replying("{}")).await;
        let request = ConversionRequest {
            max_tokens: Some(100),
            kind: Some("Image".into()),
            schema: Some(json!({"title": "string"})),
            ..url_request()
        };
        h.service.handle(&h.user, request).await.unwrap();

        let calls = h.provider.calls();
        assert_eq!(calls[0].token_budget, 100);
        assert!(calls[0].system_instruction.contains("brief"));
        assert!(calls[0].system_instruction.contains("\"title\""));
        assert!(!calls[0].system_instruction.contains("\"elements\""));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let h = harness(FakeProvider::replying("{}")).await;
        let err = h
            .service
            .handle(&UserId::new("ghost"), url_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(h.provider.calls().is_empty());
    }
}
