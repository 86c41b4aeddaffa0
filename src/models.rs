use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::Settings;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Longest pause between retries. A `Retry-After` above it ends the call.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Well-known local servers that speak the OpenAI chat API.
pub const LOCAL_SERVERS: &[(&str, &str)] = &[
    ("LM Studio", "http://localhost:1234/v1"),
    ("Ollama", "http://localhost:11434/v1"),
    ("Text Generation WebUI", "http://localhost:5000/v1"),
    ("LocalAI", "http://localhost:8080/v1"),
];

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("cannot connect to {base_url}")]
    Connection {
        base_url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {base_url} timed out")]
    Timeout { base_url: String },

    #[error("rate limited by the model endpoint")]
    RateLimited { retry_after: Option<u64> },

    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("unexpected response from model endpoint")]
    Decode(#[source] reqwest::Error),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_model_not_found(&self) -> bool {
        matches!(self, LlmError::Status { status: 404, .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, LlmError>;
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub max_retry_wait: Duration,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            max_retries: 0,
            max_retry_wait: MAX_RETRY_WAIT,
            client,
        })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut model = Self::new(&settings.base_url, settings.api_key.clone(), settings.request_timeout)?;
        model.max_retries = settings.max_retries;
        model.max_retry_wait = MAX_RETRY_WAIT.min(settings.request_timeout);
        Ok(model)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/models", self.base_url);
        let mut rb = self.client.get(url);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await.map_err(|e| self.transport_error(e))?;
        let resp = check_status(resp).await?;
        let list: OaiModelList = resp.json().await.map_err(LlmError::Decode)?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn send_once(&self, body: &OaiChatRequest<'_>) -> Result<OaiChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut rb = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await.map_err(|e| self.transport_error(e))?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(LlmError::Decode)
    }

    fn transport_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout { base_url: self.base_url.clone() }
        } else {
            LlmError::Connection { base_url: self.base_url.clone(), source: err }
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(LlmError::RateLimited { retry_after });
    }
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::Status { status: status.as_u16(), body: body.chars().take(500).collect() })
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiModelList { data: Vec<OaiModel> }

#[derive(Debug, Deserialize)]
struct OaiModel { id: String }

#[async_trait]
impl LanguageModel for OpenAICompatible {
    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, LlmError> {
        let body = OaiChatRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: false,
        };
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        let v = loop {
            match self.send_once(&body).await {
                Ok(v) => break v,
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let asked = match &err {
                        LlmError::RateLimited { retry_after: Some(secs) } => Some(Duration::from_secs(*secs)),
                        _ => None,
                    };
                    if let Some(asked) = asked.filter(|a| *a > self.max_retry_wait) {
                        tracing::warn!(retry_after_secs = asked.as_secs(), "retry-after exceeds the retry wait limit");
                        return Err(err);
                    }
                    let wait = asked.map_or(backoff, |a| a.max(backoff)).min(self.max_retry_wait);
                    tracing::warn!(error = %err, attempt, wait_ms = wait.as_millis() as u64, "retrying model call");
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        };
        let content = v
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(ModelResponse { content, model: v.model.unwrap_or(req.model) })
    }
}

/// Returns the first server in `candidates` that answers `/models` with at
/// least one model, as `(name, base_url, first_model_id)`.
pub async fn detect_local_server(candidates: &[(&str, &str)]) -> Option<(String, String, String)> {
    for (name, base_url) in candidates {
        let Ok(client) = OpenAICompatible::new(*base_url, None, Duration::from_secs(3)) else { continue };
        match client.list_models().await {
            Ok(models) if !models.is_empty() => {
                tracing::info!(server = %name, %base_url, models = models.len(), "found local model server");
                return Some((name.to_string(), base_url.to_string(), models[0].clone()));
            }
            Ok(_) => tracing::debug!(server = %name, "server has no models loaded"),
            Err(err) => tracing::debug!(server = %name, error = %err, "server not reachable"),
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use serde_json::json;

    fn request(messages: Vec<ChatMessage>) -> ModelRequest {
        ModelRequest { model: "fake-model".into(), messages, temperature: Some(0.7), max_tokens: Some(64) }
    }

    #[tokio::test]
    async fn generate_sends_messages_and_trims_content() {
        let ep = FakeEndpoint::with_contents(&["  hello there \n"]);
        let base = ep.clone().spawn().await;
        let client = OpenAICompatible::new(base, Some("sk-test".into()), Duration::from_secs(5)).unwrap();

        let resp = client
            .generate(request(vec![ChatMessage::system("be brief"), ChatMessage::user("hi")]))
            .await
            .unwrap();

        assert_eq!(resp.content, "hello there");
        assert_eq!(resp.model, "fake-model");
        let sent = ep.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["messages"][0]["role"], "system");
        assert_eq!(sent[0]["messages"][1]["content"], "hi");
        assert_eq!(sent[0]["max_tokens"], 64);
        assert_eq!(sent[0]["stream"], false);
    }

    #[tokio::test]
    async fn empty_choices_are_an_error() {
        let ep = FakeEndpoint::with_replies(vec![(AxumStatus::OK, json!({"model": "m", "choices": []}))]);
        let base = ep.spawn().await;
        let client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        let err = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }

    #[tokio::test]
    async fn rate_limit_is_retried_then_succeeds() {
        let ep = FakeEndpoint::with_replies(vec![
            (AxumStatus::TOO_MANY_REQUESTS, json!({"error": "slow down"})),
            (AxumStatus::OK, json!({"model": "m", "choices": [{"message": {"content": "ok"}}]})),
        ]);
        let base = ep.clone().spawn().await;
        let mut client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        client.max_retries = 1;

        let resp = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(ep.requests().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_without_retries_is_reported() {
        let ep = FakeEndpoint::with_replies(vec![(AxumStatus::TOO_MANY_REQUESTS, json!({}))]);
        let base = ep.spawn().await;
        let client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        let err = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
    }

    fn ok_reply(content: &str) -> (AxumStatus, serde_json::Value) {
        (AxumStatus::OK, json!({"model": "m", "choices": [{"message": {"content": content}}]}))
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let ep = FakeEndpoint::with_replies(vec![
            (AxumStatus::SERVICE_UNAVAILABLE, json!({"error": "loading model"})),
            ok_reply("ready"),
        ]);
        let base = ep.clone().spawn().await;
        let mut client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        client.max_retries = 2;

        let resp = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap();
        assert_eq!(resp.content, "ready");
        assert_eq!(ep.requests().len(), 2);
    }

    #[tokio::test]
    async fn persistent_rate_limit_gives_up_after_max_retries() {
        let ep = FakeEndpoint::with_replies(vec![(AxumStatus::TOO_MANY_REQUESTS, json!({}))]);
        let base = ep.clone().spawn().await;
        let mut client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        client.max_retries = 2;

        let err = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { retry_after: None }));
        assert_eq!(ep.requests().len(), 3);
    }

    #[tokio::test]
    async fn retry_after_is_waited_out() {
        let ep = FakeEndpoint::with_replies(vec![(AxumStatus::TOO_MANY_REQUESTS, json!({})), ok_reply("ok")])
            .retry_after(1);
        let base = ep.clone().spawn().await;
        let mut client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        client.max_retries = 1;

        let started = std::time::Instant::now();
        let resp = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert!(started.elapsed() >= Duration::from_millis(950));
        assert_eq!(ep.requests().len(), 2);
    }

    #[tokio::test]
    async fn retry_after_beyond_the_limit_is_not_slept() {
        let ep = FakeEndpoint::with_replies(vec![(AxumStatus::TOO_MANY_REQUESTS, json!({})), ok_reply("ok")])
            .retry_after(86_400);
        let base = ep.clone().spawn().await;
        let mut client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        client.max_retries = 2;

        let started = std::time::Instant::now();
        let err = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { retry_after: Some(86_400) }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ep.requests().len(), 1);
    }

    #[test]
    fn retry_wait_limit_follows_request_timeout() {
        use crate::settings::{resolve_settings, EnvDefaults, Overrides};
        let env = EnvDefaults { request_timeout_secs: Some("10".into()), ..Default::default() };
        let settings = resolve_settings(&env, &Overrides { local: true, ..Default::default() }).unwrap();
        let client = OpenAICompatible::from_settings(&settings).unwrap();
        assert_eq!(client.max_retry_wait, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let ep = FakeEndpoint::with_replies(vec![(AxumStatus::NOT_FOUND, json!({"error": "model not found"}))]);
        let base = ep.clone().spawn().await;
        let mut client = OpenAICompatible::new(base, None, Duration::from_secs(5)).unwrap();
        client.max_retries = 3;
        let err = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap_err();
        assert!(err.is_model_not_found());
        assert_eq!(ep.requests().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let base = unreachable_base_url().await;
        let client = OpenAICompatible::new(base.clone(), None, Duration::from_secs(5)).unwrap();
        let err = client.generate(request(vec![ChatMessage::user("hi")])).await.unwrap_err();
        match err {
            LlmError::Connection { base_url, .. } => assert_eq!(base_url, base),
            other => panic!("expected connection error, got {other}"),
        }
    }

    #[tokio::test]
    async fn list_models_and_detect_local_server() {
        let base = FakeEndpoint::with_contents(&["x"]).spawn().await;
        let client = OpenAICompatible::new(base.clone(), None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.list_models().await.unwrap(), vec!["fake-model".to_string()]);

        let dead = unreachable_base_url().await;
        let found = detect_local_server(&[("dead", dead.as_str()), ("fake", base.as_str())]).await;
        let (name, url, model) = found.unwrap();
        assert_eq!(name, "fake");
        assert_eq!(url, base);
        assert_eq!(model, "fake-model");
    }
}
