use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::embed::{BoxFuture, EmbeddingProvider};
use crate::error::LlmError;
use crate::provider::{
    ChatRequest, ChatResponse, ChatStream, LlmProvider, Role, TokenUsage, estimate_tokens,
};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, send_with_retry};
use crate::sse::openai_sse_to_stream;

const PROVIDER: &str = "openai";

fn trim_base_url(mut base_url: String) -> String {
    while base_url.ends_with('/') {
        base_url.pop();
    }
    base_url
}

fn authorize(builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        builder
    } else {
        builder.header("Authorization", format!("Bearer {api_key}"))
    }
}

/// Chat completions against any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    retry: RetryPolicy,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("retry", &self.retry)
            .finish()
    }
}

impl OpenAiProvider {
    #[must_use]
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: crate::http::default_client(),
            api_key,
            base_url: trim_base_url(base_url),
            model,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post_chat(&self, body: &ApiChatRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = send_with_retry(PROVIDER, &self.retry, || {
            authorize(self.client.post(&url), &self.api_key)
                .json(body)
                .send()
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!("OpenAI API error {status}: {text}");
            return Err(LlmError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(response)
    }
}

impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let messages = convert_messages(request);
        let body = ApiChatRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            stream: false,
            stream_options: None,
        };

        let response = self.post_chat(&body).await?;
        let text = response.text().await?;
        let resp: OpenAiChatResponse = serde_json::from_str(&text)?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse { provider: PROVIDER })?;

        if let Some(usage) = resp.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "OpenAI API usage"
            );
        }

        Ok(ChatResponse {
            content,
            usage: resp.usage,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let messages = convert_messages(request);
        let body = ApiChatRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        let response = self.post_chat(&body).await?;
        Ok(openai_sse_to_stream(response))
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        PROVIDER
    }
}

/// Batch embeddings against an OpenAI-compatible `/embeddings` endpoint.
///
/// Requests are spaced by the optional rate limiter and transient failures are retried.
/// Response items are re-ordered by their `index` field before the count is checked.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    retry: RetryPolicy,
    limiter: Option<RateLimiter>,
    closed: AtomicBool,
}

impl fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("limiter", &self.limiter)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbedder {
    #[must_use]
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: crate::http::default_client(),
            api_key,
            base_url: trim_base_url(base_url),
            model,
            retry: RetryPolicy::default(),
            limiter: None,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LlmError::Closed);
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let url = format!("{}/embeddings", self.base_url);
        let response = send_with_retry(PROVIDER, &self.retry, || {
            authorize(self.client.post(&url), &self.api_key)
                .json(&body)
                .send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!("OpenAI embedding API error {status}: {text}");
            return Err(LlmError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                body: text,
            });
        }

        let resp: EmbeddingResponse = serde_json::from_str(&text)?;
        let vectors = order_embeddings(resp.data);
        if vectors.len() != texts.len() {
            return Err(LlmError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(self.request(texts))
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        PROVIDER
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Sort response items by their provider index; items without one keep their position.
fn order_embeddings(data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    let mut indexed: Vec<(usize, Vec<f32>)> = data
        .into_iter()
        .enumerate()
        .map(|(pos, d)| (d.index.unwrap_or(pos), d.embedding))
        .collect();
    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, v)| v).collect()
}

fn convert_messages(request: &ChatRequest) -> Vec<ApiMessage<'_>> {
    let mut out = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.is_empty() {
        out.push(ApiMessage {
            role: Role::System.as_str(),
            content: &request.system,
        });
    }
    out.extend(request.messages.iter().map(|m| ApiMessage {
        role: m.role.as_str(),
        content: &m.content,
    }));
    out
}

/// Usage reported by the backend, or an estimate from the request and answer text.
#[must_use]
pub fn usage_or_estimate(
    usage: Option<TokenUsage>,
    request: &ChatRequest,
    answer: &str,
) -> TokenUsage {
    if let Some(usage) = usage {
        return usage;
    }
    let prompt = estimate_tokens(&request.system)
        + request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<u32>();
    let completion = estimate_tokens(answer);
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

#[derive(Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage<'a>],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_stream::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::provider::{Message, StreamEvent};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            system: "be terse".into(),
            messages: vec![Message::user("hi")],
            ..ChatRequest::default()
        }
    }

    #[test]
    fn debug_redacts_api_key() {
        let p = OpenAiProvider::new("sk-secret".into(), "http://x/".into(), "m".into());
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
        assert!(dbg.contains("\"http://x\""));
    }

    #[test]
    fn convert_messages_prepends_system() {
        let req = request();
        let msgs = convert_messages(&req);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[1].role, "user");
        assert_eq!(msgs[1].content, "hi");
    }

    #[test]
    fn convert_messages_skips_empty_system() {
        let req = ChatRequest {
            messages: vec![Message::user("hi")],
            ..ChatRequest::default()
        };
        assert_eq!(convert_messages(&req).len(), 1);
    }

    #[test]
    fn order_embeddings_sorts_by_index() {
        let data = vec![
            EmbeddingData {
                index: Some(1),
                embedding: vec![1.0],
            },
            EmbeddingData {
                index: Some(0),
                embedding: vec![0.0],
            },
        ];
        assert_eq!(order_embeddings(data), vec![vec![0.0], vec![1.0]]);
    }

    #[test]
    fn usage_estimate_when_missing() {
        let req = request();
        let usage = usage_or_estimate(None, &req, "abcdefgh");
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.prompt_tokens, 2 + 1);
        assert_eq!(usage.total_tokens, 5);
    }

    #[tokio::test]
    async fn chat_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(json!({"model": "gpt", "max_tokens": 2048})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })))
            .mount(&server)
            .await;

        let p = OpenAiProvider::new("key".into(), server.uri(), "gpt".into());
        let resp = p.chat(&request()).await.unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.usage.unwrap().total_tokens, 4);
    }

    #[tokio::test]
    async fn chat_client_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let p = OpenAiProvider::new("key".into(), server.uri(), "gpt".into());
        let err = p.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn chat_empty_choices_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let p = OpenAiProvider::new(String::new(), server.uri(), "gpt".into());
        let err = p.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn chat_stream_yields_deltas_and_usage() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let p = OpenAiProvider::new("key".into(), server.uri(), "gpt".into());
        let mut stream = p.chat_stream(&request()).await.unwrap();
        let mut text = String::new();
        let mut usage = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::Delta(d) => text.push_str(&d),
                StreamEvent::Usage(u) => usage = Some(u),
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(usage.unwrap().total_tokens, 4);
    }

    #[tokio::test]
    async fn embed_batch_reorders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({"model": "embed", "input": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let e = OpenAiEmbedder::new("key".into(), server.uri(), "embed".into());
        let out = e
            .embed_batch(&["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn embed_batch_count_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0]}]
            })))
            .mount(&server)
            .await;

        let e = OpenAiEmbedder::new("key".into(), server.uri(), "embed".into());
        let err = e
            .embed_batch(&["a".to_owned(), "b".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LlmError::CountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn embed_batch_retries_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [0.5]}]
            })))
            .mount(&server)
            .await;

        let e = OpenAiEmbedder::new("key".into(), server.uri(), "embed".into())
            .with_retry(fast_retry());
        let out = e.embed_batch(&["a".to_owned()]).await.unwrap();
        assert_eq!(out, vec![vec![0.5]]);
    }

    #[tokio::test]
    async fn embed_empty_batch_skips_request() {
        let e = OpenAiEmbedder::new("key".into(), "http://127.0.0.1:1".into(), "m".into());
        assert!(e.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embed_after_close_fails() {
        let e = OpenAiEmbedder::new("key".into(), "http://127.0.0.1:1".into(), "m".into());
        e.close();
        let err = e.embed_batch(&["a".to_owned()]).await.unwrap_err();
        assert!(matches!(err, LlmError::Closed));
    }
}
