//! Test-only mock providers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_stream::wrappers::ReceiverStream;

use crate::embed::{BoxFuture, EmbeddingProvider};
use crate::error::LlmError;
use crate::provider::{
    ChatRequest, ChatResponse, ChatStream, LlmProvider, StreamEvent, TokenUsage,
};

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    pub default_response: String,
    pub usage: Option<TokenUsage>,
    pub fail_chat: bool,
    /// Yield an error after this many stream deltas.
    pub fail_stream_after: Option<usize>,
    /// Milliseconds to sleep before returning a response.
    pub delay_ms: u64,
    /// Milliseconds to sleep between stream deltas.
    pub stream_delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".into(),
            usage: None,
            fail_chat: false,
            fail_stream_after: None,
            delay_ms: 0,
            stream_delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_stream_delay(mut self, ms: u64) -> Self {
        self.stream_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn fail_stream_after(mut self, deltas: usize) -> Self {
        self.fail_stream_after = Some(deltas);
        self
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn next_response(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }
}

impl LlmProvider for MockProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let content = self.next_response(request).await?;
        Ok(ChatResponse {
            content,
            usage: self.usage,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.next_response(request).await?;
        let mut events: Vec<Result<StreamEvent, LlmError>> = response
            .chars()
            .map(|c| Ok(StreamEvent::Delta(c.to_string())))
            .collect();
        if let Some(n) = self.fail_stream_after {
            events.truncate(n);
            events.push(Err(LlmError::Other("mock stream error".into())));
        } else if let Some(usage) = self.usage {
            events.push(Ok(StreamEvent::Usage(usage)));
        }

        if self.stream_delay_ms == 0 {
            return Ok(Box::pin(tokio_stream::iter(events)));
        }

        let delay = std::time::Duration::from_millis(self.stream_delay_ms);
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            for event in events {
                tokio::time::sleep(delay).await;
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Deterministic embedder: every text maps to the same base vector unless a keyword
/// vector matches. Selected calls (0-based) can be made to fail.
#[derive(Debug, Default)]
pub struct MockEmbedder {
    dim: usize,
    keyword_vectors: Vec<(String, Vec<f32>)>,
    fail_calls: HashSet<usize>,
    calls: Mutex<Vec<Vec<String>>>,
    counter: AtomicUsize,
    closed: AtomicBool,
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Texts containing `keyword` embed to `vector` (first match wins).
    #[must_use]
    pub fn with_keyword_vector(mut self, keyword: impl Into<String>, vector: Vec<f32>) -> Self {
        self.keyword_vectors.push((keyword.into(), vector));
        self
    }

    #[must_use]
    pub fn fail_calls(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.fail_calls.extend(calls);
        self
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Inputs of every call so far, including failed ones.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some((_, v)) = self
            .keyword_vectors
            .iter()
            .find(|(k, _)| text.contains(k.as_str()))
        {
            return v.clone();
        }
        let mut v = vec![0.0; self.dim];
        if let Some(first) = v.first_mut() {
            *first = 1.0;
        }
        v
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(LlmError::Closed);
            }
            let call = self.counter.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(texts.to_vec());
            if self.fail_calls.contains(&call) {
                return Err(LlmError::Other(format!("mock embed failure on call {call}")));
            }
            Ok(texts.iter().map(|t| self.vector_for(t)).collect())
        })
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
