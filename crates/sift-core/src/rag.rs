//! Retrieval-augmented answers over a conversation, blocking and streaming.

use std::sync::Arc;
use std::time::Duration;

use sift_index::{HybridResult, HybridSearch};
use sift_llm::LlmProvider;
use sift_llm::openai::usage_or_estimate;
use sift_llm::provider::{ChatRequest, CompletionOptions, Role, StreamEvent, TokenUsage};
use sift_memory::{
    ContextRef, Conversation, ConversationId, ConversationMessage, ConversationStore,
};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::prompt::{SYSTEM_PROMPT, build_request, context_refs, derive_title};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// A completed answer as persisted on the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct RagAnswer {
    pub answer: String,
    pub context: Vec<ContextRef>,
    pub usage: TokenUsage,
}

/// Events of a streamed answer. `Done` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum RagEvent {
    Content { delta: String, accumulated: String },
    Done(RagAnswer),
    Error(String),
}

/// Answers user messages with context retrieved from the conversation's repository.
pub struct RagOrchestrator<P> {
    provider: Arc<P>,
    search: Arc<HybridSearch>,
    conversations: Arc<dyn ConversationStore>,
    config: RagConfig,
    system_prompt: String,
    timeout: Duration,
}

impl<P> Clone for RagOrchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            search: Arc::clone(&self.search),
            conversations: Arc::clone(&self.conversations),
            config: self.config.clone(),
            system_prompt: self.system_prompt.clone(),
            timeout: self.timeout,
        }
    }
}

impl<P> std::fmt::Debug for RagOrchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagOrchestrator")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of the streaming generation phase.
enum Generated {
    Finished {
        answer: String,
        context: Vec<HybridResult>,
        usage: TokenUsage,
    },
    Cancelled,
}

impl<P: LlmProvider + 'static> RagOrchestrator<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        search: Arc<HybridSearch>,
        conversations: Arc<dyn ConversationStore>,
        config: RagConfig,
    ) -> Self {
        let system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| SYSTEM_PROMPT.to_owned());
        let timeout = Duration::from_secs(config.request_timeout_secs);
        Self {
            provider,
            search,
            conversations,
            config,
            system_prompt,
            timeout,
        }
    }

    /// Override the request timeout taken from the config.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Answer `message` and persist both turns.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmptyMessage`], [`RagError::NotFound`], [`RagError::Timeout`],
    /// or the completion or store error. Retrieval failures are not errors: the answer is
    /// generated without context.
    pub async fn respond(&self, conversation_id: ConversationId, message: &str) -> Result<RagAnswer> {
        let conversation = self.begin(conversation_id, message).await?;

        let generated = tokio::time::timeout(self.timeout, async {
            let context = self.retrieve(&conversation, message).await;
            let request = self.request(&conversation, message, &context);
            let response = self.provider.chat(&request).await?;
            Ok::<_, RagError>((request, context, response))
        })
        .await;
        let (request, context, response) = match generated {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(conversation_id = %conversation_id, "answer timed out");
                return Err(RagError::Timeout(self.timeout));
            }
        };

        let usage = usage_or_estimate(response.usage, &request, &response.content);
        self.finish(conversation, response.content, &context, usage)
            .await
    }

    /// Start a streamed answer to `message`.
    ///
    /// Validation and the user-message write happen before this returns; generation runs
    /// in a spawned task that forwards [`RagEvent`]s until a terminal event. Cancelling
    /// `cancel` or dropping the receiver stops generation without persisting the partial
    /// answer.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmptyMessage`], [`RagError::NotFound`] or a store error.
    pub async fn respond_stream(
        &self,
        conversation_id: ConversationId,
        message: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RagEvent>> {
        let conversation = self.begin(conversation_id, message).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let this = self.clone();
        let question = message.to_owned();
        tokio::spawn(async move {
            this.stream_answer(conversation, question, tx, cancel).await;
        });
        Ok(rx)
    }

    async fn begin(&self, id: ConversationId, message: &str) -> Result<Conversation> {
        if message.trim().is_empty() {
            return Err(RagError::EmptyMessage);
        }
        let mut conversation = self
            .conversations
            .load(id)
            .await?
            .ok_or(RagError::NotFound(id))?;
        conversation.push(ConversationMessage::user(message));
        self.conversations.save(&conversation).await?;
        Ok(conversation)
    }

    async fn retrieve(&self, conversation: &Conversation, question: &str) -> Vec<HybridResult> {
        let Some(repository_id) = conversation.repository_id else {
            return Vec::new();
        };
        match self
            .search
            .hybrid_search(
                Some(repository_id),
                question,
                self.config.context_chunks,
                self.config.vector_weight,
            )
            .await
        {
            Ok(results) => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    repository_id = %repository_id,
                    chunks = results.len(),
                    "retrieved context"
                );
                results
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    "context retrieval failed, answering without context: {e:#}"
                );
                Vec::new()
            }
        }
    }

    /// Build the request from history (excluding the just-appended question).
    fn request(
        &self,
        conversation: &Conversation,
        question: &str,
        context: &[HybridResult],
    ) -> ChatRequest {
        let history = conversation
            .messages
            .split_last()
            .map_or(&[][..], |(_, earlier)| earlier);
        let start = history.len().saturating_sub(self.config.history_limit);
        build_request(
            &self.system_prompt,
            &history[start..],
            context,
            question,
            CompletionOptions {
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            },
        )
    }

    async fn finish(
        &self,
        mut conversation: Conversation,
        answer: String,
        context: &[HybridResult],
        usage: TokenUsage,
    ) -> Result<RagAnswer> {
        let refs = context_refs(context);
        let first_exchange = !conversation.messages.iter().any(|m| m.role == Role::Assistant);
        conversation.push(ConversationMessage::assistant(
            answer.clone(),
            refs.clone(),
            Some(usage.total_tokens),
        ));
        if first_exchange && conversation.title.is_none() {
            conversation.title = conversation
                .first_user_message()
                .map(|m| derive_title(&m.content));
        }
        self.conversations.save(&conversation).await?;
        tracing::info!(
            conversation_id = %conversation.id,
            context_chunks = refs.len(),
            tokens = usage.total_tokens,
            "answer stored"
        );
        Ok(RagAnswer {
            answer,
            context: refs,
            usage,
        })
    }

    async fn stream_answer(
        self,
        conversation: Conversation,
        question: String,
        tx: mpsc::Sender<RagEvent>,
        cancel: CancellationToken,
    ) {
        let id = conversation.id;
        let generated = tokio::time::timeout(
            self.timeout,
            self.generate(&conversation, &question, &tx, &cancel),
        )
        .await;

        let (answer, context, usage) = match generated {
            Ok(Ok(Generated::Finished {
                answer,
                context,
                usage,
            })) => (answer, context, usage),
            Ok(Ok(Generated::Cancelled)) => {
                tracing::debug!(conversation_id = %id, "answer stream cancelled");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(conversation_id = %id, "answer stream failed: {e:#}");
                let _ = tx.send(RagEvent::Error(e.to_string())).await;
                return;
            }
            Err(_) => {
                tracing::warn!(conversation_id = %id, "answer stream timed out");
                let _ = tx
                    .send(RagEvent::Error(RagError::Timeout(self.timeout).to_string()))
                    .await;
                return;
            }
        };

        let event = match self.finish(conversation, answer, &context, usage).await {
            Ok(answer) => RagEvent::Done(answer),
            Err(e) => {
                tracing::error!(conversation_id = %id, "failed to store streamed answer: {e:#}");
                RagEvent::Error(e.to_string())
            }
        };
        let _ = tx.send(event).await;
    }

    async fn generate(
        &self,
        conversation: &Conversation,
        question: &str,
        tx: &mpsc::Sender<RagEvent>,
        cancel: &CancellationToken,
    ) -> Result<Generated> {
        let context = tokio::select! {
            () = cancel.cancelled() => return Ok(Generated::Cancelled),
            context = self.retrieve(conversation, question) => context,
        };
        let request = self.request(conversation, question, &context);
        let mut stream = tokio::select! {
            () = cancel.cancelled() => return Ok(Generated::Cancelled),
            stream = self.provider.chat_stream(&request) => stream?,
        };

        let mut accumulated = String::new();
        let mut reported = None;
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Generated::Cancelled),
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Ok(StreamEvent::Delta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&delta);
                    let event = RagEvent::Content {
                        delta,
                        accumulated: accumulated.clone(),
                    };
                    let sent = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(Generated::Cancelled),
                        sent = tx.send(event) => sent,
                    };
                    // receiver dropped
                    if sent.is_err() {
                        return Ok(Generated::Cancelled);
                    }
                }
                Some(Ok(StreamEvent::Usage(usage))) => reported = Some(usage),
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let usage = usage_or_estimate(reported, &request, &accumulated);
        Ok(Generated::Finished {
            answer: accumulated,
            context,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use sift_index::{ChunkStore, ChunkerConfig, Ingestor, SourceFile};
    use sift_llm::mock::{MockEmbedder, MockProvider};
    use sift_memory::{InMemoryVectorStore, RepositoryId, SqliteConversationStore};

    use super::*;

    const COLLECTION: &str = "rag_test";

    struct Fixture {
        store: Arc<SqliteConversationStore>,
        search: Arc<HybridSearch>,
        ingestor: Ingestor,
    }

    async fn fixture() -> Fixture {
        let pool = sift_memory::open_pool(":memory:").await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());
        let chunks = ChunkStore::new(pool.clone());
        let search = HybridSearch::new(
            chunks.clone(),
            vectors.clone(),
            Arc::new(MockEmbedder::new(3)),
            COLLECTION,
        );
        Fixture {
            store: Arc::new(SqliteConversationStore::new(pool)),
            search: Arc::new(search),
            ingestor: Ingestor::new(chunks, vectors, COLLECTION, ChunkerConfig::default()),
        }
    }

    fn orchestrator(f: &Fixture, provider: MockProvider) -> RagOrchestrator<MockProvider> {
        RagOrchestrator::new(
            Arc::new(provider),
            Arc::clone(&f.search),
            f.store.clone(),
            RagConfig::default(),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<RagEvent>) -> Vec<RagEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn go_source() -> String {
        let mut lines = vec![
            "package billing".to_owned(),
            String::new(),
            "func ComputeInvoiceTotal(items []Item) int {".to_owned(),
        ];
        for i in 0..20 {
            lines.push(format!("    total += items[{i}].Price"));
        }
        lines.push("}".to_owned());
        lines.join("\n")
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(&f, MockProvider::default());
        assert!(matches!(
            rag.respond(conv.id, "   ").await,
            Err(RagError::EmptyMessage)
        ));
        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert!(stored.messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let f = fixture().await;
        let rag = orchestrator(&f, MockProvider::default());
        let err = rag.respond(ConversationId(404), "hello").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(ConversationId(404))));
        let err = rag
            .respond_stream(ConversationId(404), "hello", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn respond_persists_answer_and_title() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(&f, MockProvider::with_responses(vec!["It is fine.".into()]));

        let answer = rag.respond(conv.id, "Is the code fine?").await.unwrap();
        assert_eq!(answer.answer, "It is fine.");
        assert!(answer.context.is_empty());
        assert!(answer.usage.total_tokens > 0);

        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].content, "It is fine.");
        assert_eq!(stored.messages[1].tokens_used, Some(answer.usage.total_tokens));
        assert_eq!(stored.title.as_deref(), Some("Is the code fine?"));
    }

    #[tokio::test]
    async fn explicit_title_is_kept() {
        let f = fixture().await;
        let conv = f
            .store
            .create_conversation(None, Some("Billing questions".into()))
            .await
            .unwrap();
        let rag = orchestrator(&f, MockProvider::default());
        rag.respond(conv.id, "What about tax?").await.unwrap();
        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Billing questions"));
    }

    #[tokio::test]
    async fn reported_usage_is_used() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        };
        let rag = orchestrator(&f, MockProvider::default().with_usage(usage));
        let answer = rag.respond(conv.id, "hi").await.unwrap();
        assert_eq!(answer.usage, usage);
    }

    #[tokio::test]
    async fn repository_context_grounds_the_prompt() {
        let f = fixture().await;
        let repo = RepositoryId(3);
        f.ingestor
            .ingest_files(repo, vec![SourceFile::new("billing/invoice.go", go_source())], true)
            .await
            .unwrap();
        let conv = f.store.create_conversation(Some(repo), None).await.unwrap();
        let provider = MockProvider::default();
        let rag = orchestrator(&f, provider.clone());

        let answer = rag
            .respond(conv.id, "How does ComputeInvoiceTotal work?")
            .await
            .unwrap();
        assert_eq!(answer.context.len(), 1);
        assert_eq!(answer.context[0].file_path, "billing/invoice.go");

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system, SYSTEM_PROMPT);
        let last = requests[0].messages.last().unwrap();
        assert!(last.content.contains("### billing/invoice.go (lines 1-24, go)"));
        assert!(last.content.ends_with("Question: How does ComputeInvoiceTotal work?"));

        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages[1].context, answer.context);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let provider = MockProvider::default();
        let rag = RagOrchestrator::new(
            Arc::new(provider.clone()),
            Arc::clone(&f.search),
            f.store.clone(),
            RagConfig {
                history_limit: 2,
                ..RagConfig::default()
            },
        );
        for q in ["one", "two", "three"] {
            rag.respond(conv.id, q).await.unwrap();
        }
        let requests = provider.requests();
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[2].messages.len(), 3);
        assert_eq!(requests[2].messages[0].content, "two");
        assert_eq!(requests[2].messages[2].content, "three");
    }

    #[tokio::test]
    async fn failed_generation_keeps_user_message() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(&f, MockProvider::failing());
        assert!(matches!(
            rag.respond(conv.id, "hello").await,
            Err(RagError::Llm(_))
        ));
        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "hello");
        assert!(stored.title.is_none());
    }

    #[tokio::test]
    async fn title_derived_on_first_reply_after_failure() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let failing = orchestrator(&f, MockProvider::failing());
        assert!(failing.respond(conv.id, "where is auth?").await.is_err());

        let rag = orchestrator(&f, MockProvider::default());
        rag.respond(conv.id, "and the tokens?").await.unwrap();
        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("where is auth?"));
    }

    #[tokio::test]
    async fn untitled_conversation_with_prior_exchange_stays_untitled() {
        let f = fixture().await;
        let mut conv = f.store.create_conversation(None, None).await.unwrap();
        conv.push(ConversationMessage::user("imported question"));
        conv.push(ConversationMessage::assistant("imported answer", vec![], None));
        f.store.save_conversation(&conv).await.unwrap();

        let rag = orchestrator(&f, MockProvider::default());
        rag.respond(conv.id, "follow-up").await.unwrap();
        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 4);
        assert!(stored.title.is_none());
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(&f, MockProvider::default().with_delay(2_000))
            .with_timeout(Duration::from_millis(50));
        assert!(matches!(
            rag.respond(conv.id, "hello").await,
            Err(RagError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn stream_matches_blocking_answer() {
        let f = fixture().await;
        let blocking_conv = f.store.create_conversation(None, None).await.unwrap();
        let stream_conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(
            &f,
            MockProvider::with_responses(vec!["same answer".into(), "same answer".into()]),
        );

        let blocking = rag.respond(blocking_conv.id, "question").await.unwrap();
        let rx = rag
            .respond_stream(stream_conv.id, "question", CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        let Some(RagEvent::Done(streamed)) = events.last() else {
            panic!("expected done event, got {events:?}");
        };
        assert_eq!(streamed.answer, blocking.answer);
        assert_eq!(streamed.usage, blocking.usage);

        let contents: Vec<&RagEvent> = events
            .iter()
            .filter(|e| matches!(e, RagEvent::Content { .. }))
            .collect();
        assert_eq!(contents.len(), "same answer".chars().count());
        let RagEvent::Content { accumulated, .. } = contents[contents.len() - 1] else {
            unreachable!()
        };
        assert_eq!(accumulated, "same answer");

        let stored = f.store.load_conversation(stream_conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].content, "same answer");
        assert_eq!(stored.title.as_deref(), Some("question"));
    }

    #[tokio::test]
    async fn stream_error_is_terminal_and_not_persisted() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(&f, MockProvider::default().fail_stream_after(3));
        let rx = rag
            .respond_stream(conv.id, "hello", CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        assert!(matches!(events[3], RagEvent::Error(_)));

        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_stream_is_not_persisted() {
        let f = fixture().await;
        let conv = f.store.create_conversation(None, None).await.unwrap();
        let rag = orchestrator(&f, MockProvider::default().with_stream_delay(20));
        let cancel = CancellationToken::new();
        let mut rx = rag
            .respond_stream(conv.id, "hello", cancel.clone())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RagEvent::Content { .. }));
        cancel.cancel();

        let rest = collect(rx).await;
        assert!(
            rest.iter()
                .all(|e| !matches!(e, RagEvent::Done(_) | RagEvent::Error(_)))
        );
        let stored = f.store.load_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert!(stored.title.is_none());
    }
}
