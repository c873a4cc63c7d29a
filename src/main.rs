use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use sift_core::config::{Config, resolve_config_path};
use sift_core::{RagEvent, RagOrchestrator};
use sift_index::{
    ChunkStore, HybridSearch, Ingestor, LexicalQuery, SimilarityResult, collect_files,
};
use sift_llm::openai::{OpenAiEmbedder, OpenAiProvider};
use sift_llm::rate_limit::RateLimiter;
use sift_llm::retry::RetryPolicy;
use sift_llm::{CachedEmbedder, EmbeddingProvider};
use sift_memory::{
    ConversationId, ConversationStore, QdrantOps, RepositoryId, SqliteConversationStore,
    VectorStore, open_pool,
};
use sift_pipeline::{EmbeddingPipeline, JobPriority, JobStore, PipelineError, is_settled};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

/// Index source code, embed it and ask questions about it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: $SIFT_CONFIG or config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chunk a local directory into the index
    Index {
        /// Directory to walk (honours .gitignore)
        path: PathBuf,
        #[arg(long)]
        repo: i64,
        /// Keep chunks of files not found in this walk
        #[arg(long)]
        incremental: bool,
    },
    /// Queue an embedding job and run the pipeline until it settles
    Embed {
        #[arg(long)]
        repo: i64,
        #[arg(long, value_enum, default_value_t = Priority::Normal)]
        priority: Priority,
    },
    /// Search indexed chunks
    Search {
        query: String,
        #[arg(long)]
        repo: Option<i64>,
        #[arg(short, long)]
        limit: Option<u32>,
        /// Blend weight of the vector score, 0.0 to 1.0
        #[arg(long)]
        weight: Option<f32>,
        #[arg(long, value_enum, default_value_t = Mode::Hybrid)]
        mode: Mode,
    },
    /// Ask a question, grounded in a repository when --repo is given
    Ask {
        question: String,
        #[arg(long)]
        repo: Option<i64>,
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<i64>,
        /// Wait for the full answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
    /// Show chunk counts and embedding job progress
    Status {
        #[arg(long)]
        repo: i64,
    },
    /// Delete a repository's vectors so it can be re-embedded
    Purge {
        #[arg(long)]
        repo: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Priority {
    High,
    Normal,
    Low,
}

impl From<Priority> for JobPriority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::High => Self::High,
            Priority::Normal => Self::Normal,
            Priority::Low => Self::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Hybrid,
    Lexical,
    Vector,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();

    let args = Args::parse();
    let config_path = resolve_config_path(args.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    tracing::debug!(path = %config_path.display(), "config loaded");

    let app = App::connect(config).await?;
    match args.command {
        Command::Index {
            path,
            repo,
            incremental,
        } => app.index(&path, RepositoryId(repo), !incremental).await,
        Command::Embed { repo, priority } => app.embed(RepositoryId(repo), priority.into()).await,
        Command::Search {
            query,
            repo,
            limit,
            weight,
            mode,
        } => {
            app.search(&query, repo.map(RepositoryId), limit, weight, mode)
                .await
        }
        Command::Ask {
            question,
            repo,
            conversation,
            no_stream,
        } => {
            app.ask(
                &question,
                repo.map(RepositoryId),
                conversation.map(ConversationId),
                !no_stream,
            )
            .await
        }
        Command::Status { repo } => app.status(RepositoryId(repo)).await,
        Command::Purge { repo } => app.purge(RepositoryId(repo)).await,
    }
}

/// Logs go to stderr so answers streamed to stdout stay clean.
fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct App {
    config: Config,
    pool: SqlitePool,
    chunks: ChunkStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl App {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let sqlite_path = &config.storage.sqlite_path;
        if sqlite_path != ":memory:"
            && let Some(parent) = Path::new(sqlite_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let pool = open_pool(sqlite_path)
            .await
            .with_context(|| format!("failed to open database {sqlite_path}"))?;

        let vectors: Arc<dyn VectorStore> = Arc::new(
            QdrantOps::new(&config.storage.qdrant_url)
                .with_context(|| format!("invalid qdrant url {}", config.storage.qdrant_url))?,
        );

        let mut embedder = OpenAiEmbedder::new(
            config.embedding_api_key().unwrap_or_default().to_owned(),
            config.embedding_base_url().to_owned(),
            config.embedding.model.clone(),
        )
        .with_retry(RetryPolicy {
            max_retries: config.llm.max_retries,
            ..RetryPolicy::default()
        });
        if config.embedding.requests_per_minute > 0 {
            embedder =
                embedder.with_rate_limit(RateLimiter::per_minute(config.embedding.requests_per_minute));
        }

        Ok(Self {
            chunks: ChunkStore::new(pool.clone()),
            pool,
            vectors,
            embedder: Arc::new(embedder),
            config,
        })
    }

    fn hybrid_search(&self) -> HybridSearch {
        let embedder: Arc<dyn EmbeddingProvider> = if self.config.embedding.cache_entries > 0 {
            Arc::new(CachedEmbedder::new(
                Arc::clone(&self.embedder),
                self.config.embedding.cache_entries,
            ))
        } else {
            Arc::clone(&self.embedder)
        };
        HybridSearch::new(
            self.chunks.clone(),
            Arc::clone(&self.vectors),
            embedder,
            self.config.pipeline.collection.clone(),
        )
        .with_max_limit(self.config.search.max_limit)
    }

    async fn index(&self, root: &Path, repo: RepositoryId, full: bool) -> anyhow::Result<()> {
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }
        let files = collect_files(root, self.config.chunker.max_file_bytes);
        let ingestor = Ingestor::new(
            self.chunks.clone(),
            Arc::clone(&self.vectors),
            self.config.pipeline.collection.clone(),
            self.config.chunker.window,
        );
        let report = ingestor.ingest_files(repo, files, full).await?;
        self.chunks
            .build_text_index()
            .await
            .context("failed to build text index")?;

        println!(
            "{} files scanned, {} indexed, {} skipped",
            report.files_scanned, report.files_indexed, report.files_skipped
        );
        println!(
            "{} chunks created, {} unchanged, {} removed ({} ms)",
            report.chunks_created, report.chunks_unchanged, report.chunks_removed, report.duration_ms
        );
        for (path, error) in &report.errors {
            eprintln!("error: {path}: {error}");
        }
        Ok(())
    }

    async fn embed(&self, repo: RepositoryId, priority: JobPriority) -> anyhow::Result<()> {
        let pipeline = EmbeddingPipeline::new(
            JobStore::new(self.pool.clone()),
            self.chunks.clone(),
            Arc::clone(&self.embedder),
            Arc::clone(&self.vectors),
            self.config.pipeline.clone(),
        );

        let job_id = match pipeline.enqueue(repo, priority).await {
            Ok(job) => job.id,
            Err(PipelineError::AlreadyQueued { .. }) => {
                let job = pipeline
                    .jobs()
                    .latest_for_repository(repo)
                    .await?
                    .context("repository reported as queued but has no job")?;
                println!("repository {repo} already queued as job {}, resuming", job.id);
                job.id
            }
            Err(e) => return Err(e.into()),
        };
        pipeline.start().await?;

        let wait = async {
            let mut last_progress = -1.0_f64;
            loop {
                let job = pipeline
                    .jobs()
                    .get(job_id)
                    .await?
                    .context("embedding job disappeared")?;
                if (job.progress - last_progress).abs() >= 1.0 {
                    eprintln!(
                        "job {}: {} ({}/{} chunks, {:.0}%)",
                        job.id, job.status, job.processed_chunks, job.total_chunks, job.progress
                    );
                    last_progress = job.progress;
                }
                if is_settled(&job) {
                    return anyhow::Ok(job);
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        };

        let outcome = tokio::select! {
            job = wait => Some(job?),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                None
            }
        };
        pipeline.shutdown().await;
        self.embedder.close();

        let Some(job) = outcome else {
            println!("interrupted; job {job_id} will resume on the next run");
            return Ok(());
        };
        println!(
            "job {}: {} ({} embedded, {} failed, {} attempts)",
            job.id, job.status, job.processed_chunks, job.failed_chunks, job.attempts
        );
        if let Some(err) = job.last_error {
            println!("last error: {err}");
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        repo: Option<RepositoryId>,
        limit: Option<u32>,
        weight: Option<f32>,
        mode: Mode,
    ) -> anyhow::Result<()> {
        let search = self.hybrid_search();
        let limit = limit.unwrap_or(self.config.search.default_limit);
        let weight = weight.unwrap_or(self.config.search.vector_weight);

        if mode == Mode::Hybrid {
            let results = search.hybrid_search(repo, query, limit, weight).await?;
            if results.is_empty() {
                println!("no results");
            }
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{}. {}:{}-{}  score {:.3} ({})",
                    i + 1,
                    r.chunk.file_path,
                    r.chunk.start_line,
                    r.chunk.end_line,
                    r.score,
                    r.relevance
                );
                println!("   {}", r.highlight.replace('\n', " "));
            }
            return Ok(());
        }

        let results = if mode == Mode::Lexical {
            let mut lexical = LexicalQuery::new(query, limit);
            if let Some(repo) = repo {
                lexical = lexical.repository(repo);
            }
            search.lexical_search(&lexical).await?
        } else {
            search.vector_search(repo, query, limit).await?
        };
        print_similarity(&results);
        Ok(())
    }

    async fn ask(
        &self,
        question: &str,
        repo: Option<RepositoryId>,
        conversation: Option<ConversationId>,
        stream: bool,
    ) -> anyhow::Result<()> {
        let conversations = Arc::new(SqliteConversationStore::new(self.pool.clone()));
        let conversation_id = match conversation {
            Some(id) => id,
            None => conversations.create(repo, None).await?.id,
        };

        let provider = OpenAiProvider::new(
            self.config.llm.api_key.clone().unwrap_or_default(),
            self.config.llm.base_url.clone(),
            self.config.llm.model.clone(),
        )
        .with_retry(RetryPolicy {
            max_retries: self.config.llm.max_retries,
            ..RetryPolicy::default()
        });
        let rag = RagOrchestrator::new(
            Arc::new(provider),
            Arc::new(self.hybrid_search()),
            conversations,
            self.config.rag.clone(),
        );

        if !stream {
            let answer = rag.respond(conversation_id, question).await?;
            println!("{}", answer.answer);
            print_sources(conversation_id, &answer.context);
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut events = rag
            .respond_stream(conversation_id, question, cancel.clone())
            .await?;
        let mut stdout = std::io::stdout();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    println!();
                    eprintln!("cancelled");
                    return Ok(());
                }
            };
            match event {
                Some(RagEvent::Content { delta, .. }) => {
                    print!("{delta}");
                    stdout.flush().ok();
                }
                Some(RagEvent::Done(answer)) => {
                    println!();
                    print_sources(conversation_id, &answer.context);
                    return Ok(());
                }
                Some(RagEvent::Error(message)) => {
                    println!();
                    bail!("answer failed: {message}");
                }
                None => bail!("answer stream ended unexpectedly"),
            }
        }
    }

    async fn status(&self, repo: RepositoryId) -> anyhow::Result<()> {
        let jobs = JobStore::new(self.pool.clone());
        let total = self.chunks.count_chunks(repo).await?;
        let pending = self.chunks.chunks_needing_embedding(repo).await?.len();
        println!("repository {repo}: {total} chunks, {pending} awaiting embedding");

        let history = jobs.jobs_for_repository(repo).await?;
        if history.is_empty() {
            println!("no embedding jobs");
        }
        for job in history.into_iter().take(5) {
            println!(
                "job {} [{}] {} {:.0}% ({}/{} chunks, {} failed, attempt {}/{})",
                job.id,
                job.priority,
                job.status,
                job.progress,
                job.processed_chunks,
                job.total_chunks,
                job.failed_chunks,
                job.attempts,
                job.max_attempts
            );
            if let Some(err) = job.last_error {
                println!("    last error: {err}");
            }
        }

        let stats = jobs.stats().await?;
        println!(
            "queue: {} pending, {} processing, {} completed, {} failed",
            stats.pending, stats.processing, stats.completed, stats.failed
        );
        Ok(())
    }

    async fn purge(&self, repo: RepositoryId) -> anyhow::Result<()> {
        let pipeline = EmbeddingPipeline::new(
            JobStore::new(self.pool.clone()),
            self.chunks.clone(),
            Arc::clone(&self.embedder),
            Arc::clone(&self.vectors),
            self.config.pipeline.clone(),
        );
        let removed = pipeline.delete_repository_vectors(repo).await?;
        println!("removed {removed} vectors from repository {repo}");
        Ok(())
    }
}

fn print_similarity(results: &[SimilarityResult]) {
    if results.is_empty() {
        println!("no results");
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. {}:{}-{}  score {:.3} ({})",
            i + 1,
            r.chunk.file_path,
            r.chunk.start_line,
            r.chunk.end_line,
            r.score,
            r.relevance
        );
    }
}

fn print_sources(conversation_id: ConversationId, context: &[sift_memory::ContextRef]) {
    if !context.is_empty() {
        eprintln!("sources:");
        for c in context {
            eprintln!("  {}:{}-{} ({:.2})", c.file_path, c.start_line, c.end_line, c.score);
        }
    }
    eprintln!("conversation {conversation_id}");
}
