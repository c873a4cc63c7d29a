//! Code chunking, chunk storage and hybrid retrieval.
//!
//! Source files are split into overlapping line windows with pattern-extracted
//! metadata, stored in `SQLite` next to an FTS5 text index, and retrieved by fusing
//! BM25 and vector similarity scores.

pub mod chunker;
pub mod error;
pub mod highlight;
pub mod ingest;
pub mod languages;
pub mod search;
pub mod store;

pub use chunker::{ChunkMetadata, ChunkerConfig, CodeChunk, SourceFile, chunk_file};
pub use error::{ChunkError, IndexError, Result};
pub use highlight::highlight;
pub use ingest::{IngestReport, Ingestor, collect_files};
pub use languages::Lang;
pub use search::{
    DEFAULT_VECTOR_WEIGHT, FusionWeights, HybridResult, HybridSearch, Relevance, SimilarityResult,
};
pub use store::{Chunk, ChunkStore, LexicalHit, LexicalQuery, ReplaceOutcome};
