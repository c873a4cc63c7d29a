//! Fixed-size overlapping line windows with pattern-extracted metadata.

use serde::{Deserialize, Serialize};

use crate::error::ChunkError;
use crate::languages::{DECISION_POINTS, Lang, NOT_A_NAME, RecognizerKind, detect_language};

/// A source file handed to the chunker.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Repository-relative path with `/` separators.
    pub path: String,
    pub content: String,
    /// Free-form language name; detected from the extension when absent.
    pub language: Option<String>,
    pub size: u64,
}

impl SourceFile {
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            size: content.len() as u64,
            content,
            language: None,
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Declared language if recognizable, otherwise the extension-based guess.
    #[must_use]
    pub fn lang(&self) -> Lang {
        match self.language.as_deref().map(Lang::from_name) {
            Some(lang) if lang != Lang::Unknown => lang,
            _ => detect_language(std::path::Path::new(&self.path)),
        }
    }
}

/// Chunker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Lines per window (default: 150).
    pub window_lines: usize,
    /// Lines shared by consecutive windows (default: 50).
    pub overlap_lines: usize,
    /// Trailing windows shorter than this are dropped (default: 10).
    pub min_chunk_lines: usize,
    /// Files shorter than this are rejected with `TooShort` (default: 5).
    pub min_file_lines: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            window_lines: 150,
            overlap_lines: 50,
            min_chunk_lines: 10,
            min_file_lines: 5,
        }
    }
}

impl ChunkerConfig {
    /// Lines per window, widened to `min_chunk_lines` when configured smaller.
    #[must_use]
    pub fn effective_window(&self) -> usize {
        self.window_lines.max(self.min_chunk_lines).max(1)
    }

    /// Distance between consecutive window starts, never zero.
    #[must_use]
    pub fn step(&self) -> usize {
        self.effective_window().saturating_sub(self.overlap_lines).max(1)
    }
}

/// Structural hints extracted from a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub functions: Vec<String>,
    pub classes: Vec<String>,
    pub variables: Vec<String>,
    pub types: Vec<String>,
    pub imports: Vec<String>,
    pub complexity: u32,
}

/// One window of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChunk {
    pub file_path: String,
    pub language: Lang,
    /// 1-indexed, inclusive.
    pub start_line: u32,
    /// 1-indexed, inclusive.
    pub end_line: u32,
    pub content: String,
    /// BLAKE3 hex digest of `content`.
    pub content_hash: String,
    pub metadata: ChunkMetadata,
}

impl CodeChunk {
    #[must_use]
    pub fn line_count(&self) -> u32 {
        self.end_line - self.start_line + 1
    }
}

/// Split a file into overlapping line windows.
///
/// A file of 5 to 9 lines yields no chunks: its only window is shorter than the
/// minimum chunk length.
///
/// # Errors
///
/// Returns [`ChunkError::EmptyContent`] for empty or whitespace-only content and
/// [`ChunkError::TooShort`] for files with fewer than `min_file_lines` lines.
pub fn chunk_file(file: &SourceFile, config: &ChunkerConfig) -> Result<Vec<CodeChunk>, ChunkError> {
    if file.content.trim().is_empty() {
        return Err(ChunkError::EmptyContent);
    }

    let lines: Vec<&str> = file.content.lines().collect();
    let total = lines.len();
    if total < config.min_file_lines {
        return Err(ChunkError::TooShort { lines: total });
    }

    let lang = file.lang();
    let window = config.effective_window();
    let step = config.step();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while total - start >= config.min_chunk_lines {
        let end = (start + window).min(total);
        let content = lines[start..end].join("\n");
        chunks.push(CodeChunk {
            file_path: file.path.clone(),
            language: lang,
            start_line: line_number(start + 1),
            end_line: line_number(end),
            content_hash: content_hash(&content),
            metadata: extract_metadata(&content, lang),
            content,
        });
        if end == total {
            break;
        }
        start += step;
    }

    tracing::trace!(file = %file.path, lines = total, chunks = chunks.len(), "chunked file");
    Ok(chunks)
}

fn line_number(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// BLAKE3 hex digest used as the chunk content hash.
#[must_use]
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Run the language's recognizers and complexity patterns over `text`.
#[must_use]
pub fn extract_metadata(text: &str, lang: Lang) -> ChunkMetadata {
    let mut meta = ChunkMetadata::default();

    for recognizer in lang.recognizers() {
        let target = match recognizer.kind {
            RecognizerKind::Function => &mut meta.functions,
            RecognizerKind::Class => &mut meta.classes,
            RecognizerKind::Type => &mut meta.types,
            RecognizerKind::Variable => &mut meta.variables,
            RecognizerKind::Import => &mut meta.imports,
        };
        for name in recognizer.names(text) {
            if recognizer.kind == RecognizerKind::Function && NOT_A_NAME.contains(&name) {
                continue;
            }
            push_unique(target, name);
        }
    }

    meta.complexity = complexity(text);
    meta
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_owned());
    }
}

/// 1 plus one per decision-point occurrence.
#[must_use]
pub fn complexity(text: &str) -> u32 {
    let hits: usize = DECISION_POINTS
        .iter()
        .map(|re| re.find_iter(text).count())
        .sum();
    u32::try_from(hits).unwrap_or(u32::MAX - 1).saturating_add(1)
}
