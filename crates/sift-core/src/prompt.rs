//! Grounded prompt assembly from retrieved chunks.

use sift_index::HybridResult;
use sift_llm::provider::{ChatRequest, CompletionOptions, Message};
use sift_memory::{ContextRef, ConversationMessage};

pub const SYSTEM_PROMPT: &str = "You are a code assistant answering questions about a \
software repository. Base your answer on the code excerpts provided with the question. \
Cite file paths and line ranges when you refer to code. If the excerpts do not contain \
the answer, say so instead of guessing.";

const TITLE_MAX_CHARS: usize = 50;
const TITLE_KEEP_CHARS: usize = 47;

/// Render retrieved chunks as fenced excerpts with path, line range and language.
#[must_use]
pub fn render_context(results: &[HybridResult]) -> String {
    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        let chunk = &r.chunk;
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!(
            "### {} (lines {}-{}, {})\n```{}\n",
            chunk.file_path, chunk.start_line, chunk.end_line, chunk.language, chunk.language
        ));
        out.push_str(&chunk.content);
        if !chunk.content.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n");
    }
    out
}

/// The final user turn: excerpts (if any) followed by the question.
#[must_use]
pub fn grounded_message(question: &str, results: &[HybridResult]) -> String {
    if results.is_empty() {
        return question.to_owned();
    }
    format!(
        "Relevant code from the repository:\n\n{}\nQuestion: {question}",
        render_context(results)
    )
}

/// Assemble a completion request from prior turns, retrieved context and the question.
#[must_use]
pub fn build_request(
    system: &str,
    history: &[ConversationMessage],
    results: &[HybridResult],
    question: &str,
    options: CompletionOptions,
) -> ChatRequest {
    let mut messages: Vec<Message> = history
        .iter()
        .map(|m| Message {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();
    messages.push(Message::user(grounded_message(question, results)));
    ChatRequest {
        system: system.to_owned(),
        messages,
        options,
    }
}

#[must_use]
pub fn context_refs(results: &[HybridResult]) -> Vec<ContextRef> {
    results
        .iter()
        .map(|r| ContextRef {
            chunk_id: r.chunk.id.clone(),
            file_path: r.chunk.file_path.clone(),
            start_line: r.chunk.start_line,
            end_line: r.chunk.end_line,
            score: r.score,
        })
        .collect()
}

/// Conversation title from its first message: verbatim up to 50 characters, otherwise
/// the first 47 followed by `...`.
#[must_use]
pub fn derive_title(message: &str) -> String {
    let message = message.trim();
    if message.chars().count() <= TITLE_MAX_CHARS {
        return message.to_owned();
    }
    let mut title: String = message.chars().take(TITLE_KEEP_CHARS).collect();
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use sift_index::{Chunk, ChunkerConfig, Relevance, SourceFile, chunk_file};
    use sift_llm::provider::Role;
    use sift_memory::RepositoryId;

    use super::*;

    fn result(path: &str, score: f32) -> HybridResult {
        let content = (0..12)
            .map(|i| format!("func Handler{i}() {{}}"))
            .collect::<Vec<_>>()
            .join("\n");
        let code = chunk_file(&SourceFile::new(path, content), &ChunkerConfig::default()).unwrap();
        HybridResult {
            chunk: Chunk::from_code(RepositoryId(1), &code[0]),
            score,
            lexical_score: Some(score),
            vector_score: None,
            relevance: Relevance::from_score(score),
            highlight: String::new(),
        }
    }

    #[test]
    fn title_short_message_verbatim() {
        assert_eq!(derive_title("How does auth work?"), "How does auth work?");
        let exactly_fifty = "a".repeat(50);
        assert_eq!(derive_title(&exactly_fifty), exactly_fifty);
    }

    #[test]
    fn title_long_message_truncated() {
        let title = derive_title(&"b".repeat(51));
        assert_eq!(title, format!("{}...", "b".repeat(47)));
        assert_eq!(title.chars().count(), 50);
    }

    #[test]
    fn title_counts_chars_not_bytes() {
        let message = "é".repeat(60);
        let title = derive_title(&message);
        assert!(title.starts_with(&"é".repeat(47)));
        assert!(title.ends_with("..."));
    }

    #[test]
    fn render_includes_location_and_language() {
        let rendered = render_context(&[result("cmd/server.go", 0.9)]);
        assert!(rendered.starts_with("### cmd/server.go (lines 1-12, go)\n```go\n"));
        assert!(rendered.contains("func Handler3() {}"));
        assert!(rendered.trim_end().ends_with("```"));
    }

    #[test]
    fn question_without_context_passes_through() {
        assert_eq!(grounded_message("why?", &[]), "why?");
        let grounded = grounded_message("why?", &[result("a.go", 0.5)]);
        assert!(grounded.contains("### a.go"));
        assert!(grounded.ends_with("Question: why?"));
    }

    #[test]
    fn request_keeps_history_order() {
        let history = vec![
            ConversationMessage::user("first"),
            ConversationMessage::assistant("reply", vec![], None),
        ];
        let req = build_request(
            SYSTEM_PROMPT,
            &history,
            &[],
            "second",
            CompletionOptions::default(),
        );
        assert_eq!(req.system, SYSTEM_PROMPT);
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::User]);
        assert_eq!(req.messages[2].content, "second");
    }

    #[test]
    fn context_refs_mirror_results() {
        let refs = context_refs(&[result("x.go", 0.75)]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].file_path, "x.go");
        assert_eq!((refs[0].start_line, refs[0].end_line), (1, 12));
        assert!((refs[0].score - 0.75).abs() < f32::EPSILON);
    }
}
