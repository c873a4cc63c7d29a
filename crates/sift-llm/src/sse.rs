use eventsource_stream::Eventsource;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::error::LlmError;
use crate::provider::{ChatStream, StreamEvent, TokenUsage};

/// Convert an OpenAI-compatible streaming response into a `ChatStream`.
pub(crate) fn openai_sse_to_stream(response: reqwest::Response) -> ChatStream {
    let event_stream = response.bytes_stream().eventsource();
    let mapped = event_stream.filter_map(|event| match event {
        Ok(event) => parse_openai_sse_event(&event.data),
        Err(e) => Some(Err(LlmError::SseParse(e.to_string()))),
    });
    Box::pin(mapped)
}

fn parse_openai_sse_event(data: &str) -> Option<Result<StreamEvent, LlmError>> {
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.as_deref())
                .unwrap_or_default();

            if !content.is_empty() {
                return Some(Ok(StreamEvent::Delta(content.to_owned())));
            }
            chunk.usage.map(|u| Ok(StreamEvent::Usage(u)))
        }
        Err(e) => Some(Err(LlmError::SseParse(format!(
            "failed to parse SSE data: {e}"
        )))),
    }
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        let result = parse_openai_sse_event(data).unwrap().unwrap();
        assert_eq!(result, StreamEvent::Delta("Hello".into()));
    }

    #[test]
    fn parse_done_ends_stream() {
        assert!(parse_openai_sse_event("[DONE]").is_none());
    }

    #[test]
    fn parse_empty_delta_skipped() {
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_openai_sse_event(data).is_none());
    }

    #[test]
    fn parse_final_usage_chunk() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":5,"total_tokens":17}}"#;
        let result = parse_openai_sse_event(data).unwrap().unwrap();
        assert_eq!(
            result,
            StreamEvent::Usage(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 5,
                total_tokens: 17,
            })
        );
    }

    #[test]
    fn parse_invalid_json_is_error() {
        let result = parse_openai_sse_event("{not json").unwrap();
        assert!(matches!(result, Err(LlmError::SseParse(_))));
    }
}
