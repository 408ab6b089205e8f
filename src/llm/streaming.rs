//! Line-oriented parsers for the streaming dialects and the producer
//! task that pumps an HTTP body into a chunk channel.

use super::error::ModelError;
use crate::types::StreamChunk;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) const SSE_DATA_PREFIX: &str = "data: ";
pub(crate) const SSE_DONE_MARKER: &str = "[DONE]";

/// What one parsed line contributes to the stream.
#[derive(Debug, PartialEq)]
pub(crate) enum ParsedLine {
    Chunk(String),
    Done,
    Skip,
}

pub(crate) trait StreamParser: Send + 'static {
    fn parse_line(&self, line: &str) -> Result<ParsedLine, ModelError>;
}

/// OpenAI-style SSE: `data: <json>` frames terminated by `data: [DONE]`.
pub(crate) struct OpenAiSseParser;

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl StreamParser for OpenAiSseParser {
    fn parse_line(&self, line: &str) -> Result<ParsedLine, ModelError> {
        let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return Ok(ParsedLine::Skip);
        };
        if data == SSE_DONE_MARKER {
            return Ok(ParsedLine::Done);
        }
        let response: OpenAiStreamResponse = serde_json::from_str(data)
            .map_err(|err| ModelError::invalid_response("openai", err.to_string()))?;
        match response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
        {
            Some(content) if !content.is_empty() => Ok(ParsedLine::Chunk(content)),
            _ => Ok(ParsedLine::Skip),
        }
    }
}

/// Anthropic-style SSE: `content_block_delta` events carry text,
/// `message_stop` terminates.
pub(crate) struct AnthropicSseParser;

#[derive(Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicStreamDelta>,
}

#[derive(Deserialize)]
struct AnthropicStreamDelta {
    #[serde(default)]
    text: Option<String>,
}

impl StreamParser for AnthropicSseParser {
    fn parse_line(&self, line: &str) -> Result<ParsedLine, ModelError> {
        let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return Ok(ParsedLine::Skip);
        };
        let event: AnthropicStreamEvent = serde_json::from_str(data)
            .map_err(|err| ModelError::invalid_response("anthropic", err.to_string()))?;
        match event.event_type.as_str() {
            "content_block_delta" => match event.delta.and_then(|delta| delta.text) {
                Some(text) if !text.is_empty() => Ok(ParsedLine::Chunk(text)),
                _ => Ok(ParsedLine::Skip),
            },
            "message_stop" => Ok(ParsedLine::Done),
            _ => Ok(ParsedLine::Skip),
        }
    }
}

/// Ollama NDJSON: one `{message:{content}, done}` object per line.
pub(crate) struct NdjsonParser;

#[derive(Deserialize)]
struct NdjsonLine {
    #[serde(default)]
    message: NdjsonMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize, Default)]
struct NdjsonMessage {
    #[serde(default)]
    content: String,
}

impl StreamParser for NdjsonParser {
    fn parse_line(&self, line: &str) -> Result<ParsedLine, ModelError> {
        let parsed: NdjsonLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            // Malformed interleaved lines are skipped rather than fatal.
            Err(err) => {
                debug!(%err, "skipping malformed NDJSON line");
                return Ok(ParsedLine::Skip);
            }
        };
        if parsed.done {
            return Ok(ParsedLine::Done);
        }
        if parsed.message.content.is_empty() {
            return Ok(ParsedLine::Skip);
        }
        Ok(ParsedLine::Chunk(parsed.message.content))
    }
}

/// Reads the response body line by line, publishing chunks until the
/// parser signals termination or the body ends. The channel is closed on
/// every exit path because the sender is dropped with this task.
pub(crate) async fn pump_response<P: StreamParser>(
    response: reqwest::Response,
    parser: P,
    tx: mpsc::Sender<StreamChunk>,
) {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(StreamChunk::error(err.to_string())).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(position) = buffer.find('\n') {
            let line = buffer[..position].trim().to_string();
            buffer.drain(..=position);
            if line.is_empty() {
                continue;
            }
            match parser.parse_line(&line) {
                Ok(ParsedLine::Chunk(content)) => {
                    if tx.send(StreamChunk::text(content)).await.is_err() {
                        return;
                    }
                }
                Ok(ParsedLine::Done) => {
                    let _ = tx.send(StreamChunk::done()).await;
                    return;
                }
                Ok(ParsedLine::Skip) => {}
                Err(err) => {
                    let _ = tx.send(StreamChunk::error(err.to_string())).await;
                    return;
                }
            }
        }
    }
    // Upstream EOF without a terminal marker: close cleanly.
}
