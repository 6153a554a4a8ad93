//! SSE passthrough with usage capture.
//!
//! Upstream responses that already speak the client's protocol stream
//! through unchanged; usage is read from the frames and reported once the
//! stream ends so the metering path can debit after the fact.

use std::time::{Duration, Instant};

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::interval;

use crate::upstream::Usage;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

/// Pull usage out of one Claude SSE data frame, if it carries any.
pub fn usage_from_claude_frame(frame: &Value) -> Option<Usage> {
    match frame.get("type").and_then(|t| t.as_str())? {
        "message_start" => frame
            .get("message")
            .and_then(|m| m.get("usage"))
            .map(Usage::from_claude_json),
        "message_delta" => frame.get("usage").map(Usage::from_claude_json),
        _ => None,
    }
}

/// OpenAI chunk usage (`usage: {prompt_tokens, completion_tokens}`), present
/// on the final chunk when the client asked for it.
pub fn usage_from_openai_frame(frame: &Value) -> Option<Usage> {
    let usage = frame.get("usage").filter(|u| !u.is_null())?;
    Some(Usage {
        input_tokens: usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        cache_read_input_tokens: 0,
        cache_creation_input_tokens: 0,
    })
}

/// Gemini frame usage (`usageMetadata`); each frame may carry a snapshot and
/// the last one wins, so callers should REPLACE rather than add.
pub fn usage_from_gemini_frame(frame: &Value) -> Option<Usage> {
    let frame = frame.get("response").unwrap_or(frame);
    let meta = frame.get("usageMetadata")?;
    Some(Usage {
        input_tokens: meta
            .get("promptTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        output_tokens: meta
            .get("candidatesTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        cache_read_input_tokens: meta
            .get("cachedContentTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        cache_creation_input_tokens: 0,
    })
}

/// How a passthrough merges per-frame usage into the running total.
#[derive(Clone, Copy)]
pub enum UsageMode {
    /// Claude/OpenAI: frames carry disjoint counters; sum them.
    Accumulate,
    /// Gemini: frames carry cumulative snapshots; last wins.
    Replace,
}

/// Pass an upstream SSE byte stream through unchanged, extracting usage with
/// `extract` and injecting keep-alive comments. `completion` fires with
/// `(usage, first_token_ms)` when the upstream stream ends.
pub fn sse_passthrough(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    extract: fn(&Value) -> Option<Usage>,
    mode: UsageMode,
    completion: oneshot::Sender<(Usage, Option<i64>)>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        use futures_util::StreamExt;

        let started_at = Instant::now();
        let mut first_token_ms: Option<i64> = None;
        let mut usage = Usage::default();
        let mut buffer = String::new();

        let mut body = std::pin::pin!(body);
        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.reset();

        loop {
            tokio::select! {
                biased;

                chunk_opt = body.next() => {
                    let Some(chunk_result) = chunk_opt else {
                        break;
                    };
                    let chunk = match chunk_result {
                        Ok(c) => c,
                        Err(e) => {
                            yield Err(std::io::Error::other(e));
                            break;
                        }
                    };

                    if first_token_ms.is_none() {
                        first_token_ms = Some(started_at.elapsed().as_millis() as i64);
                    }

                    if let Ok(text) = std::str::from_utf8(&chunk) {
                        buffer.push_str(text);
                        while let Some(newline_pos) = buffer.find('\n') {
                            let line = buffer[..newline_pos].trim().to_string();
                            buffer = buffer[newline_pos + 1..].to_string();
                            if let Some(data) = line.strip_prefix("data: ")
                                && let Ok(frame) = serde_json::from_str::<Value>(data)
                                && let Some(frame_usage) = extract(&frame)
                            {
                                match mode {
                                    UsageMode::Accumulate => usage.add(&frame_usage),
                                    UsageMode::Replace => usage = frame_usage,
                                }
                            }
                        }
                    }

                    yield Ok(chunk);
                }

                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }

        let _ = completion.send((usage, first_token_ms));
    }
}

/// Claude SSE passthrough.
pub fn claude_sse_passthrough(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    completion: oneshot::Sender<(Usage, Option<i64>)>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    sse_passthrough(body, usage_from_claude_frame, UsageMode::Accumulate, completion)
}

/// OpenAI chat-completions SSE passthrough.
pub fn openai_sse_passthrough(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    completion: oneshot::Sender<(Usage, Option<i64>)>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    sse_passthrough(body, usage_from_openai_frame, UsageMode::Accumulate, completion)
}

/// Native Gemini streamGenerateContent SSE passthrough.
pub fn gemini_sse_passthrough(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    completion: oneshot::Sender<(Usage, Option<i64>)>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    sse_passthrough(body, usage_from_gemini_frame, UsageMode::Replace, completion)
}
