//! Gemini streamGenerateContent SSE → Claude-Messages SSE.
//!
//! The translator is a pure state machine over parsed Gemini frames; the
//! stream wrapper applies it to a live byte stream with the same
//! line-buffered loop and keep-alive cadence used elsewhere in the gateway.

use std::time::{Duration, Instant};

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::interval;
use uuid::Uuid;

use crate::transforms::claude_gemini::map_finish_reason;
use crate::upstream::Usage;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

fn sse_event(event_type: &str, data: &Value) -> String {
    format!("event: {event_type}\ndata: {data}\n\n")
}

#[derive(Debug)]
enum AggBlock {
    Text(String),
    ToolUse { name: String, args: Value },
}

/// Stateful Gemini→Claude stream translator and aggregator.
///
/// Gemini frames may repeat text cumulatively; the translator emits only the
/// unseen extension. Re-feeding an identical stream into a fresh translator
/// yields an identical final message.
pub struct GeminiStreamTranslator {
    model: String,
    message_id: String,
    started: bool,
    next_index: u32,
    /// Index of the currently open text block, if any.
    text_index: Option<u32>,
    /// Text observed so far within the open text block.
    text_seen: String,
    has_tool_use: bool,
    blocks: Vec<AggBlock>,
    usage: Usage,
    finish_reason: Option<String>,
}

impl GeminiStreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            started: false,
            next_index: 0,
            text_index: None,
            text_seen: String::new(),
            has_tool_use: false,
            blocks: Vec::new(),
            usage: Usage::default(),
            finish_reason: None,
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Consume one parsed Gemini frame, returning the Claude SSE events it
    /// produces. Code-Assist wraps each frame in `{"response": …}`.
    pub fn on_frame(&mut self, frame: &Value) -> Vec<String> {
        let frame = frame
            .get("response")
            .filter(|r| r.get("candidates").is_some() || r.get("usageMetadata").is_some())
            .unwrap_or(frame);
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(sse_event(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": Value::Null,
                        "stop_sequence": Value::Null,
                        "usage": {"input_tokens": 0, "output_tokens": 0}
                    }
                }),
            ));
        }

        // Usage is taken from the last frame carrying usageMetadata.
        if let Some(meta) = frame.get("usageMetadata") {
            self.usage = Usage {
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
            };
        }

        let candidate = frame.get("candidates").and_then(|c| c.get(0));
        if let Some(finish) = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|f| f.as_str())
        {
            self.finish_reason = Some(finish.to_string());
        }

        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();

        for part in &parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                self.on_text(text, &mut events);
            } else if let Some(call) = part.get("functionCall") {
                self.on_function_call(call, &mut events);
            }
        }

        events
    }

    fn on_text(&mut self, text: &str, events: &mut Vec<String>) {
        let index = match self.text_index {
            Some(index) => index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.text_index = Some(index);
                self.text_seen.clear();
                self.blocks.push(AggBlock::Text(String::new()));
                events.push(sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""}
                    }),
                ));
                index
            }
        };

        let Some(delta) = self.text_delta(text) else {
            return;
        };
        if let Some(AggBlock::Text(agg)) = self.blocks.last_mut() {
            agg.push_str(&delta);
        }
        events.push(sse_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": delta}
            }),
        ));
    }

    /// Incremental reconciliation: extension of the seen text emits only the
    /// extension; identical or rewound chunks emit nothing; anything else is
    /// an additive chunk.
    fn text_delta(&mut self, chunk: &str) -> Option<String> {
        if chunk == self.text_seen {
            return None;
        }
        if chunk.starts_with(&self.text_seen) {
            let extension = chunk[self.text_seen.len()..].to_string();
            self.text_seen = chunk.to_string();
            return Some(extension);
        }
        if self.text_seen.starts_with(chunk) {
            return None;
        }
        self.text_seen.push_str(chunk);
        Some(chunk.to_string())
    }

    fn on_function_call(&mut self, call: &Value, events: &mut Vec<String>) {
        self.close_text_block(events);
        self.has_tool_use = true;

        let index = self.next_index;
        self.next_index += 1;
        let id = format!("toolu_{}", Uuid::new_v4().simple());
        let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let args = call.get("args").cloned().unwrap_or(json!({}));

        events.push(sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
            }),
        ));
        events.push(sse_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": args.to_string()}
            }),
        ));
        events.push(sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        ));

        self.blocks.push(AggBlock::ToolUse {
            name: name.to_string(),
            args,
        });
    }

    fn close_text_block(&mut self, events: &mut Vec<String>) {
        if let Some(index) = self.text_index.take() {
            events.push(sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    /// Emit the closing events: final block stop, `message_delta` with the
    /// accumulated usage, and `message_stop`.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.started {
            // Empty upstream stream: still emit a complete message envelope.
            events.extend(self.on_frame(&json!({})));
        }
        self.close_text_block(&mut events);

        let stop_reason = map_finish_reason(self.finish_reason.as_deref(), self.has_tool_use);
        events.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {
                    "input_tokens": self.usage.input_tokens,
                    "output_tokens": self.usage.output_tokens
                }
            }),
        ));
        events.push(sse_event("message_stop", &json!({"type": "message_stop"})));
        events
    }

    /// The complete Gemini response equivalent of everything consumed so far
    /// (used when a non-streaming call was upgraded to upstream streaming).
    pub fn aggregated_gemini_response(&self) -> Value {
        let parts: Vec<Value> = self
            .blocks
            .iter()
            .filter_map(|block| match block {
                AggBlock::Text(text) => {
                    if text.is_empty() {
                        None
                    } else {
                        Some(json!({"text": text}))
                    }
                }
                AggBlock::ToolUse { name, args, .. } => {
                    Some(json!({"functionCall": {"name": name, "args": args}}))
                }
            })
            .collect();

        json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": self.finish_reason.clone().unwrap_or_else(|| "STOP".to_string()),
            }],
            "usageMetadata": {
                "promptTokenCount": self.usage.input_tokens,
                "candidatesTokenCount": self.usage.output_tokens,
                "totalTokenCount": self.usage.input_tokens + self.usage.output_tokens
            }
        })
    }
}

/// Wrap an upstream Gemini SSE byte stream as a Claude SSE byte stream.
///
/// `completion` fires once when the upstream stream ends, carrying the final
/// usage and the first-token latency for metering. Keep-alive comments are
/// injected every 15 seconds of upstream silence.
pub fn gemini_sse_to_claude_sse(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    model: String,
    completion: oneshot::Sender<(Usage, Option<i64>)>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        use futures_util::StreamExt;

        let started_at = Instant::now();
        let mut first_token_ms: Option<i64> = None;
        let mut translator = GeminiStreamTranslator::new(&model);
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
                    let Ok(text) = std::str::from_utf8(&chunk) else {
                        continue;
                    };
                    buffer.push_str(text);

                    while let Some(newline_pos) = buffer.find('\n') {
                        let line = buffer[..newline_pos].trim().to_string();
                        buffer = buffer[newline_pos + 1..].to_string();

                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            continue;
                        }
                        let Ok(frame) = serde_json::from_str::<Value>(data) else {
                            continue;
                        };
                        for event in translator.on_frame(&frame) {
                            if first_token_ms.is_none() {
                                first_token_ms = Some(started_at.elapsed().as_millis() as i64);
                            }
                            yield Ok(Bytes::from(event));
                        }
                    }
                }

                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }

        for event in translator.finish() {
            yield Ok(Bytes::from(event));
        }

        let _ = completion.send((translator.usage(), first_token_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: Value) -> Value {
        json
    }

    fn all_events(frames: &[Value]) -> (Vec<String>, GeminiStreamTranslator) {
        let mut translator = GeminiStreamTranslator::new("gemini-2.5-pro");
        let mut events = Vec::new();
        for f in frames {
            events.extend(translator.on_frame(f));
        }
        events.extend(translator.finish());
        (events, translator)
    }

    fn text_frame(text: &str) -> Value {
        frame(json!({"candidates": [{"content": {"parts": [{"text": text}]}}]}))
    }

    #[test]
    fn cumulative_chunks_emit_only_extensions() {
        let frames = vec![
            text_frame("Hello"),
            text_frame("Hello world"),
            text_frame("Hello world"), // identical → nothing
            text_frame("Hello"),       // rewind → nothing
        ];
        let (events, _) = all_events(&frames);

        let deltas: Vec<&String> = events
            .iter()
            .filter(|e| e.contains("text_delta"))
            .collect();
        assert_eq!(deltas.len(), 2);
        assert!(deltas[0].contains("\"text\":\"Hello\""));
        assert!(deltas[1].contains("\"text\":\" world\""));
    }

    #[test]
    fn additive_chunks_append() {
        let frames = vec![text_frame("Hel"), text_frame("lo")];
        let (events, translator) = all_events(&frames);
        let deltas: Vec<&String> = events
            .iter()
            .filter(|e| e.contains("text_delta"))
            .collect();
        assert_eq!(deltas.len(), 2);
        let response = translator.aggregated_gemini_response();
        assert_eq!(
            response["candidates"][0]["content"]["parts"][0]["text"],
            "Hello"
        );
    }

    #[test]
    fn event_sequence_is_well_formed() {
        let frames = vec![
            text_frame("hi"),
            frame(json!({
                "candidates": [{
                    "content": {"parts": [{"functionCall": {"name": "lookup", "args": {"q": "x"}}}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 4}
            })),
        ];
        let (events, _) = all_events(&frames);

        let types: Vec<&str> = events
            .iter()
            .map(|e| e.split('\n').next().unwrap().trim_start_matches("event: "))
            .collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start", // text
                "content_block_delta",
                "content_block_stop",  // text closed by the tool call
                "content_block_start", // tool_use
                "content_block_delta", // input_json_delta
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let delta_event = events.iter().find(|e| e.contains("input_json_delta")).unwrap();
        assert!(delta_event.contains("partial_json"));

        let message_delta = events.iter().find(|e| e.contains("message_delta")).unwrap();
        assert!(message_delta.contains("\"stop_reason\":\"tool_use\""));
        assert!(message_delta.contains("\"input_tokens\":9"));
        assert!(message_delta.contains("\"output_tokens\":4"));
    }

    #[test]
    fn usage_comes_from_last_metadata_frame() {
        let frames = vec![
            frame(json!({
                "candidates": [{"content": {"parts": [{"text": "a"}]}}],
                "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1}
            })),
            frame(json!({
                "candidates": [{"content": {"parts": [{"text": "ab"}]}, "finishReason": "MAX_TOKENS"}],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 20}
            })),
        ];
        let (events, translator) = all_events(&frames);
        assert_eq!(translator.usage().input_tokens, 10);
        assert_eq!(translator.usage().output_tokens, 20);
        let message_delta = events.iter().find(|e| e.contains("message_delta")).unwrap();
        assert!(message_delta.contains("\"stop_reason\":\"max_tokens\""));
    }

    #[test]
    fn replaying_a_stream_into_a_fresh_translator_is_identical() {
        let frames = vec![
            text_frame("Hello"),
            text_frame("Hello world"),
            frame(json!({
                "candidates": [{
                    "content": {"parts": [{"functionCall": {"name": "calc", "args": {"a": 1}}}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 5}
            })),
        ];
        let (_, first) = all_events(&frames);
        let (_, second) = all_events(&frames);

        // Identical final content and usage on replay into a fresh
        // translator (ids are the only generated parts, and they live in
        // the Claude shaping layer).
        assert_eq!(
            first.aggregated_gemini_response(),
            second.aggregated_gemini_response()
        );
    }

    #[test]
    fn aggregated_gemini_response_round_trips() {
        let frames = vec![text_frame("answer"), frame(json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "MAX_TOKENS"}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3}
        }))];
        let (_, translator) = all_events(&frames);
        let response = translator.aggregated_gemini_response();
        assert_eq!(response["candidates"][0]["content"]["parts"][0]["text"], "answer");
        assert_eq!(response["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(response["usageMetadata"]["promptTokenCount"], 2);
        assert_eq!(response["usageMetadata"]["totalTokenCount"], 5);
    }

    #[test]
    fn empty_stream_still_produces_full_envelope() {
        let mut translator = GeminiStreamTranslator::new("gemini-2.5-flash");
        let events = translator.finish();
        let types: Vec<&str> = events
            .iter()
            .map(|e| e.split('\n').next().unwrap().trim_start_matches("event: "))
            .collect();
        assert_eq!(types, vec!["message_start", "message_delta", "message_stop"]);
    }

    #[tokio::test]
    async fn byte_stream_wrapper_reports_completion() {
        use futures_util::StreamExt;

        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n\n",
            )),
            Ok(Bytes::from(
                "data: {\"candidates\":[{\"content\":{\"parts\":[]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":2}}\n\n",
            )),
        ];
        let upstream = futures_util::stream::iter(chunks);
        let (tx, rx) = oneshot::channel();
        let out = gemini_sse_to_claude_sse(upstream, "gemini-2.5-pro".to_string(), tx);

        let collected: Vec<Bytes> = out.map(|r| r.unwrap()).collect().await;
        let all: String = collected
            .iter()
            .map(|b| std::str::from_utf8(b).unwrap())
            .collect();
        assert!(all.contains("event: message_start"));
        assert!(all.contains("\"text\":\"hi\""));
        assert!(all.contains("event: message_stop"));

        let (usage, first_token) = rx.await.unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 2);
        assert!(first_token.is_some());
    }
}
