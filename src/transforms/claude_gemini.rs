//! Claude-Messages ⇄ Gemini generateContent body translation.

use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Keys Gemini's schema validator rejects.
const STRIPPED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "additionalProperties",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
];

/// Sanitize a JSON schema for Gemini `functionDeclarations.parameters`:
/// strip unsupported keys and uppercase `type` values, recursively.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if STRIPPED_SCHEMA_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if key == "type" {
                    if let Some(t) = value.as_str() {
                        out.insert(key.clone(), Value::String(t.to_uppercase()));
                        continue;
                    }
                }
                out.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// System prompt (string or text blocks) → `systemInstruction`.
fn system_instruction(system: &Value) -> Option<Value> {
    let parts: Vec<Value> = match system {
        Value::String(text) if !text.is_empty() => vec![json!({"text": text})],
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .map(|t| json!({"text": t}))
            .collect(),
        _ => Vec::new(),
    };
    if parts.is_empty() {
        None
    } else {
        Some(json!({"parts": parts}))
    }
}

/// Map of tool_use id → tool name, needed because Gemini's
/// `functionResponse` is keyed by name rather than call id.
fn tool_use_names(messages: &[Value]) -> Map<String, Value> {
    let mut names = Map::new();
    for message in messages {
        let Some(blocks) = message.get("content").and_then(|c| c.as_array()) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                && let (Some(id), Some(name)) = (
                    block.get("id").and_then(|i| i.as_str()),
                    block.get("name").and_then(|n| n.as_str()),
                )
            {
                names.insert(id.to_string(), Value::String(name.to_string()));
            }
        }
    }
    names
}

fn block_to_part(block: &Value, tool_names: &Map<String, Value>) -> Option<Value> {
    match block.get("type").and_then(|t| t.as_str())? {
        "text" => block
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| json!({"text": t})),
        "tool_use" => {
            let name = block.get("name").and_then(|n| n.as_str())?;
            let args = block.get("input").cloned().unwrap_or(json!({}));
            Some(json!({"functionCall": {"name": name, "args": args}}))
        }
        "tool_result" => {
            let id = block.get("tool_use_id").and_then(|i| i.as_str()).unwrap_or("");
            let name = tool_names
                .get(id)
                .and_then(|n| n.as_str())
                .unwrap_or(id)
                .to_string();
            let content = block.get("content").cloned().unwrap_or(Value::Null);
            let result = match &content {
                Value::String(s) => Value::String(s.clone()),
                Value::Array(blocks) => {
                    let text: String = blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Value::String(text)
                }
                other => other.clone(),
            };
            Some(json!({
                "functionResponse": {"name": name, "response": {"result": result}}
            }))
        }
        "image" => {
            let source = block.get("source")?;
            let mime = source.get("media_type").and_then(|m| m.as_str())?;
            let data = source.get("data").and_then(|d| d.as_str())?;
            Some(json!({"inlineData": {"mimeType": mime, "data": data}}))
        }
        _ => None,
    }
}

/// Translate a Claude-Messages request body into a Gemini
/// generateContent body.
pub fn claude_to_gemini_request(body: &Value) -> Value {
    let mut out = Map::new();

    if let Some(system) = body.get("system")
        && let Some(instruction) = system_instruction(system)
    {
        out.insert("systemInstruction".to_string(), instruction);
    }

    let empty = Vec::new();
    let messages = body
        .get("messages")
        .and_then(|m| m.as_array())
        .unwrap_or(&empty);
    let tool_names = tool_use_names(messages);

    let mut contents = Vec::new();
    for message in messages {
        let role = match message.get("role").and_then(|r| r.as_str()) {
            Some("assistant") => "model",
            _ => "user",
        };
        let parts: Vec<Value> = match message.get("content") {
            Some(Value::String(text)) => vec![json!({"text": text})],
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| block_to_part(b, &tool_names))
                .collect(),
            _ => Vec::new(),
        };
        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }
    out.insert("contents".to_string(), Value::Array(contents));

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array())
        && !tools.is_empty()
    {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                // MCP custom tools carry `type: "custom"` with the same shape.
                let name = tool.get("name").and_then(|n| n.as_str())?;
                let mut decl = Map::new();
                decl.insert("name".to_string(), Value::String(name.to_string()));
                if let Some(desc) = tool.get("description").and_then(|d| d.as_str()) {
                    decl.insert("description".to_string(), Value::String(desc.to_string()));
                }
                if let Some(schema) = tool.get("input_schema") {
                    decl.insert("parameters".to_string(), sanitize_schema(schema));
                }
                Some(Value::Object(decl))
            })
            .collect();
        if !declarations.is_empty() {
            out.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
        }
    }

    let mut generation = Map::new();
    if let Some(max_tokens) = body.get("max_tokens").and_then(|v| v.as_i64()) {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = body.get("temperature").and_then(|v| v.as_f64()) {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = body.get("top_p").and_then(|v| v.as_f64()) {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = body.get("top_k").and_then(|v| v.as_i64()) {
        generation.insert("topK".to_string(), json!(top_k));
    }
    if let Some(stops) = body.get("stop_sequences").and_then(|v| v.as_array())
        && !stops.is_empty()
    {
        generation.insert("stopSequences".to_string(), Value::Array(stops.clone()));
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Value::Object(out)
}

/// `MAX_TOKENS` → max_tokens, everything else → end_turn; any emitted
/// tool-use overrides to tool_use.
pub fn map_finish_reason(finish: Option<&str>, has_tool_use: bool) -> &'static str {
    if has_tool_use {
        return "tool_use";
    }
    match finish {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

/// Translate a complete (non-streaming) Gemini response into a Claude
/// message.
pub fn gemini_to_claude_response(gemini: &Value, model: &str) -> Value {
    let parts = gemini
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut content = Vec::new();
    let mut has_tool_use = false;
    for part in &parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            content.push(json!({"type": "text", "text": text}));
        } else if let Some(call) = part.get("functionCall") {
            has_tool_use = true;
            content.push(json!({
                "type": "tool_use",
                "id": format!("toolu_{}", Uuid::new_v4().simple()),
                "name": call.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                "input": call.get("args").cloned().unwrap_or(json!({})),
            }));
        }
    }

    let finish = gemini
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"))
        .and_then(|f| f.as_str());
    let usage = gemini.get("usageMetadata");
    let input_tokens = usage
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": map_finish_reason(finish, has_tool_use),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_sanitizer_strips_and_uppercases() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "name": {"type": "string", "minLength": 1, "maxLength": 64},
                "tags": {"type": "array", "minItems": 1, "items": {"type": "string", "$ref": "#/x"}}
            }
        });
        let clean = sanitize_schema(&schema);
        assert_eq!(clean["type"], "OBJECT");
        assert!(clean.get("$schema").is_none());
        assert!(clean.get("additionalProperties").is_none());
        assert_eq!(clean["properties"]["name"]["type"], "STRING");
        assert!(clean["properties"]["name"].get("minLength").is_none());
        assert_eq!(clean["properties"]["tags"]["items"]["type"], "STRING");
        assert!(clean["properties"]["tags"].get("minItems").is_none());
        assert!(clean["properties"]["tags"]["items"].get("$ref").is_none());
    }

    #[test]
    fn system_string_and_blocks_map_to_instruction() {
        let body = json!({"system": "be terse", "messages": []});
        let gemini = claude_to_gemini_request(&body);
        assert_eq!(gemini["systemInstruction"]["parts"][0]["text"], "be terse");

        let body = json!({
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "messages": []
        });
        let gemini = claude_to_gemini_request(&body);
        assert_eq!(gemini["systemInstruction"]["parts"][1]["text"], "b");
    }

    #[test]
    fn blocks_round_trip_preserving_order() {
        let body = json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}}
                ]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found it"}
                ]}
            ]
        });
        let gemini = claude_to_gemini_request(&body);
        let contents = gemini["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);

        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "look at this");
        assert_eq!(contents[0]["parts"][1]["inlineData"]["mimeType"], "image/png");

        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "lookup");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["q"], "x");

        // functionResponse resolved to the tool's name via the id map.
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "lookup");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["result"],
            "found it"
        );
    }

    #[test]
    fn tools_become_function_declarations() {
        let body = json!({
            "messages": [],
            "tools": [
                {"name": "search", "description": "find things", "input_schema": {"type": "object"}},
                {"type": "custom", "name": "mcp_tool", "input_schema": {"type": "object"}}
            ],
            "max_tokens": 1024,
            "temperature": 0.5,
            "stop_sequences": ["END"]
        });
        let gemini = claude_to_gemini_request(&body);
        let decls = gemini["tools"][0]["functionDeclarations"].as_array().unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0]["name"], "search");
        assert_eq!(decls[0]["parameters"]["type"], "OBJECT");
        assert_eq!(decls[1]["name"], "mcp_tool");
        assert_eq!(gemini["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(gemini["generationConfig"]["stopSequences"][0], "END");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("MAX_TOKENS"), false), "max_tokens");
        assert_eq!(map_finish_reason(Some("STOP"), false), "end_turn");
        assert_eq!(map_finish_reason(None, false), "end_turn");
        // tool_use overrides everything.
        assert_eq!(map_finish_reason(Some("MAX_TOKENS"), true), "tool_use");
    }

    #[test]
    fn non_stream_response_translation() {
        let gemini = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "hello "},
                    {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 7}
        });
        let claude = gemini_to_claude_response(&gemini, "gemini-2.5-pro");
        assert_eq!(claude["type"], "message");
        assert_eq!(claude["role"], "assistant");
        assert_eq!(claude["content"][0]["type"], "text");
        assert_eq!(claude["content"][1]["type"], "tool_use");
        assert_eq!(claude["content"][1]["name"], "lookup");
        assert_eq!(claude["stop_reason"], "tool_use");
        assert_eq!(claude["usage"]["input_tokens"], 12);
        assert_eq!(claude["usage"]["output_tokens"], 7);
    }

    #[test]
    fn claude_gemini_claude_round_trip_preserves_payloads() {
        let original = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_9", "name": "calc", "input": {"a": 1, "b": 2}}
                ]}
            ]
        });
        let gemini = claude_to_gemini_request(&original);
        // Re-wrap the model turn as a Gemini response and translate back.
        let response = json!({
            "candidates": [{"content": gemini["contents"][0].clone(), "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 2}
        });
        let claude = gemini_to_claude_response(&response, "gemini-2.5-pro");
        assert_eq!(claude["content"][0]["text"], "checking");
        assert_eq!(claude["content"][1]["name"], "calc");
        assert_eq!(claude["content"][1]["input"], json!({"a": 1, "b": 2}));
    }
}
