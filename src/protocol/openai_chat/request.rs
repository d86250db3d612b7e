use serde_json::{json, Map, Value};

use crate::error::RelayError;

/// Convert a chat-completions request body into a Responses request body.
///
/// System and developer messages become `instructions`; tool calls and tool
/// results become `function_call` / `function_call_output` input items.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when the body is not an object or
/// has no `messages` array.
pub fn chat_to_responses_request(body: &Value) -> Result<Value, RelayError> {
    let request = body
        .as_object()
        .ok_or_else(|| RelayError::InvalidRequest("request body must be an object".into()))?;
    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::InvalidRequest("messages must be an array".into()))?;

    let mut out = Map::new();
    if let Some(model) = request.get("model") {
        out.insert("model".into(), model.clone());
    }

    let mut instructions = Vec::new();
    let mut input = Vec::with_capacity(messages.len());
    for message in messages {
        convert_message(message, &mut instructions, &mut input);
    }
    if !instructions.is_empty() {
        out.insert("instructions".into(), Value::String(instructions.join("\n\n")));
    }
    out.insert("input".into(), Value::Array(input));

    if let Some(tools) = request.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools.iter().filter_map(convert_tool).collect();
        if !converted.is_empty() {
            out.insert("tools".into(), Value::Array(converted));
        }
    }
    if let Some(choice) = request.get("tool_choice") {
        out.insert("tool_choice".into(), convert_tool_choice(choice));
    }

    let max_tokens = request
        .get("max_completion_tokens")
        .or_else(|| request.get("max_tokens"));
    if let Some(max_tokens) = max_tokens.filter(|value| !value.is_null()) {
        out.insert("max_output_tokens".into(), max_tokens.clone());
    }
    if let Some(effort) = request.get("reasoning_effort").and_then(Value::as_str) {
        out.insert("reasoning".into(), json!({ "effort": effort, "summary": "auto" }));
    }
    if let Some(format) = request.get("response_format") {
        if let Some(text) = convert_response_format(format) {
            out.insert("text".into(), text);
        }
    }

    for key in [
        "stream",
        "temperature",
        "top_p",
        "parallel_tool_calls",
        "user",
        "store",
        "metadata",
        "service_tier",
        "prompt_cache_key",
        "safety_identifier",
    ] {
        if let Some(value) = request.get(key).filter(|value| !value.is_null()) {
            out.insert(key.into(), value.clone());
        }
    }

    Ok(Value::Object(out))
}

fn convert_message(message: &Value, instructions: &mut Vec<String>, input: &mut Vec<Value>) {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
    match role {
        "system" | "developer" => {
            let text = content_text(message.get("content"));
            if !text.is_empty() {
                instructions.push(text);
            }
        }
        "tool" => {
            let call_id = message
                .get("tool_call_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            input.push(json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": content_text(message.get("content")),
            }));
        }
        "assistant" => {
            let text = content_text(message.get("content"));
            if !text.is_empty() {
                input.push(json!({
                    "role": "assistant",
                    "content": [{ "type": "output_text", "text": text }],
                }));
            }
            if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let function = call.get("function");
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.get("id").and_then(Value::as_str).unwrap_or_default(),
                        "name": function
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                        "arguments": function
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str)
                            .unwrap_or("{}"),
                    }));
                }
            }
        }
        _ => {
            input.push(json!({
                "role": role,
                "content": convert_user_content(message.get("content")),
            }));
        }
    }
}

fn convert_user_content(content: Option<&Value>) -> Value {
    match content {
        Some(Value::Array(parts)) => Value::Array(
            parts
                .iter()
                .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                    Some("text") => Some(json!({
                        "type": "input_text",
                        "text": part.get("text").cloned().unwrap_or(Value::Null),
                    })),
                    Some("image_url") => {
                        let url = match part.get("image_url") {
                            Some(Value::Object(image)) => image.get("url").cloned(),
                            Some(Value::String(url)) => Some(Value::String(url.clone())),
                            _ => None,
                        }?;
                        Some(json!({ "type": "input_image", "image_url": url }))
                    }
                    _ => None,
                })
                .collect(),
        ),
        Some(Value::String(text)) => json!([{ "type": "input_text", "text": text }]),
        _ => json!([]),
    }
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn convert_tool(tool: &Value) -> Option<Value> {
    if tool.get("type").and_then(Value::as_str) != Some("function") {
        return Some(tool.clone());
    }
    let function = tool.get("function")?;
    let mut out = Map::new();
    out.insert("type".into(), Value::String("function".into()));
    out.insert("name".into(), function.get("name")?.clone());
    for key in ["description", "parameters", "strict"] {
        if let Some(value) = function.get(key) {
            out.insert(key.into(), value.clone());
        }
    }
    Some(Value::Object(out))
}

fn convert_tool_choice(choice: &Value) -> Value {
    match choice {
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("function") => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .cloned()
                .unwrap_or(Value::Null);
            json!({ "type": "function", "name": name })
        }
        other => other.clone(),
    }
}

fn convert_response_format(format: &Value) -> Option<Value> {
    match format.get("type").and_then(Value::as_str)? {
        "json_schema" => {
            let schema = format.get("json_schema")?;
            let mut out = Map::new();
            out.insert("type".into(), Value::String("json_schema".into()));
            if let Some(obj) = schema.as_object() {
                for (key, value) in obj {
                    out.insert(key.clone(), value.clone());
                }
            }
            Some(json!({ "format": Value::Object(out) }))
        }
        kind => Some(json!({ "format": { "type": kind } })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_messages_become_instructions() {
        let body = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "stream": true,
            "max_tokens": 50
        });
        let out = chat_to_responses_request(&body).unwrap();
        assert_eq!(out["instructions"], "be brief");
        assert_eq!(out["input"][0]["role"], "user");
        assert_eq!(out["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(out["max_output_tokens"], 50);
        assert_eq!(out["stream"], true);
        assert!(out.get("messages").is_none());
    }

    #[test]
    fn test_tool_round_trip_items() {
        let body = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "tool_choice": {"type": "function", "function": {"name": "lookup"}}
        });
        let out = chat_to_responses_request(&body).unwrap();
        assert_eq!(out["input"][1]["type"], "function_call");
        assert_eq!(out["input"][1]["call_id"], "call_1");
        assert_eq!(out["input"][2]["type"], "function_call_output");
        assert_eq!(out["input"][2]["output"], "sunny");
        assert_eq!(out["tools"][0]["name"], "lookup");
        assert_eq!(out["tool_choice"]["name"], "lookup");
    }

    #[test]
    fn test_missing_messages_is_invalid() {
        let err = chat_to_responses_request(&json!({"model": "x"})).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }
}
