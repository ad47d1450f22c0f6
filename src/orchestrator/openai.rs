use serde::Deserialize;
use serde_json::{json, Value};

use super::error::GatewayError;
use super::upstream::BackendQuery;
use crate::constants::MODEL_OWNER;

pub const SSE_DONE: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// Inbound `/v1/chat/completions` body. Fields we do not use are ignored, not rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

fn default_model() -> String {
    "auto".to_string()
}

impl ChatCompletionRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Plain text of a message `content`, which may be a string or a list of typed parts.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                _ => p.get("text").and_then(|v| v.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Folds the OpenAI turn list into the backend's single message body plus system prompt.
pub fn translate_request(req: &ChatCompletionRequest) -> Result<BackendQuery, GatewayError> {
    let Some(last) = req.messages.last() else {
        return Err(GatewayError::InvalidRequest(
            "`messages` must contain at least one message".to_string(),
        ));
    };

    let mut system_parts = Vec::new();
    let mut turns: Vec<(&str, String)> = Vec::new();
    for m in &req.messages {
        let text = content_text(&m.content);
        match m.role.as_str() {
            "system" | "developer" => system_parts.push(text),
            "user" => turns.push(("User", text)),
            "assistant" => turns.push(("Assistant", text)),
            other => log::debug!("ignoring message with role {other:?}"),
        }
    }

    let body = match turns.as_slice() {
        [(_, only)] => only.clone(),
        [] => content_text(&last.content),
        many => many
            .iter()
            .map(|(speaker, text)| format!("{speaker}: {text}"))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    let system_prompt = Some(system_parts.join("\n\n")).filter(|s| !s.trim().is_empty());

    Ok(BackendQuery {
        body,
        system_prompt,
        temperature: req.temperature,
    })
}

pub fn completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..24])
}

/// Best-effort usage: roughly four characters per token. The backend reports nothing usable.
pub fn estimate_usage(prompt: &str, completion: &str) -> Value {
    let p = prompt.chars().count();
    let c = completion.chars().count();
    json!({
        "prompt_tokens": p / 4,
        "completion_tokens": c / 4,
        "total_tokens": (p + c) / 4,
    })
}

fn prompt_text(query: &BackendQuery) -> String {
    match query.system_prompt.as_deref() {
        Some(sp) => format!("{sp}\n{}", query.body),
        None => query.body.clone(),
    }
}

pub fn chat_completion_json(
    id: &str,
    model: &str,
    created: u64,
    query: &BackendQuery,
    content: &str,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": estimate_usage(&prompt_text(query), content),
    })
}

pub fn chat_chunk_json(
    id: &str,
    model: &str,
    created: u64,
    delta: Value,
    finish_reason: Option<&str>,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

pub fn model_json(id: &str, created: u64) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": created,
        "owned_by": MODEL_OWNER,
    })
}

pub fn models_list_json(models: &[String], created: u64) -> Value {
    json!({
        "object": "list",
        "data": models.iter().map(|m| model_json(m, created)).collect::<Vec<_>>(),
    })
}

pub fn sse_data(v: &Value) -> String {
    let s = serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string());
    format!("data: {s}\n\n")
}
