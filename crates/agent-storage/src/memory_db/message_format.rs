//! Message content shapes and the merge rule for partial content updates
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::memory_db::schema::Message;

/// Requested shape of message content. `v1` content is a string or a list
/// of parts; `v2` content is `{ format: 2, parts, content? }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    V1,
    V2,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::V1 => "v1",
            MessageFormat::V2 => "v2",
        }
    }

    pub fn convert(&self, content: Value) -> Value {
        match self {
            MessageFormat::V1 => to_v1(content),
            MessageFormat::V2 => to_v2(content),
        }
    }
}

fn to_v2(content: Value) -> Value {
    match content {
        Value::String(text) => json!({
            "format": 2,
            "parts": [{ "type": "text", "text": text }],
            "content": text,
        }),
        Value::Array(parts) => json!({ "format": 2, "parts": parts }),
        other => other,
    }
}

fn to_v1(content: Value) -> Value {
    let Value::Object(mut object) = content else {
        return content;
    };
    let Some(Value::Array(parts)) = object.remove("parts") else {
        return Value::Object(object);
    };
    if let Some(Value::String(text)) = object.remove("content") {
        return Value::String(text);
    }
    let texts: Option<Vec<&str>> = parts
        .iter()
        .map(|part| match (part.get("type").and_then(Value::as_str), part.get("text")) {
            (Some("text"), Some(Value::String(text))) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    match texts {
        Some(texts) if !texts.is_empty() => Value::String(texts.join("\n")),
        _ => Value::Array(parts),
    }
}

/// Messages collected from several reads, deduplicated by id.
#[derive(Debug, Default)]
pub struct MessageList {
    messages: Vec<Message>,
    positions: HashMap<String, usize>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A later message with an id already present replaces the earlier one.
    pub fn add(&mut self, message: Message) -> &mut Self {
        match self.positions.get(&message.id) {
            Some(&pos) => self.messages[pos] = message,
            None => {
                self.positions.insert(message.id.clone(), self.messages.len());
                self.messages.push(message);
            }
        }
        self
    }

    pub fn add_all<I: IntoIterator<Item = Message>>(&mut self, messages: I) -> &mut Self {
        for message in messages {
            self.add(message);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }

    /// Messages in insertion order, content untouched.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Messages in `format`, oldest first. Ties keep insertion order.
    pub fn into_sorted(self, format: MessageFormat) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .into_iter()
            .map(|mut message| {
                message.content = format.convert(message.content);
                message.message_type = format.as_str().to_string();
                message
            })
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }
}

/// Applies a content update to stored content. Two objects are spread
/// shallowly, except `metadata` which is merged one level deeper when both
/// sides carry an object there. Any other combination replaces the content.
pub fn merge_message_content(existing: &Value, update: Value) -> Value {
    let (existing, update) = match (existing, update) {
        (Value::Object(existing), Value::Object(update)) => (existing, update),
        (_, update) => return update,
    };
    let mut merged: Map<String, Value> = existing.clone();
    for (key, value) in update {
        let value = match (merged.get(&key), value) {
            (Some(Value::Object(old)), Value::Object(new)) if key == "metadata" => {
                let mut metadata = old.clone();
                metadata.extend(new);
                Value::Object(metadata)
            }
            (_, value) => value,
        };
        merged.insert(key, value);
    }
    Value::Object(merged)
}

/// Stored message text back into JSON; text that does not parse is kept
/// as the raw string.
pub fn parse_stored_content(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

/// Content as written to the text column: strings raw, everything else JSON.
pub fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
