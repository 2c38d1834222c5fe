//! Decoding of the structured reply object
//!
//! The persona instruction asks for `{"response": "...", "emotion": "..."}`
//! and nothing else, but the generated text is not trusted: fields may be
//! missing, the emotion may be outside the enum, or the object may come
//! wrapped in a Markdown code fence.

use super::fallback::UNCLEAR_REPLY;
use super::{BotReply, Emotion, LlmError};
use serde_json::Value;

/// Outcome of decoding one generated reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Both fields present and valid
    Clean(BotReply),
    /// Usable after coercion; `problem` describes what was repaired
    Coerced { reply: BotReply, problem: String },
}

impl Decoded {
    #[allow(dead_code)] // Used in tests
    pub fn into_reply(self) -> BotReply {
        match self {
            Decoded::Clean(reply) | Decoded::Coerced { reply, .. } => reply,
        }
    }
}

/// Decode generated text. Errors only when no JSON object can be recovered.
pub fn decode_reply(raw: &str) -> Result<Decoded, LlmError> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::malformed(format!("reply is not JSON: {e}")))?;
    let Value::Object(fields) = value else {
        return Err(LlmError::malformed("reply is not a JSON object"));
    };

    let mut problems = Vec::new();

    let text = match fields.get("response") {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(_) => {
            problems.push("reply text is empty or not a string".to_string());
            UNCLEAR_REPLY.to_string()
        }
        None => {
            problems.push("reply text is missing".to_string());
            UNCLEAR_REPLY.to_string()
        }
    };

    let emotion = match fields.get("emotion") {
        Some(Value::String(name)) => Emotion::parse(name).unwrap_or_else(|| {
            problems.push(format!("unknown emotion '{name}'"));
            Emotion::Neutral
        }),
        Some(other) => {
            problems.push(format!("emotion is not a string: {other}"));
            Emotion::Neutral
        }
        None => {
            problems.push("emotion is missing".to_string());
            Emotion::Neutral
        }
    };

    let reply = BotReply::new(text, emotion);
    if problems.is_empty() {
        Ok(Decoded::Clean(reply))
    } else {
        Ok(Decoded::Coerced {
            reply,
            problem: format!("malformed reply: {}", problems.join("; ")),
        })
    }
}

/// Remove a surrounding ```json ... ``` fence, if any
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening line
    match inner.split_once('\n') {
        Some((tag, body)) if !tag.trim_start().starts_with('{') => body.trim(),
        _ => inner.trim(),
    }
}
