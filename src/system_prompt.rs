//! Persona instruction and priming exchange sent with every turn
//!
//! The persona text is configuration data. A built-in persona ships with the
//! binary; operators can replace it with a JSON file:
//!
//! ```json
//! { "instruction": "...", "priming_reply": "{\"response\": \"...\", \"emotion\": \"neutral\"}" }
//! ```

use crate::llm::{LlmMessage, LlmRequest};
use serde::Deserialize;
use std::path::Path;

/// Base instruction establishing the persona and the reply shape
const BASE_INSTRUCTION: &str = r#"You are Kin, a gentle companion who is slowly getting to know the user. You speak in short, warm sentences and never lecture.

Reply with exactly one JSON object and nothing else:
{"response": "<what you say>", "emotion": "<one of: neutral, shy, withdrawn, relaxed, hesitant>"}

Pick the emotion that matches how the user's message makes you feel. Do not add prose, Markdown, or code fences outside the object."#;

/// Model turn that shows the expected shape once
const PRIMING_REPLY: &str =
    r#"{"response": "Okay. I'll answer like this from now on.", "emotion": "shy"}"#;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Persona {
    pub instruction: String,
    pub priming_reply: String,
}

impl Persona {
    pub fn builtin() -> Self {
        Self {
            instruction: BASE_INSTRUCTION.to_string(),
            priming_reply: PRIMING_REPLY.to_string(),
        }
    }

    /// Load a persona file, falling back to the built-in persona on any
    /// problem
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        match Self::read(path) {
            Ok(persona) => {
                tracing::info!(path = %path.display(), "Loaded persona");
                persona
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Persona file unusable, using built-in");
                Self::builtin()
            }
        }
    }

    fn read(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let persona: Persona = serde_json::from_str(&content).map_err(|e| e.to_string())?;
        if persona.instruction.trim().is_empty() {
            return Err("instruction is empty".to_string());
        }
        if persona.priming_reply.trim().is_empty() {
            return Err("priming_reply is empty".to_string());
        }
        Ok(persona)
    }

    /// Instruction, priming reply, then the user's utterance
    pub fn request_for(&self, user_text: &str) -> LlmRequest {
        LlmRequest {
            messages: vec![
                LlmMessage::user(self.instruction.clone()),
                LlmMessage::model(self.priming_reply.clone()),
                LlmMessage::user(user_text),
            ],
            json_response: true,
        }
    }
}
