//! Process configuration from environment variables

use crate::llm::{Credential, DEFAULT_TURN_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Credential baked in at build time, if any
const BUILD_API_KEY: Option<&str> = option_env!("KINDRED_API_KEY");

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    /// Default credential layer; an operator override in storage wins
    pub api_key: Option<Credential>,
    pub model: String,
    pub base_url: String,
    pub turn_timeout: Duration,
    pub persona_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unparseable values fall back to
    /// defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let db_path = var("KINDRED_DB_PATH").map_or_else(
            || {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".kindred").join("kindred.db")
            },
            PathBuf::from,
        );

        let port = parse_or(var("KINDRED_PORT"), "KINDRED_PORT", DEFAULT_PORT);

        let turn_timeout = var("KINDRED_LLM_TIMEOUT_SECS")
            .and_then(|raw| match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    tracing::warn!(value = %raw, "Ignoring invalid KINDRED_LLM_TIMEOUT_SECS");
                    None
                }
            })
            .unwrap_or(DEFAULT_TURN_TIMEOUT);

        let api_key = var("KINDRED_API_KEY")
            .as_deref()
            .and_then(Credential::new)
            .or_else(|| BUILD_API_KEY.and_then(Credential::new));

        Self {
            db_path,
            port,
            api_key,
            model: var("KINDRED_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: var("KINDRED_LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            turn_timeout,
            persona_path: var("KINDRED_PERSONA_PATH").map(PathBuf::from),
        }
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, name: &str, default: T) -> T {
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable value");
            default
        }),
        None => default,
    }
}
