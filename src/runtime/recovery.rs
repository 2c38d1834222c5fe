//! Startup restore logic
//!
//! Decodes persisted values into in-memory state, falling back to defaults
//! for missing or corrupt keys, and applies the once-per-day visit rule.

use crate::db::{keys, ChatMessage, CompletedMission, Sender};
use crate::llm::{Credential, Emotion};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Everything the state manager keeps, as restored from storage
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub day_count: u32,
    /// Today, once the visit rule has run
    pub last_visit: NaiveDate,
    pub chat_history: Vec<ChatMessage>,
    pub mission_history: Vec<CompletedMission>,
    pub emotion: Emotion,
    pub chat_turn_count: u32,
    pub credential_override: Option<Credential>,
    pub ai_enabled: bool,
    /// The day counter moved forward during this restore
    pub day_advanced: bool,
    /// Keys that were present but could not be decoded
    pub problems: Vec<String>,
}

impl RestoredState {
    /// Fresh-install state
    pub fn defaults(today: NaiveDate) -> Self {
        Self {
            day_count: 1,
            last_visit: today,
            chat_history: Vec::new(),
            mission_history: Vec::new(),
            emotion: Emotion::default(),
            chat_turn_count: 0,
            credential_override: None,
            ai_enabled: true,
            day_advanced: false,
            problems: Vec::new(),
        }
    }
}

/// Outcome of the visit rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayAdvance {
    pub day_count: u32,
    pub advanced: bool,
}

/// Count a new calendar day at most once, no matter how many days were
/// skipped. A first run (no previous visit) never counts. A visit date in
/// the future (clock moved back) is restamped without counting.
pub fn advance_day(day_count: u32, last_visit: Option<NaiveDate>, today: NaiveDate) -> DayAdvance {
    match last_visit {
        Some(last) if today > last => DayAdvance {
            day_count: day_count.saturating_add(1),
            advanced: true,
        },
        _ => DayAdvance {
            day_count,
            advanced: false,
        },
    }
}

/// Decode raw key/value pairs and apply the visit rule
pub fn restore(values: Vec<(String, Option<String>)>, today: NaiveDate) -> RestoredState {
    let values: HashMap<String, String> = values
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();
    let mut state = RestoredState::defaults(today);
    let mut problems = Vec::new();

    if let Some(raw) = values.get(keys::DAY_COUNT) {
        match raw.trim().parse::<u32>() {
            Ok(n) if n >= 1 => state.day_count = n,
            _ => problems.push(format!("{}: '{raw}'", keys::DAY_COUNT)),
        }
    }

    let last_visit = values.get(keys::LAST_VISIT_DATE).and_then(|raw| {
        let parsed = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok();
        if parsed.is_none() {
            problems.push(format!("{}: '{raw}'", keys::LAST_VISIT_DATE));
        }
        parsed
    });

    if let Some(raw) = values.get(keys::CHAT_HISTORY) {
        match serde_json::from_str(raw) {
            Ok(history) => state.chat_history = history,
            Err(e) => problems.push(format!("{}: {e}", keys::CHAT_HISTORY)),
        }
    }

    if let Some(raw) = values.get(keys::MISSION_HISTORY) {
        match serde_json::from_str(raw) {
            Ok(history) => state.mission_history = history,
            Err(e) => problems.push(format!("{}: {e}", keys::MISSION_HISTORY)),
        }
    }

    if let Some(raw) = values.get(keys::EMOTIONAL_STATE) {
        match Emotion::parse(raw) {
            Some(emotion) => state.emotion = emotion,
            None => problems.push(format!("{}: '{raw}'", keys::EMOTIONAL_STATE)),
        }
    }

    // A missing or corrupt counter is rebuilt from the log
    let logged_turns = state
        .chat_history
        .iter()
        .filter(|m| m.sender == Sender::User)
        .count();
    state.chat_turn_count = u32::try_from(logged_turns).unwrap_or(u32::MAX);
    if let Some(raw) = values.get(keys::CHAT_TURN_COUNT) {
        match raw.trim().parse::<u32>() {
            Ok(n) => state.chat_turn_count = n,
            Err(_) => problems.push(format!("{}: '{raw}'", keys::CHAT_TURN_COUNT)),
        }
    }

    state.credential_override = values
        .get(keys::CREDENTIAL_OVERRIDE)
        .map(String::as_str)
        .and_then(Credential::new);

    if let Some(raw) = values.get(keys::AI_ENABLED) {
        match raw.trim() {
            "true" => state.ai_enabled = true,
            "false" => state.ai_enabled = false,
            _ => problems.push(format!("{}: '{raw}'", keys::AI_ENABLED)),
        }
    }

    let advance = advance_day(state.day_count, last_visit, today);
    state.day_count = advance.day_count;
    state.day_advanced = advance.advanced;
    state.last_visit = today;
    state.problems = problems;
    state
}
