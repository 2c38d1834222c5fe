//! The conversation state manager
//!
//! Holds all app state in memory, runs one turn at a time, and writes every
//! mutation through to the key-value store before reporting it done.

use super::recovery::{self, RestoredState};
use super::traits::{Clock, KeyValueStore};
use super::{AppSnapshot, CredentialOrigin, ResetScope, StateError, StateEvent, StorageHealth};
use crate::db::{keys, ChatMessage, CompletedMission};
use crate::llm::{
    BotReply, Credential, CredentialSource, Emotion, LlmErrorKind, ResponseGateway,
    ServiceHealth, LOCAL_REPLY,
};
use crate::state_machine::{transition, Effect, Event, ReplyMode, TransitionError, TurnState};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Every write is tried this many times before it is reported as failed
const PERSIST_ATTEMPTS: u32 = 2;

/// Probe turns per credential check; transient failures get one retry
const PROBE_ATTEMPTS: u32 = 2;

const PROBE_TEXT: &str = "hello";

const LOCAL_REPLY_DETAIL: &str = "AI replies are turned off, used the local reply";

/// What happened to a submitted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The turn ran to completion
    Replied {
        user: ChatMessage,
        reply: ChatMessage,
    },
    /// Nothing was recorded
    Rejected(TransitionError),
}

/// Result of checking a new credential against the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CredentialVerdict {
    /// The new credential is kept
    Accepted,
    /// The previous credential (or none) was restored
    Rejected { kind: LlmErrorKind, detail: String },
}

impl CredentialVerdict {
    #[allow(dead_code)] // Used in tests
    pub fn is_accepted(&self) -> bool {
        matches!(self, CredentialVerdict::Accepted)
    }
}

struct Inner {
    turn: TurnState,
    day_count: u32,
    last_visit: NaiveDate,
    chat_history: Vec<ChatMessage>,
    mission_history: Vec<CompletedMission>,
    emotion: Emotion,
    chat_turn_count: u32,
    credential_override: Option<Credential>,
    ai_enabled: bool,
    service_health: ServiceHealth,
    storage_health: StorageHealth,
    /// Highest message id handed out, across resets
    last_message_id: i64,
    last_timestamp: Option<DateTime<Utc>>,
    in_flight: Option<CancellationToken>,
}

impl Inner {
    fn new(today: NaiveDate) -> Self {
        Self {
            turn: TurnState::Loading,
            day_count: 1,
            last_visit: today,
            chat_history: Vec::new(),
            mission_history: Vec::new(),
            emotion: Emotion::default(),
            chat_turn_count: 0,
            credential_override: None,
            ai_enabled: true,
            service_health: ServiceHealth::default(),
            storage_health: StorageHealth::default(),
            last_message_id: 0,
            last_timestamp: None,
            in_flight: None,
        }
    }

    fn adopt(&mut self, restored: RestoredState) {
        self.last_message_id = restored
            .chat_history
            .iter()
            .map(|m| m.id)
            .max()
            .unwrap_or(0)
            .max(self.last_message_id);
        self.last_timestamp = restored.chat_history.last().map(|m| m.timestamp);

        self.day_count = restored.day_count;
        self.last_visit = restored.last_visit;
        self.chat_history = restored.chat_history;
        self.mission_history = restored.mission_history;
        self.emotion = restored.emotion;
        self.chat_turn_count = restored.chat_turn_count;
        self.credential_override = restored.credential_override;
        self.ai_enabled = restored.ai_enabled;
    }

    /// Id and timestamp for the next message. Ids strictly increase and
    /// timestamps never go backwards, even if the clock does.
    fn allocate_stamp(&mut self, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
        let candidate = now.timestamp_millis();
        let id = if candidate > self.last_message_id {
            candidate
        } else {
            self.last_message_id + 1
        };
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_message_id = id;
        self.last_timestamp = Some(timestamp);
        (id, timestamp)
    }

    /// Encode a key's current value; `None` means the key should be absent
    fn encode(&self, key: &str) -> Result<Option<String>, String> {
        let value = match key {
            keys::DAY_COUNT => Some(self.day_count.to_string()),
            keys::LAST_VISIT_DATE => Some(self.last_visit.format("%Y-%m-%d").to_string()),
            keys::CHAT_HISTORY => {
                Some(serde_json::to_string(&self.chat_history).map_err(|e| e.to_string())?)
            }
            keys::MISSION_HISTORY => {
                Some(serde_json::to_string(&self.mission_history).map_err(|e| e.to_string())?)
            }
            keys::EMOTIONAL_STATE => Some(self.emotion.as_str().to_string()),
            keys::CHAT_TURN_COUNT => Some(self.chat_turn_count.to_string()),
            keys::CREDENTIAL_OVERRIDE => self
                .credential_override
                .as_ref()
                .map(|c| c.expose().to_string()),
            keys::AI_ENABLED => Some(self.ai_enabled.to_string()),
            other => return Err(format!("unknown key: {other}")),
        };
        Ok(value)
    }

    fn require_ready(&self) -> Result<(), TransitionError> {
        if self.turn.is_ready() {
            Ok(())
        } else {
            Err(TransitionError::NotReady)
        }
    }

    fn require_idle(&self) -> Result<(), TransitionError> {
        self.require_ready()?;
        if self.turn.is_busy() {
            Err(TransitionError::TurnInFlight)
        } else {
            Ok(())
        }
    }
}

/// Single authority over persisted app state
pub struct StateManager<S: KeyValueStore> {
    store: S,
    gateway: Arc<ResponseGateway>,
    clock: Arc<dyn Clock>,
    /// Build-time credential, used when no override is set
    default_credential: Option<Credential>,
    inner: Mutex<Inner>,
    /// Serializes storage writes so the last write carries the latest state
    write_gate: tokio::sync::Mutex<()>,
    /// One credential check at a time
    credential_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    broadcast_tx: broadcast::Sender<StateEvent>,
}

impl<S: KeyValueStore> StateManager<S> {
    pub fn new(
        store: S,
        gateway: Arc<ResponseGateway>,
        clock: Arc<dyn Clock>,
        default_credential: Option<Credential>,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(128);
        let today = clock.today();
        Self {
            store,
            gateway,
            clock,
            default_credential,
            inner: Mutex::new(Inner::new(today)),
            write_gate: tokio::sync::Mutex::new(()),
            credential_gate: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            broadcast_tx,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StateEvent) {
        // No subscribers is fine
        let _ = self.broadcast_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.broadcast_tx.subscribe()
    }

    // ==================== Lifecycle ====================

    /// Load persisted state once at startup. Missing or corrupt values fall
    /// back to defaults; storage failures leave the app running in memory.
    pub async fn restore(&self) -> Result<(), StateError> {
        if self.inner().turn.is_ready() {
            return Err(TransitionError::AlreadyLoaded.into());
        }

        let today = self.clock.today();
        let values = match self.read_all().await {
            Ok(values) => values,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stored state, starting from defaults");
                self.record_storage_failure(&keys::ALL, &e);
                Vec::new()
            }
        };

        let restored = recovery::restore(values, today);
        for problem in &restored.problems {
            tracing::warn!(problem = %problem, "Ignoring unreadable stored value");
        }
        tracing::info!(
            day_count = restored.day_count,
            day_advanced = restored.day_advanced,
            messages = restored.chat_history.len(),
            missions = restored.mission_history.len(),
            "Restored state"
        );

        self.inner().adopt(restored);

        // The visit stamp is written whether or not the day advanced
        if let Err(e) = self
            .commit(&[keys::DAY_COUNT, keys::LAST_VISIT_DATE], &[])
            .await
        {
            tracing::error!(error = %e, "Visit stamp not persisted");
        }

        self.process_event(Event::Loaded, None).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(String, Option<String>)>, String> {
        let mut last_error = String::new();
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.store.multi_get(&keys::ALL).await {
                Ok(values) => return Ok(values),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Storage read failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Cancel the running turn, if any. The turn still completes with a
    /// fallback reply.
    pub fn cancel_in_flight(&self) -> bool {
        let inner = self.inner();
        match &inner.in_flight {
            Some(token) => {
                tracing::info!("Cancelling in-flight turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any running turn or probe and refuse to start remote calls
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancelled once [`shutdown`](Self::shutdown) is called
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ==================== Snapshot ====================

    pub fn snapshot(&self) -> AppSnapshot {
        let inner = self.inner();
        AppSnapshot {
            turn: inner.turn,
            day_count: inner.day_count,
            last_visit_date: inner.last_visit,
            chat_history: inner.chat_history.clone(),
            mission_history: inner.mission_history.clone(),
            chat_turn_count: inner.chat_turn_count,
            current_emotional_state: inner.emotion,
            ai_feature_enabled: inner.ai_enabled,
            service_health: inner.service_health.clone(),
            storage_health: inner.storage_health.clone(),
            credential: self.credential_origin(&inner),
            model: self.gateway.model_id().to_string(),
        }
    }

    fn credential_origin(&self, inner: &Inner) -> CredentialOrigin {
        if inner.credential_override.is_some() {
            CredentialOrigin::Override
        } else if self.default_credential.is_some() {
            CredentialOrigin::Default
        } else {
            CredentialOrigin::Absent
        }
    }

    fn resolve_credential(&self) -> Option<Credential> {
        let override_token = self.inner().credential_override.clone();
        CredentialSource::new(override_token, self.default_credential.clone())
            .resolve()
            .cloned()
    }

    // ==================== Turns ====================

    /// Run one full turn. Rejected without side effects while loading or
    /// while another turn is in flight; otherwise always ends with a reply.
    pub async fn submit_user_message(&self, text: &str) -> SubmitOutcome {
        let (message, mode) = {
            let mut inner = self.inner();
            let (id, timestamp) = inner.allocate_stamp(self.clock.now());
            (
                ChatMessage::user(id, text, timestamp),
                ReplyMode::for_ai_enabled(inner.ai_enabled),
            )
        };
        let cancel = self.shutdown.child_token();

        let result = self
            .process_event(Event::UserMessage { message, mode }, Some(&cancel))
            .await;

        let appended = match result {
            Ok(appended) => appended,
            Err(e) => {
                tracing::info!(error = %e, "User message rejected");
                return SubmitOutcome::Rejected(e);
            }
        };

        let mut appended = appended.into_iter();
        match (appended.next(), appended.next()) {
            (Some(user), Some(reply)) => SubmitOutcome::Replied { user, reply },
            _ => SubmitOutcome::Rejected(TransitionError::InvalidTransition(
                "turn ended without a reply".to_string(),
            )),
        }
    }

    /// Transition, execute effects, repeat for generated events. Returns the
    /// messages appended along the way.
    async fn process_event(
        &self,
        event: Event,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ChatMessage>, TransitionError> {
        let mut appended = Vec::new();
        let mut events_to_process = vec![event];
        let mut first = true;

        while let Some(current_event) = events_to_process.pop() {
            let effects = {
                let mut inner = self.inner();
                let result = match transition(&inner.turn, current_event) {
                    Ok(result) => result,
                    Err(e) if first => return Err(e),
                    Err(e) => {
                        // Our own turn broke mid-way; don't block every later turn
                        tracing::error!(error = %e, "Turn did not complete, returning to idle");
                        inner.turn = TurnState::Idle;
                        inner.in_flight = None;
                        self.emit(StateEvent::TurnChanged {
                            turn: TurnState::Idle,
                        });
                        return Err(e);
                    }
                };
                first = false;
                if inner.turn != result.new_state {
                    tracing::debug!(
                        from = inner.turn.display_name(),
                        to = result.new_state.display_name(),
                        "Turn state changed"
                    );
                }
                inner.turn = result.new_state;
                inner.in_flight = if matches!(inner.turn, TurnState::AwaitingReply { .. }) {
                    cancel.cloned()
                } else {
                    None
                };
                result.effects
            };

            for effect in effects {
                if let Some(generated) = self.execute_effect(effect, cancel, &mut appended).await {
                    events_to_process.push(generated);
                }
            }
        }

        Ok(appended)
    }

    async fn execute_effect(
        &self,
        effect: Effect,
        cancel: Option<&CancellationToken>,
        appended: &mut Vec<ChatMessage>,
    ) -> Option<Event> {
        match effect {
            Effect::AppendMessage { message } => {
                self.inner().chat_history.push(message.clone());
                appended.push(message);
                None
            }

            Effect::IncrementChatCount => {
                let mut inner = self.inner();
                inner.chat_turn_count = inner.chat_turn_count.saturating_add(1);
                None
            }

            Effect::SetEmotion { emotion } => {
                self.inner().emotion = emotion;
                self.emit(StateEvent::Emotion { emotion });
                None
            }

            Effect::PersistConversation => {
                // Failures are recorded in storage health; the turn goes on
                let _ = self.commit(&keys::CONVERSATION, &[]).await;
                None
            }

            Effect::PersistEmotion => {
                let _ = self.commit(&[keys::EMOTIONAL_STATE], &[]).await;
                None
            }

            Effect::RequestReply { text } => {
                let credential = self.resolve_credential();
                let fallback_token = CancellationToken::new();
                let cancel = cancel.unwrap_or(&fallback_token);
                let conversed = self
                    .gateway
                    .converse(&text, credential.as_ref(), cancel)
                    .await;
                self.record_service_health(conversed.health);
                Some(Event::ReplyReceived {
                    message: self.stamp_reply(conversed.reply),
                })
            }

            Effect::LocalReply => {
                self.record_service_health(ServiceHealth::idle(LOCAL_REPLY_DETAIL));
                Some(Event::ReplyReceived {
                    message: self.stamp_reply(BotReply::new(LOCAL_REPLY, Emotion::Neutral)),
                })
            }

            Effect::FinishTurn => Some(Event::TurnPersisted),

            Effect::NotifyTurnChanged => {
                let turn = self.inner().turn;
                self.emit(StateEvent::TurnChanged { turn });
                None
            }

            Effect::NotifyMessage { message } => {
                self.emit(StateEvent::Message { message });
                None
            }
        }
    }

    fn stamp_reply(&self, reply: BotReply) -> ChatMessage {
        let (id, timestamp) = self.inner().allocate_stamp(self.clock.now());
        ChatMessage::bot(id, reply.text, reply.emotion, timestamp)
    }

    fn record_service_health(&self, health: ServiceHealth) {
        self.inner().service_health = health.clone();
        self.emit(StateEvent::Health { health });
    }

    // ==================== Missions and settings ====================

    /// Record a completed mission. No catalog lookup: the label is kept as
    /// given, and repeated calls create independent entries.
    pub async fn complete_mission(
        &self,
        mission_label: &str,
        photo_ref: Option<String>,
    ) -> Result<CompletedMission, StateError> {
        let mission = {
            let mut inner = self.inner();
            inner.require_ready()?;
            let mission = CompletedMission {
                id: uuid::Uuid::new_v4().to_string(),
                mission_label: mission_label.to_string(),
                date: self.clock.today(),
                photo_ref,
            };
            inner.mission_history.insert(0, mission.clone());
            mission
        };
        tracing::info!(mission_id = %mission.id, label = %mission.mission_label, "Mission completed");
        self.emit(StateEvent::Mission {
            mission: mission.clone(),
        });

        self.commit(&[keys::MISSION_HISTORY], &[]).await?;
        Ok(mission)
    }

    /// Operator override, bypasses the gateway
    pub async fn set_emotional_state(&self, emotion: Emotion) -> Result<(), StateError> {
        {
            let mut inner = self.inner();
            inner.require_ready()?;
            inner.emotion = emotion;
        }
        tracing::info!(emotion = %emotion, "Emotional state set by operator");
        self.emit(StateEvent::Emotion { emotion });
        self.commit(&[keys::EMOTIONAL_STATE], &[]).await
    }

    /// Applies from the next turn on
    pub async fn set_ai_feature_enabled(&self, enabled: bool) -> Result<(), StateError> {
        {
            let mut inner = self.inner();
            inner.require_ready()?;
            inner.ai_enabled = enabled;
        }
        tracing::info!(enabled, "AI replies toggled");
        self.emit_settings();
        self.commit(&[keys::AI_ENABLED], &[]).await
    }

    fn emit_settings(&self) {
        let (ai_feature_enabled, credential) = {
            let inner = self.inner();
            (inner.ai_enabled, self.credential_origin(&inner))
        };
        self.emit(StateEvent::Settings {
            ai_feature_enabled,
            credential,
        });
    }

    // ==================== Credential ====================

    /// Store a new override credential and probe the service with it.
    ///
    /// Configuration and auth failures restore the previous override (or
    /// none). Transient failures are retried once before rolling back. A
    /// reply that arrives but does not decode still proves the credential.
    ///
    /// Refused while a turn is in flight. A turn started during the check
    /// already uses the candidate.
    pub async fn update_credential(&self, token: &str) -> Result<CredentialVerdict, StateError> {
        self.inner().require_idle()?;

        let Some(candidate) = Credential::new(token) else {
            return Ok(CredentialVerdict::Rejected {
                kind: LlmErrorKind::NotConfigured,
                detail: "credential is blank".to_string(),
            });
        };

        let _gate = self.credential_gate.lock().await;

        let previous = self
            .inner()
            .credential_override
            .replace(candidate.clone());
        if let Err(e) = self.commit(&[keys::CREDENTIAL_OVERRIDE], &[]).await {
            tracing::warn!(error = %e, "Candidate credential not persisted, probing anyway");
        }

        let verdict = self.probe(&candidate).await;

        match &verdict {
            CredentialVerdict::Accepted => {
                tracing::info!("New credential accepted");
            }
            CredentialVerdict::Rejected { kind, detail } => {
                tracing::warn!(kind = kind.as_str(), detail = %detail, "New credential rejected, rolling back");
                self.inner().credential_override = previous;
            }
        }
        self.emit_settings();

        self.commit(&[keys::CREDENTIAL_OVERRIDE], &[]).await?;
        Ok(verdict)
    }

    async fn probe(&self, candidate: &Credential) -> CredentialVerdict {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cancel = self.shutdown.child_token();
            let conversed = self
                .gateway
                .converse(PROBE_TEXT, Some(candidate), &cancel)
                .await;
            let health = conversed.health;
            self.record_service_health(health.clone());

            match health.kind {
                None | Some(LlmErrorKind::Malformed) => return CredentialVerdict::Accepted,
                Some(kind) if kind.is_transient() && attempt < PROBE_ATTEMPTS => {
                    tracing::info!(kind = kind.as_str(), attempt, "Credential probe inconclusive, retrying");
                }
                Some(kind) => {
                    return CredentialVerdict::Rejected {
                        kind,
                        detail: health.detail.unwrap_or_default(),
                    };
                }
            }
        }
    }

    // ==================== Resets ====================

    /// Clear the chat log and chat counter. Missions, day count, emotional
    /// state and settings survive.
    pub async fn soft_reset(&self) -> Result<(), StateError> {
        {
            let mut inner = self.inner();
            inner.require_idle()?;
            inner.chat_history.clear();
            inner.chat_turn_count = 0;
        }
        tracing::info!("Soft reset");
        self.emit(StateEvent::Reset {
            scope: ResetScope::Soft,
        });
        self.commit(&[], &keys::CONVERSATION).await
    }

    /// Clear every persisted key and start over as a first run, stamped
    /// with today's date so the day counter does not advance on next load
    pub async fn hard_reset(&self) -> Result<(), StateError> {
        // A running credential check would restore its rollback value afterwards
        let _credential = self.credential_gate.lock().await;
        {
            let mut inner = self.inner();
            inner.require_idle()?;
            let today = self.clock.today();
            inner.adopt(RestoredState::defaults(today));
            inner.service_health = ServiceHealth::default();
        }
        tracing::info!("Hard reset");
        self.emit(StateEvent::Reset {
            scope: ResetScope::Hard,
        });
        self.commit(&[keys::DAY_COUNT, keys::LAST_VISIT_DATE], &keys::ALL)
            .await
    }

    // ==================== Persistence ====================

    /// Remove `removes`, then write the current values of `sets`. Retried
    /// once; on final failure the in-memory state stands and storage health
    /// records the keys that are now memory-only.
    async fn commit(
        &self,
        sets: &[&'static str],
        removes: &[&'static str],
    ) -> Result<(), StateError> {
        let _gate = self.write_gate.lock().await;

        let mut pairs: Vec<(&str, String)> = Vec::with_capacity(sets.len());
        let mut removals: Vec<&str> = removes.to_vec();
        let encoded = {
            let inner = self.inner();
            sets.iter()
                .map(|key| inner.encode(key).map(|value| (*key, value)))
                .collect::<Result<Vec<_>, String>>()
        };
        let touched: Vec<&'static str> = sets.iter().chain(removes).copied().collect();

        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_storage_failure(&touched, &e);
                return Err(StateError::Persistence {
                    keys: touched.join(", "),
                    message: e,
                });
            }
        };
        for (key, value) in encoded {
            match value {
                Some(value) => pairs.push((key, value)),
                None => removals.push(key),
            }
        }
        // A key being written must not also be removed
        removals.retain(|key| !pairs.iter().any(|(k, _)| k == key));

        let mut last_error = String::new();
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.write(&pairs, &removals).await {
                Ok(()) => {
                    self.record_storage_success(&touched);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, keys = ?touched, error = %e, "Storage write failed");
                    last_error = e;
                }
            }
        }

        tracing::error!(keys = ?touched, error = %last_error, "Storage write abandoned, keeping change in memory");
        self.record_storage_failure(&touched, &last_error);
        Err(StateError::Persistence {
            keys: touched.join(", "),
            message: last_error,
        })
    }

    async fn write(&self, pairs: &[(&str, String)], removals: &[&str]) -> Result<(), String> {
        if !removals.is_empty() {
            self.store.multi_remove(removals).await?;
        }
        if !pairs.is_empty() {
            self.store.multi_set(pairs).await?;
        }
        Ok(())
    }

    fn record_storage_success(&self, keys: &[&str]) {
        let changed = {
            let mut inner = self.inner();
            let health = &mut inner.storage_health;
            let before = health.failing_keys.len();
            for key in keys {
                health.failing_keys.remove(*key);
            }
            if health.failing_keys.len() == before {
                None
            } else {
                health.ok = health.failing_keys.is_empty();
                if health.ok {
                    health.last_error = None;
                }
                Some(health.clone())
            }
        };
        if let Some(health) = changed {
            tracing::info!(recovered = ?keys, "Storage caught up");
            self.emit(StateEvent::Storage { health });
        }
    }

    fn record_storage_failure(&self, keys: &[&str], error: &str) {
        let health = {
            let mut inner = self.inner();
            let health = &mut inner.storage_health;
            health
                .failing_keys
                .extend(keys.iter().map(|k| (*k).to_string()));
            health.ok = false;
            health.last_error = Some(error.to_string());
            health.clone()
        };
        self.emit(StateEvent::Storage { health });
    }
}
