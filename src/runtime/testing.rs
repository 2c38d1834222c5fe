//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmService};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Mock LLM Service
// ============================================================================

/// Mock LLM service that returns queued responses
#[allow(dead_code)]
pub struct MockLlmService {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made, with the key each one carried
    pub requests: Mutex<Vec<(LlmRequest, String)>>,
}

#[allow(dead_code)]
impl MockLlmService {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: "mock-model".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self, response: Result<LlmResponse, LlmError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Queue a successful response with this generated text
    pub fn queue_text(&self, text: &str) {
        self.queue(Ok(LlmResponse::text(text)));
    }

    /// Queue a well-formed reply object
    pub fn queue_reply(&self, text: &str, emotion: &str) {
        let body = serde_json::json!({ "response": text, "emotion": emotion });
        self.queue_text(&body.to_string());
    }

    pub fn queue_error(&self, error: LlmError) {
        self.queue(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<(LlmRequest, String)> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn next(&self, request: &LlmRequest, api_key: &str) -> Result<LlmResponse, LlmError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), api_key.to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(&self, request: &LlmRequest, api_key: &str) -> Result<LlmResponse, LlmError> {
        self.next(request, api_key)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Mock LLM service with configurable delay (for testing cancellation and
/// single-flight behavior)
pub struct DelayedMockLlmService {
    inner: MockLlmService,
    delay: Duration,
    /// Notified when request starts (for test synchronization)
    pub request_started: Arc<Notify>,
}

#[allow(dead_code)]
impl DelayedMockLlmService {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MockLlmService::new(),
            delay,
            request_started: Arc::new(Notify::new()),
        }
    }

    pub fn queue_reply(&self, text: &str, emotion: &str) {
        self.inner.queue_reply(text, emotion);
    }

    pub fn call_count(&self) -> usize {
        self.inner.call_count()
    }

    pub fn inner_last_call(&self) -> Option<(LlmRequest, String)> {
        self.inner.last_call()
    }
}

#[async_trait]
impl LlmService for DelayedMockLlmService {
    async fn complete(&self, request: &LlmRequest, api_key: &str) -> Result<LlmResponse, LlmError> {
        self.request_started.notify_waiters();
        tokio::time::sleep(self.delay).await;
        self.inner.next(request, api_key)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-memory key-value store with failure injection
#[derive(Default)]
pub struct InMemoryStore {
    values: Mutex<HashMap<String, String>>,
    /// Number of upcoming writes that fail
    failing_writes: AtomicU32,
    /// Every write fails while set
    broken: AtomicBool,
    /// Reads fail while set
    broken_reads: AtomicBool,
    /// Every write takes this long
    write_delay: Mutex<Duration>,
    pub write_count: AtomicU32,
}

#[allow(dead_code)]
impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: &[(&str, &str)]) -> Self {
        let store = Self::new();
        for (key, value) in values {
            store.set_raw(key, value);
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn set_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn set_broken_reads(&self, broken: bool) {
        self.broken_reads.store(broken, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    async fn slow_down(&self) {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_write(&self) -> Result<(), String> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err("disk full".to_string());
        }
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err("transient write failure".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, String> {
        if self.broken_reads.load(Ordering::SeqCst) {
            return Err("storage unavailable".to_string());
        }
        let values = self.values.lock().unwrap();
        Ok(keys
            .iter()
            .map(|k| ((*k).to_string(), values.get(*k).cloned()))
            .collect())
    }

    async fn multi_set(&self, pairs: &[(&str, String)]) -> Result<(), String> {
        self.slow_down().await;
        self.check_write()?;
        let mut values = self.values.lock().unwrap();
        for (key, value) in pairs {
            values.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[&str]) -> Result<(), String> {
        self.slow_down().await;
        self.check_write()?;
        let mut values = self.values.lock().unwrap();
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }
}

// ============================================================================
// Fixed Clock
// ============================================================================

/// Clock that only moves when told to
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

#[allow(dead_code)]
impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Noon UTC on the given date
    pub fn on(year: i32, month: u32, day: u32) -> Self {
        Self::at(Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// State manager tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{keys, ChatMessage, Sender};
    use crate::llm::{
        Credential, Emotion, HealthStatus, LlmErrorKind, ResponseGateway, LOCAL_REPLY,
        NOT_CONFIGURED_REPLY,
    };
    use crate::runtime::{
        CredentialOrigin, CredentialVerdict, StateError, StateEvent, StateManager, SubmitOutcome,
    };
    use crate::state_machine::{TransitionError, TurnState};
    use crate::system_prompt::Persona;
    use chrono::NaiveDate;

    type TestManager = StateManager<Arc<InMemoryStore>>;

    struct Harness {
        manager: Arc<TestManager>,
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
    }

    fn harness_with(
        store: Arc<InMemoryStore>,
        service: Arc<dyn LlmService>,
        clock: Arc<FixedClock>,
        default_key: Option<&str>,
    ) -> Harness {
        let gateway = Arc::new(ResponseGateway::new(service, Persona::builtin()));
        let manager = Arc::new(StateManager::new(
            store.clone(),
            gateway,
            clock.clone(),
            default_key.and_then(Credential::new),
        ));
        Harness {
            manager,
            store,
            clock,
        }
    }

    async fn loaded(service: Arc<dyn LlmService>) -> Harness {
        let h = harness_with(
            Arc::new(InMemoryStore::new()),
            service,
            Arc::new(FixedClock::on(2024, 1, 3)),
            Some("build-key"),
        );
        h.manager.restore().await.unwrap();
        h
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stored_history(store: &InMemoryStore) -> Vec<ChatMessage> {
        store
            .get(keys::CHAT_HISTORY)
            .map(|raw| serde_json::from_str(&raw).unwrap())
            .unwrap_or_default()
    }

    // ==================== Load ====================

    #[tokio::test]
    async fn test_first_run_stamps_today() {
        let h = loaded(Arc::new(MockLlmService::new())).await;
        let snap = h.manager.snapshot();
        assert_eq!(snap.turn, TurnState::Idle);
        assert_eq!(snap.day_count, 1);
        assert_eq!(h.store.get(keys::DAY_COUNT).as_deref(), Some("1"));
        assert_eq!(
            h.store.get(keys::LAST_VISIT_DATE).as_deref(),
            Some("2024-01-03")
        );
    }

    #[tokio::test]
    async fn test_day_advances_once_for_skipped_days() {
        let store = Arc::new(InMemoryStore::with_values(&[
            (keys::DAY_COUNT, "1"),
            (keys::LAST_VISIT_DATE, "2024-01-01"),
        ]));
        let h = harness_with(
            store,
            Arc::new(MockLlmService::new()),
            Arc::new(FixedClock::on(2024, 1, 3)),
            None,
        );
        h.manager.restore().await.unwrap();

        assert_eq!(h.manager.snapshot().day_count, 2);
        assert_eq!(h.store.get(keys::DAY_COUNT).as_deref(), Some("2"));
        assert_eq!(
            h.store.get(keys::LAST_VISIT_DATE).as_deref(),
            Some("2024-01-03")
        );

        // Restarting the same day does not count again
        let again = harness_with(
            h.store.clone(),
            Arc::new(MockLlmService::new()),
            h.clock.clone(),
            None,
        );
        again.manager.restore().await.unwrap();
        assert_eq!(again.manager.snapshot().day_count, 2);
    }

    #[tokio::test]
    async fn test_restore_twice_is_rejected() {
        let h = loaded(Arc::new(MockLlmService::new())).await;
        let err = h.manager.restore().await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Transition(TransitionError::AlreadyLoaded)
        ));
    }

    #[tokio::test]
    async fn test_unreadable_storage_starts_from_defaults() {
        let store = Arc::new(InMemoryStore::with_values(&[(keys::DAY_COUNT, "9")]));
        store.set_broken_reads(true);
        let h = harness_with(
            store,
            Arc::new(MockLlmService::new()),
            Arc::new(FixedClock::on(2024, 1, 3)),
            None,
        );
        h.manager.restore().await.unwrap();

        let snap = h.manager.snapshot();
        assert_eq!(snap.day_count, 1);
        assert_eq!(snap.turn, TurnState::Idle);
        assert!(!snap.storage_health.ok);
    }

    #[tokio::test]
    async fn test_submit_before_load_is_rejected() {
        let h = harness_with(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockLlmService::new()),
            Arc::new(FixedClock::on(2024, 1, 3)),
            Some("k"),
        );
        let outcome = h.manager.submit_user_message("hi").await;
        assert_eq!(outcome, SubmitOutcome::Rejected(TransitionError::NotReady));
        assert!(h.manager.snapshot().chat_history.is_empty());
        assert!(h
            .manager
            .complete_mission("walk", None)
            .await
            .is_err());
    }

    // ==================== Turns ====================

    #[tokio::test]
    async fn test_turn_appends_and_persists_both_messages() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("Good to see you.", "relaxed");
        let h = loaded(mock.clone()).await;

        let outcome = h.manager.submit_user_message("hello").await;
        let SubmitOutcome::Replied { user, reply } = outcome else {
            panic!("expected a reply, got {outcome:?}");
        };
        assert_eq!(user.sender, Sender::User);
        assert_eq!(reply.text, "Good to see you.");
        assert_eq!(reply.emotional_state, Some(Emotion::Relaxed));

        let snap = h.manager.snapshot();
        assert_eq!(snap.chat_history, vec![user, reply]);
        assert_eq!(snap.chat_turn_count, 1);
        assert_eq!(snap.current_emotional_state, Emotion::Relaxed);
        assert_eq!(snap.service_health.status, HealthStatus::Ok);
        assert_eq!(snap.turn, TurnState::Idle);

        assert_eq!(stored_history(&h.store), snap.chat_history);
        assert_eq!(h.store.get(keys::CHAT_TURN_COUNT).as_deref(), Some("1"));
        assert_eq!(h.store.get(keys::EMOTIONAL_STATE).as_deref(), Some("relaxed"));

        let (_, api_key) = mock.last_call().unwrap();
        assert_eq!(api_key, "build-key");
    }

    #[tokio::test]
    async fn test_n_turns_give_2n_ordered_messages() {
        let mock = Arc::new(MockLlmService::new());
        for _ in 0..4 {
            mock.queue_reply("ok", "neutral");
        }
        let h = loaded(mock).await;

        for i in 0..4 {
            // Frozen clock: ids still strictly increase
            let outcome = h.manager.submit_user_message(&format!("msg {i}")).await;
            assert!(matches!(outcome, SubmitOutcome::Replied { .. }));
        }

        let snap = h.manager.snapshot();
        assert_eq!(snap.chat_history.len(), 8);
        assert_eq!(snap.chat_turn_count, 4);
        for (i, msg) in snap.chat_history.iter().enumerate() {
            let expected = if i % 2 == 0 { Sender::User } else { Sender::Bot };
            assert_eq!(msg.sender, expected);
        }
        for pair in snap.chat_history.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert_eq!(snap.chat_history[4].text, "msg 2");
    }

    #[tokio::test]
    async fn test_clock_going_back_keeps_order() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("a", "shy");
        mock.queue_reply("b", "shy");
        let h = loaded(mock).await;

        h.manager.submit_user_message("first").await;
        h.clock.advance(ChronoDuration::hours(-2));
        h.manager.submit_user_message("second").await;

        let history = h.manager.snapshot().chat_history;
        for pair in history.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let mock = Arc::new(DelayedMockLlmService::new(Duration::from_millis(50)));
        mock.queue_reply("first reply", "shy");
        let h = loaded(mock.clone()).await;

        let started = mock.request_started.clone();
        let notified = started.notified();
        let manager = h.manager.clone();
        let first = tokio::spawn(async move { manager.submit_user_message("one").await });
        notified.await;

        assert!(h.manager.snapshot().turn.is_busy());
        for text in ["two", "three"] {
            let outcome = h.manager.submit_user_message(text).await;
            assert_eq!(outcome, SubmitOutcome::Rejected(TransitionError::TurnInFlight));
        }
        // Busy turns also block resets
        assert!(h.manager.soft_reset().await.is_err());

        let outcome = first.await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Replied { .. }));

        let snap = h.manager.snapshot();
        assert_eq!(snap.chat_history.len(), 2);
        assert_eq!(snap.chat_turn_count, 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_stays_busy_until_reply_is_stored() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("first", "shy");
        mock.queue_reply("second", "relaxed");
        let h = loaded(mock).await;
        h.store.set_write_delay(Duration::from_millis(100));
        let mut rx = h.manager.subscribe();

        let manager = h.manager.clone();
        let first = tokio::spawn(async move { manager.submit_user_message("one").await });

        // Wait until the reply is in memory
        while h.manager.snapshot().chat_history.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stored_history(&h.store).len() < 2);
        assert!(matches!(
            h.manager.snapshot().turn,
            TurnState::Persisting { .. }
        ));
        assert!(!h.manager.cancel_in_flight());
        assert_eq!(
            h.manager.submit_user_message("two").await,
            SubmitOutcome::Rejected(TransitionError::TurnInFlight)
        );

        assert!(matches!(
            first.await.unwrap(),
            SubmitOutcome::Replied { .. }
        ));
        assert_eq!(h.manager.snapshot().turn, TurnState::Idle);
        assert_eq!(stored_history(&h.store).len(), 2);
        assert_eq!(h.store.get(keys::EMOTIONAL_STATE).as_deref(), Some("shy"));

        // Idle is announced only after the writes
        let mut turns = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StateEvent::TurnChanged { turn } = event {
                turns.push(turn);
            }
        }
        assert_eq!(turns.last(), Some(&TurnState::Idle));
        assert!(!turns
            .iter()
            .any(|turn| matches!(turn, TurnState::Persisting { .. })));

        let outcome = h.manager.submit_user_message("three").await;
        assert!(matches!(outcome, SubmitOutcome::Replied { .. }));
        assert_eq!(stored_history(&h.store).len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_still_replies() {
        let mock = Arc::new(DelayedMockLlmService::new(Duration::from_secs(3600)));
        let h = loaded(mock.clone()).await;
        assert!(!h.manager.cancel_in_flight());

        let notified = mock.request_started.notified();
        let manager = h.manager.clone();
        let turn = tokio::spawn(async move { manager.submit_user_message("hi").await });
        notified.await;

        assert!(h.manager.cancel_in_flight());
        let outcome = turn.await.unwrap();
        let SubmitOutcome::Replied { reply, .. } = outcome else {
            panic!("cancelled turn must still reply");
        };
        assert!(!reply.text.is_empty());

        let snap = h.manager.snapshot();
        assert_eq!(snap.turn, TurnState::Idle);
        assert_eq!(snap.service_health.kind, Some(LlmErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_ai_disabled_uses_local_reply() {
        let mock = Arc::new(MockLlmService::new());
        let h = loaded(mock.clone()).await;
        h.manager.set_ai_feature_enabled(false).await.unwrap();
        assert_eq!(h.store.get(keys::AI_ENABLED).as_deref(), Some("false"));

        let outcome = h.manager.submit_user_message("hi").await;
        let SubmitOutcome::Replied { reply, .. } = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.text, LOCAL_REPLY);
        assert_eq!(mock.call_count(), 0);

        let health = h.manager.snapshot().service_health;
        assert_eq!(health.status, HealthStatus::Idle);
        assert!(health.detail.is_some());
    }

    #[tokio::test]
    async fn test_no_credential_replies_not_configured() {
        let mock = Arc::new(MockLlmService::new());
        let h = harness_with(
            Arc::new(InMemoryStore::new()),
            mock.clone(),
            Arc::new(FixedClock::on(2024, 1, 3)),
            None,
        );
        h.manager.restore().await.unwrap();
        assert_eq!(h.manager.snapshot().credential, CredentialOrigin::Absent);

        let outcome = h.manager.submit_user_message("hi").await;
        let SubmitOutcome::Replied { reply, .. } = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.text, NOT_CONFIGURED_REPLY);
        assert_eq!(reply.emotional_state, Some(Emotion::Neutral));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(
            h.manager.snapshot().service_health.kind,
            Some(LlmErrorKind::NotConfigured)
        );
    }

    #[tokio::test]
    async fn test_overload_reports_degraded() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_error(LlmError::from_status(503, "overloaded"));
        let h = loaded(mock).await;

        h.manager.submit_user_message("hi").await;
        let snap = h.manager.snapshot();
        assert_eq!(snap.service_health.status, HealthStatus::Degraded);
        assert_eq!(snap.chat_history.len(), 2);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("hey", "hesitant");
        let h = loaded(mock).await;
        let mut rx = h.manager.subscribe();

        h.manager.submit_user_message("hi").await;

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.iter().filter(|n| **n == "message").count(), 2);
        assert!(names.contains(&"turn_changed"));
        assert!(names.contains(&"emotion"));
        assert!(names.contains(&"health"));
    }

    // ==================== Credential ====================

    #[tokio::test]
    async fn test_rejected_credential_restores_previous() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_error(LlmError::from_status(400, "API key not valid"));
        let store = Arc::new(InMemoryStore::with_values(&[(
            keys::CREDENTIAL_OVERRIDE,
            "key-a",
        )]));
        let h = harness_with(store, mock, Arc::new(FixedClock::on(2024, 1, 3)), None);
        h.manager.restore().await.unwrap();

        let verdict = h.manager.update_credential("key-b").await.unwrap();
        assert!(!verdict.is_accepted());
        assert!(matches!(
            verdict,
            CredentialVerdict::Rejected {
                kind: LlmErrorKind::Auth,
                ..
            }
        ));
        assert_eq!(
            h.store.get(keys::CREDENTIAL_OVERRIDE).as_deref(),
            Some("key-a")
        );
    }

    #[tokio::test]
    async fn test_rejected_credential_without_previous_is_absent() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_error(LlmError::from_status(403, "forbidden"));
        let h = loaded(mock).await;

        let verdict = h.manager.update_credential("key-b").await.unwrap();
        assert!(!verdict.is_accepted());
        assert_eq!(h.store.get(keys::CREDENTIAL_OVERRIDE), None);
        assert_eq!(h.manager.snapshot().credential, CredentialOrigin::Default);
    }

    #[tokio::test]
    async fn test_accepted_credential_is_used_for_turns() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("hello!", "shy");
        mock.queue_reply("again", "relaxed");
        let h = loaded(mock.clone()).await;

        let verdict = h.manager.update_credential("  new-key  ").await.unwrap();
        assert_eq!(verdict, CredentialVerdict::Accepted);
        assert_eq!(
            h.store.get(keys::CREDENTIAL_OVERRIDE).as_deref(),
            Some("new-key")
        );
        let (probe, _) = mock.last_call().unwrap();
        assert_eq!(probe.messages.last().unwrap().text, "hello");

        h.manager.submit_user_message("hi").await;
        let (_, api_key) = mock.last_call().unwrap();
        assert_eq!(api_key, "new-key");
        assert_eq!(h.manager.snapshot().credential, CredentialOrigin::Override);
    }

    #[tokio::test]
    async fn test_malformed_probe_reply_accepts() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_text("definitely not json");
        let h = loaded(mock).await;

        let verdict = h.manager.update_credential("new-key").await.unwrap();
        assert!(verdict.is_accepted());
    }

    #[tokio::test]
    async fn test_transient_probe_failure_is_retried_once() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_error(LlmError::from_status(503, "busy"));
        mock.queue_reply("hi", "neutral");
        let h = loaded(mock.clone()).await;

        let verdict = h.manager.update_credential("new-key").await.unwrap();
        assert!(verdict.is_accepted());
        assert_eq!(mock.call_count(), 2);

        mock.queue_error(LlmError::network("down"));
        mock.queue_error(LlmError::network("still down"));
        let verdict = h.manager.update_credential("other-key").await.unwrap();
        assert!(matches!(
            verdict,
            CredentialVerdict::Rejected {
                kind: LlmErrorKind::Network,
                ..
            }
        ));
        // Rolled back to the previously accepted override
        assert_eq!(
            h.store.get(keys::CREDENTIAL_OVERRIDE).as_deref(),
            Some("new-key")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_reset_waits_for_credential_check() {
        // No queued replies: every probe fails with a transient error
        let mock = Arc::new(DelayedMockLlmService::new(Duration::from_millis(50)));
        let store = Arc::new(InMemoryStore::with_values(&[(
            keys::CREDENTIAL_OVERRIDE,
            "key-a",
        )]));
        let h = harness_with(store, mock.clone(), Arc::new(FixedClock::on(2024, 1, 3)), None);
        h.manager.restore().await.unwrap();

        let notified = mock.request_started.notified();
        let manager = h.manager.clone();
        let check = tokio::spawn(async move { manager.update_credential("key-b").await });
        notified.await;

        h.manager.hard_reset().await.unwrap();
        let verdict = check.await.unwrap().unwrap();
        assert!(!verdict.is_accepted());

        assert_eq!(h.store.get(keys::CREDENTIAL_OVERRIDE), None);
        assert_eq!(h.manager.snapshot().credential, CredentialOrigin::Absent);
        assert_eq!(
            h.store.keys(),
            vec![keys::DAY_COUNT.to_string(), keys::LAST_VISIT_DATE.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_change_refused_during_turn() {
        let mock = Arc::new(DelayedMockLlmService::new(Duration::from_millis(50)));
        mock.queue_reply("hi", "shy");
        let h = loaded(mock.clone()).await;

        let notified = mock.request_started.notified();
        let manager = h.manager.clone();
        let turn = tokio::spawn(async move { manager.submit_user_message("hello").await });
        notified.await;

        let err = h.manager.update_credential("key-b").await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Transition(TransitionError::TurnInFlight)
        ));
        assert_eq!(h.store.get(keys::CREDENTIAL_OVERRIDE), None);

        turn.await.unwrap();
        let (_, api_key) = mock.inner_last_call().unwrap();
        assert_eq!(api_key, "build-key");
    }

    #[tokio::test]
    async fn test_blank_credential_never_probes() {
        let mock = Arc::new(MockLlmService::new());
        let h = loaded(mock.clone()).await;
        let writes_before = h.store.write_count.load(Ordering::SeqCst);

        let verdict = h.manager.update_credential("   ").await.unwrap();
        assert!(matches!(
            verdict,
            CredentialVerdict::Rejected {
                kind: LlmErrorKind::NotConfigured,
                ..
            }
        ));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(h.store.write_count.load(Ordering::SeqCst), writes_before);
    }

    // ==================== Missions, settings, resets ====================

    #[tokio::test]
    async fn test_missions_are_never_deduplicated() {
        let h = loaded(Arc::new(MockLlmService::new())).await;

        let a = h
            .manager
            .complete_mission("Water a plant", Some("file:///p1.jpg".to_string()))
            .await
            .unwrap();
        h.clock.advance(ChronoDuration::days(1));
        let b = h
            .manager
            .complete_mission("Water a plant", Some("file:///p1.jpg".to_string()))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.date, date("2024-01-03"));
        assert_eq!(b.date, date("2024-01-04"));

        let snap = h.manager.snapshot();
        assert_eq!(snap.mission_history, vec![b, a]);
        let stored: Vec<crate::db::CompletedMission> =
            serde_json::from_str(&h.store.get(keys::MISSION_HISTORY).unwrap()).unwrap();
        assert_eq!(stored, snap.mission_history);
    }

    #[tokio::test]
    async fn test_operator_sets_emotion() {
        let h = loaded(Arc::new(MockLlmService::new())).await;
        h.manager
            .set_emotional_state(Emotion::Withdrawn)
            .await
            .unwrap();
        assert_eq!(
            h.manager.snapshot().current_emotional_state,
            Emotion::Withdrawn
        );
        assert_eq!(
            h.store.get(keys::EMOTIONAL_STATE).as_deref(),
            Some("withdrawn")
        );
    }

    #[tokio::test]
    async fn test_soft_reset_scope() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("hi", "shy");
        let store = Arc::new(InMemoryStore::with_values(&[
            (keys::DAY_COUNT, "4"),
            (keys::LAST_VISIT_DATE, "2024-01-02"),
        ]));
        let h = harness_with(store, mock, Arc::new(FixedClock::on(2024, 1, 3)), Some("k"));
        h.manager.restore().await.unwrap();
        h.manager.submit_user_message("hello").await;
        h.manager.complete_mission("Walk", None).await.unwrap();
        h.manager.set_ai_feature_enabled(false).await.unwrap();

        h.manager.soft_reset().await.unwrap();

        let snap = h.manager.snapshot();
        assert!(snap.chat_history.is_empty());
        assert_eq!(snap.chat_turn_count, 0);
        assert_eq!(snap.day_count, 5);
        assert_eq!(snap.mission_history.len(), 1);
        assert!(!snap.ai_feature_enabled);
        assert_eq!(snap.current_emotional_state, Emotion::Shy);

        assert_eq!(h.store.get(keys::CHAT_HISTORY), None);
        assert_eq!(h.store.get(keys::CHAT_TURN_COUNT), None);
        assert!(h.store.get(keys::MISSION_HISTORY).is_some());
        assert_eq!(h.store.get(keys::DAY_COUNT).as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_hard_reset_returns_everything_to_defaults() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("hi", "shy");
        mock.queue_reply("probe ok", "neutral");
        let store = Arc::new(InMemoryStore::with_values(&[
            (keys::DAY_COUNT, "7"),
            (keys::LAST_VISIT_DATE, "2024-01-01"),
        ]));
        let h = harness_with(store, mock, Arc::new(FixedClock::on(2024, 1, 3)), None);
        h.manager.restore().await.unwrap();
        h.manager.submit_user_message("hello").await;
        h.manager.complete_mission("Walk", None).await.unwrap();
        h.manager.update_credential("op-key").await.unwrap();
        h.manager.set_ai_feature_enabled(false).await.unwrap();

        h.manager.hard_reset().await.unwrap();

        let snap = h.manager.snapshot();
        assert_eq!(snap.day_count, 1);
        assert_eq!(snap.last_visit_date, date("2024-01-03"));
        assert!(snap.chat_history.is_empty());
        assert!(snap.mission_history.is_empty());
        assert_eq!(snap.chat_turn_count, 0);
        assert_eq!(snap.current_emotional_state, Emotion::Neutral);
        assert!(snap.ai_feature_enabled);
        assert_eq!(snap.credential, CredentialOrigin::Absent);
        assert_eq!(snap.service_health.status, HealthStatus::Idle);

        assert_eq!(
            h.store.keys(),
            vec![keys::DAY_COUNT.to_string(), keys::LAST_VISIT_DATE.to_string()]
        );

        // Reloading the same day does not advance the counter
        let again = harness_with(
            h.store.clone(),
            Arc::new(MockLlmService::new()),
            h.clock.clone(),
            None,
        );
        again.manager.restore().await.unwrap();
        assert_eq!(again.manager.snapshot().day_count, 1);
    }

    // ==================== Persistence failures ====================

    #[tokio::test]
    async fn test_single_write_failure_is_retried() {
        let h = loaded(Arc::new(MockLlmService::new())).await;
        h.store.fail_next_writes(1);

        h.manager.set_emotional_state(Emotion::Shy).await.unwrap();
        assert_eq!(h.store.get(keys::EMOTIONAL_STATE).as_deref(), Some("shy"));
        assert!(h.manager.snapshot().storage_health.ok);
    }

    #[tokio::test]
    async fn test_persistent_write_failure_is_surfaced() {
        let mock = Arc::new(MockLlmService::new());
        mock.queue_reply("still here", "relaxed");
        let h = loaded(mock).await;
        let mut rx = h.manager.subscribe();
        h.store.set_broken(true);

        let err = h
            .manager
            .set_emotional_state(Emotion::Hesitant)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Persistence { .. }));

        // The change stands in memory
        let snap = h.manager.snapshot();
        assert_eq!(snap.current_emotional_state, Emotion::Hesitant);
        assert!(!snap.storage_health.ok);
        assert!(snap
            .storage_health
            .failing_keys
            .contains(keys::EMOTIONAL_STATE));

        // Turns still complete
        let outcome = h.manager.submit_user_message("hello?").await;
        assert!(matches!(outcome, SubmitOutcome::Replied { .. }));
        assert_eq!(h.manager.snapshot().chat_history.len(), 2);

        let mut saw_storage_event = false;
        while let Ok(event) = rx.try_recv() {
            if let StateEvent::Storage { health } = event {
                saw_storage_event = true;
                assert!(!health.ok);
            }
        }
        assert!(saw_storage_event);

        // Recovery once writes succeed again
        h.store.set_broken(false);
        h.manager.set_emotional_state(Emotion::Shy).await.unwrap();
        h.manager.submit_user_message("back").await;
        let health = h.manager.snapshot().storage_health;
        assert!(health.ok, "{health:?}");
        assert_eq!(stored_history(&h.store).len(), 4);
    }
}
