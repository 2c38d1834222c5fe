//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the state manager with mock implementations.

use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::sync::Arc;

/// Durable string-keyed, string-valued storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch several keys; missing keys come back as `None`
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, String>;

    /// Write several keys atomically
    async fn multi_set(&self, pairs: &[(&str, String)]) -> Result<(), String>;

    /// Remove several keys atomically
    async fn multi_remove(&self, keys: &[&str]) -> Result<(), String>;
}

/// Source of wall-clock time and the user's calendar date
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Real clock. Calendar days follow the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, String> {
        (**self).multi_get(keys).await
    }

    async fn multi_set(&self, pairs: &[(&str, String)]) -> Result<(), String> {
        (**self).multi_set(pairs).await
    }

    async fn multi_remove(&self, keys: &[&str]) -> Result<(), String> {
        (**self).multi_remove(keys).await
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn today(&self) -> NaiveDate {
        (**self).today()
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a key-value store
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
}

impl DatabaseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStore for DatabaseStore {
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, String> {
        self.db.multi_get(keys).map_err(|e| e.to_string())
    }

    async fn multi_set(&self, pairs: &[(&str, String)]) -> Result<(), String> {
        self.db.multi_set(pairs).map_err(|e| e.to_string())
    }

    async fn multi_remove(&self, keys: &[&str]) -> Result<(), String> {
        self.db.multi_remove(keys).map_err(|e| e.to_string())
    }
}
