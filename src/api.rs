//! HTTP API for the companion app's screens
//!
//! Chat, missions and the operator panel all go through the single
//! [`StateManager`](crate::runtime::StateManager); changes are pushed to
//! clients over Server-Sent Events.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::runtime::ProductionManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProductionManager>,
}

impl AppState {
    pub fn new(manager: Arc<ProductionManager>) -> Self {
        Self { manager }
    }
}
