//! Single-flight turn state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.
//! The runtime owns I/O and executes the returned effects.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::Event;
pub use state::{ReplyMode, TurnState};
pub use transition::{transition, TransitionError};
