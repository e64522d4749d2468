//! Shared domain types for memeloop.
//!
//! - [`protocol`]: JSON messages exchanged over the reviewer WebSocket
//! - [`iteration`]: meme specifications and the per-run iteration history

pub mod iteration;
pub mod protocol;

pub use iteration::{IterationContext, IterationOutcome, IterationRecord, MemeSpec};
pub use protocol::{ClientMessage, Decision, DecisionPayload, ServerMessage};
