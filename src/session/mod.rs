//! Session and approval correlation layer.
//!
//! [`ChannelRegistry`] and [`Correlator`] are the only shared, lock-guarded
//! state in the process. Everything a run owns lives in its own task.
//!
//! ```text
//!  pipeline task                         WebSocket task
//!  ─────────────                         ──────────────
//!  ApprovalGateway::request_approval
//!    ├─ Correlator::register_waiter ──┐
//!    ├─ ChannelRegistry::send ────────┼──> approval_request ──> reviewer
//!    └─ Waiter::recv (suspended)      │
//!                                     └── Correlator::submit_decision <── decision
//! ```

pub mod correlator;
pub mod gateway;
pub mod registry;

pub use correlator::{Correlator, PendingApproval, Resolution, SubmitOutcome, Waiter};
pub use gateway::{ApprovalGateway, ApprovalOutcome};
pub use registry::{ChannelRegistry, RunGuard, SessionHandle};
