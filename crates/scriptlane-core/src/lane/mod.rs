//! Lanes: dedicated single-thread workers that give sessions thread affinity.
//!
//! Every guest context lives on exactly one lane and is only touched by that
//! lane's thread. Work for a session is submitted as a [`LaneTask`]; the lane
//! runs its tasks one at a time in submission order, so two sessions sharing a
//! lane interleave task by task and never run concurrently.
//!
//! # Architecture
//!
//! ```text
//! LanePool (round robin)
//!     │
//!     └── LaneHandle ── mpsc ──> lane thread "scriptlane-lane-N"
//!                                    │
//!                                    └── LaneScope
//!                                          ├── Arc<Engine>
//!                                          └── GuestSession per open session
//! ```

mod pool;
mod worker;

pub use pool::LanePool;
pub use worker::{LaneHandle, LaneScope, LaneTask};
