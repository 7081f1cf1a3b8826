//! Execution engine.
//!
//! An execution runs one [`ScriptHandler`] in a fresh session:
//!
//! ```text
//! execute(handler).await
//!     │
//!     ├── LanePool::next_lane ──> Session::open (guarded)
//!     │
//!     ├── lane task: initiate_context_builder ─> initiate_context ─> evaluate_script
//!     │       │
//!     │       └── promise-shaped result? attach then handlers : settle now
//!     │
//!     ├── transform_script_response (session still open)
//!     │
//!     └── Session::close(false), or close(true) when the future is dropped
//! ```

mod executor;
mod handler;

pub use executor::{AsyncScriptExecutor, ExecutionRequest, ExecutorBuilder};
pub use handler::{ScriptHandler, SourceHandler};
