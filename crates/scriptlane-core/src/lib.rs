//! Lane-affine asynchronous JavaScript execution for Rust hosts.
//!
//! This crate provides:
//! - A fixed pool of lanes, dedicated threads that give every guest context
//!   thread affinity without locking it
//! - Per-execution sessions with an explicit `Open → Closing → Closed` close
//!   state machine and cancellation of in-flight host operations
//! - A promise bridge exposing host futures to scripts as native promises
//! - A single error type for guest and host failures, correlated with the
//!   session that produced them
//!
//! # Example
//!
//! ```no_run
//! use scriptlane_core::{AsyncScriptExecutor, ScriptScope, SourceHandler};
//!
//! fn install_delayed<'js>(scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
//!     let handle = scope.handle();
//!     let delayed = rquickjs::Function::new(
//!         scope.ctx().clone(),
//!         move |ctx: rquickjs::Ctx<'js>, name: String| -> rquickjs::Result<rquickjs::Promise<'js>> {
//!             handle
//!                 .enter(ctx)
//!                 .bridge()
//!                 .promise("delayed", async move { Ok(format!("Hello {name}")) })
//!         },
//!     )?;
//!     scope.globals().set("delayed", delayed)
//! }
//!
//! # async fn run() -> scriptlane_core::Result<()> {
//! let executor = AsyncScriptExecutor::new()?;
//! let handler = SourceHandler::new("(async function() { return await delayed('world'); })")
//!     .with_bindings(install_delayed);
//! assert_eq!(executor.execute(handler).await?, "Hello world");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod convert;
pub mod error;
pub mod execute;
pub mod lane;
pub mod session;
pub mod value;

pub use bridge::{PromiseBridge, as_thenable};
pub use config::{ContextConfig, Engine, ExecutorConfig};
pub use error::{Error, ErrorKind, Result};
pub use execute::{AsyncScriptExecutor, ExecutionRequest, ExecutorBuilder, ScriptHandler, SourceHandler};
pub use session::{
    CloseKind, OperationId, PendingOperation, ScopeHandle, ScriptScope, Session, SessionStatus, TransactionId,
};
pub use value::Json;
