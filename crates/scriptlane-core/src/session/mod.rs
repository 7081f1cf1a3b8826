//! Per-execution sessions.
//!
//! A session is split in two halves:
//!
//! - [`Session`] is the thread-safe half: transaction id, close state machine,
//!   captured output and the registry of in-flight bridged operations. The
//!   executor, the bridge and a cancelling caller all hold it through an `Arc`.
//! - `GuestSession` is the lane-local half: the QuickJS runtime and context.
//!   It lives in the bound lane's [`LaneScope`](crate::lane::LaneScope) and is
//!   dropped there by the teardown task that `close` posts.
//!
//! # Close state machine
//!
//! ```text
//! Open ──close(force)──> Closing ──teardown task on lane──> Closed
//!          │                 │
//!          │                 └── interrupt flag set when forced
//!          └── registry drained: each pending operation cancelled once
//! ```

mod guest;
mod scope;

pub(crate) use guest::{GuestSession, GuestState, Resolvers};
pub use scope::{ScopeHandle, ScriptScope};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::lane::LaneHandle;

/// Opaque id correlating a session with its logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle of one bridged operation within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Lifecycle of a session. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closing,
    Closed,
}

/// How a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Closed after its result settled.
    Graceful,
    /// Closed abruptly, e.g. because the caller cancelled the execution.
    Forced,
}

/// Registry entry for an in-flight bridged operation.
///
/// The cancel callback is consumed on use, so an entry can signal
/// cancellation at most once. It runs while the session state is locked and
/// must not call back into the session.
pub struct PendingOperation {
    description: String,
    cancel: Box<dyn FnOnce() + Send>,
}

impl PendingOperation {
    pub fn new(description: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            description: description.into(),
            cancel: Box::new(cancel),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Send the cancel signal.
    pub fn cancel(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

struct SessionState {
    status: SessionStatus,
    close_kind: Option<CloseKind>,
    operations: HashMap<OperationId, PendingOperation>,
}

/// Thread-safe half of a per-execution guest session.
pub struct Session {
    id: TransactionId,
    lane: LaneHandle,
    /// Status and registry share one lock so a settle on the lane and a
    /// cancel from another thread can never both process the same entry.
    state: Mutex<SessionState>,
    output: Mutex<String>,
    interrupted: Arc<AtomicBool>,
    next_operation: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lane", &self.lane.index())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a session bound to `lane`.
    pub(crate) fn open(lane: LaneHandle) -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId::new(),
            lane,
            state: Mutex::new(SessionState {
                status: SessionStatus::Open,
                close_kind: None,
                operations: HashMap::new(),
            }),
            output: Mutex::new(String::new()),
            interrupted: Arc::new(AtomicBool::new(false)),
            next_operation: AtomicU64::new(1),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    /// Index of the lane this session is bound to.
    pub fn lane_index(&self) -> usize {
        self.lane.index()
    }

    pub(crate) fn lane(&self) -> &LaneHandle {
        &self.lane
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    pub fn close_kind(&self) -> Option<CloseKind> {
        self.lock_state().close_kind
    }

    pub fn is_open(&self) -> bool {
        self.status() == SessionStatus::Open
    }

    /// Check if close has been requested.
    pub fn is_closed(&self) -> bool {
        self.status() != SessionStatus::Open
    }

    /// Text the guest wrote to its console so far.
    pub fn script_output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn append_output(&self, text: &str) {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    /// Flag polled by the guest runtime; set when the session is force closed.
    pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Allocate a handle for a new bridged operation.
    pub fn next_operation_id(&self) -> OperationId {
        OperationId(self.next_operation.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of bridged operations still in flight.
    pub fn pending_operations(&self) -> usize {
        self.lock_state().operations.len()
    }

    /// Track an in-flight operation.
    ///
    /// Fails, handing the entry back, once the session is no longer open.
    pub fn register_operation(
        &self,
        id: OperationId,
        operation: PendingOperation,
    ) -> Result<(), PendingOperation> {
        let mut state = self.lock_state();
        if state.status != SessionStatus::Open {
            return Err(operation);
        }
        tracing::trace!(
            "Session {} registered {} ({})",
            self.id,
            id,
            operation.description()
        );
        state.operations.insert(id, operation);
        Ok(())
    }

    /// Remove a settled operation from the registry.
    ///
    /// Returns `false` when the entry is gone, i.e. it was already cancelled
    /// by `close` and its settlement must be ignored.
    pub fn unregister_operation(&self, id: OperationId) -> bool {
        self.lock_state().operations.remove(&id).is_some()
    }

    /// Close the session. Only the first call has an effect, except that a
    /// forced close arriving while a graceful one is pending still interrupts
    /// the guest.
    ///
    /// Every pending operation is cancelled exactly once, then the guest
    /// context is torn down by a task posted to the bound lane.
    pub fn close(self: &Arc<Self>, force: bool) {
        {
            let mut state = self.lock_state();
            if state.status != SessionStatus::Open {
                if force && state.status == SessionStatus::Closing {
                    self.interrupted.store(true, Ordering::Release);
                    state.close_kind = Some(CloseKind::Forced);
                }
                return;
            }

            tracing::trace!("Closing session {}, force: {}", self.id, force);
            state.status = SessionStatus::Closing;
            state.close_kind = Some(if force {
                CloseKind::Forced
            } else {
                CloseKind::Graceful
            });
            if force {
                self.interrupted.store(true, Ordering::Release);
            }

            for (id, operation) in state.operations.drain() {
                tracing::trace!(
                    "Session {} cancelling {} ({})",
                    self.id,
                    id,
                    operation.description()
                );
                operation.cancel();
            }
        }

        let task = TeardownTask(Arc::clone(self));
        let _ = self.lane.submit(move |scope| {
            let task = task;
            scope.teardown(&task.0);
        });
    }

    pub(crate) fn mark_closed(&self) {
        let mut state = self.lock_state();
        state.status = SessionStatus::Closed;
        if state.close_kind.is_none() {
            state.close_kind = Some(CloseKind::Forced);
        }
        state.operations.clear();
    }
}

/// Marks its session closed when dropped, so a teardown task the lane never
/// runs (pool disposed) still completes the state machine.
struct TeardownTask(Arc<Session>);

impl Drop for TeardownTask {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}
