//! Lane worker threads.
//!
//! Provides `LaneHandle` for submitting tasks to a lane and `LaneScope`, the
//! lane-local state every task runs against.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::config::Engine;
use crate::error::{Error, Result};
use crate::session::{GuestSession, Session, TransactionId};

/// Unit of work executed on a lane.
pub type LaneTask = Box<dyn FnOnce(&mut LaneScope) + Send + 'static>;

enum LaneMessage {
    Run(LaneTask),
    Shutdown,
}

/// Handle for submitting work to one lane.
///
/// Cheap to clone; every clone feeds the same FIFO queue.
#[derive(Clone)]
pub struct LaneHandle {
    index: usize,
    sender: mpsc::UnboundedSender<LaneMessage>,
}

impl std::fmt::Debug for LaneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneHandle").field("index", &self.index).finish()
    }
}

impl LaneHandle {
    /// Spawn the worker thread for lane `index`.
    pub(crate) fn spawn(index: usize, engine: Arc<Engine>) -> Result<(Self, JoinHandle<()>)> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(format!("scriptlane-lane-{index}"))
            .spawn(move || run_lane(index, engine, receiver))
            .map_err(|e| Error::lane(format!("Failed to spawn lane {index}: {e}")))?;

        tracing::debug!("Spawned lane {}", index);
        Ok((Self { index, sender }, thread))
    }

    /// Index of this lane within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Queue a task behind everything already submitted to this lane.
    pub fn submit(&self, task: impl FnOnce(&mut LaneScope) + Send + 'static) -> Result<()> {
        self.sender
            .send(LaneMessage::Run(Box::new(task)))
            .map_err(|_| {
                tracing::warn!("Task submitted to lane {} after shutdown", self.index);
                Error::lane(format!("lane {} has shut down", self.index))
            })
    }

    /// Ask the lane thread to stop after the task it is currently running.
    pub(crate) fn shutdown(&self) {
        let _ = self.sender.send(LaneMessage::Shutdown);
    }

    /// Check if the lane thread is still accepting tasks.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Lane-local state handed to every task.
///
/// Owns the guest contexts of the sessions bound to this lane. Because it
/// never leaves the lane thread, guest values need no synchronization.
pub struct LaneScope {
    index: usize,
    engine: Arc<Engine>,
    sessions: HashMap<TransactionId, GuestSession>,
}

impl LaneScope {
    fn new(index: usize, engine: Arc<Engine>) -> Self {
        Self {
            index,
            engine,
            sessions: HashMap::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Shared engine settings.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Number of guest contexts currently alive on this lane.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn insert_session(&mut self, guest: GuestSession) -> &GuestSession {
        let id = guest.transaction_id();
        self.sessions.entry(id).or_insert(guest)
    }

    pub(crate) fn session(&self, id: &TransactionId) -> Option<&GuestSession> {
        self.sessions.get(id)
    }

    /// Drop the guest context of `session` and mark it closed.
    pub(crate) fn teardown(&mut self, session: &Session) {
        let id = session.transaction_id();
        if let Some(guest) = self.sessions.remove(&id) {
            drop(guest);
            tracing::debug!("Tore down guest context {} on lane {}", id, self.index);
        }
        session.mark_closed();
    }
}

impl Drop for LaneScope {
    fn drop(&mut self) {
        for (_, guest) in self.sessions.drain() {
            let session = Arc::clone(guest.session());
            drop(guest);
            session.mark_closed();
        }
    }
}

fn run_lane(index: usize, engine: Arc<Engine>, mut receiver: mpsc::UnboundedReceiver<LaneMessage>) {
    let mut scope = LaneScope::new(index, engine);

    while let Some(message) = receiver.blocking_recv() {
        match message {
            LaneMessage::Run(task) => {
                // A panicking task must not take the other sessions on this lane down with it
                let result = catch_unwind(AssertUnwindSafe(|| task(&mut scope)));
                if let Err(e) = result {
                    tracing::error!("Task on lane {} panicked: {:?}", index, e);
                }
            }
            LaneMessage::Shutdown => break,
        }
    }

    receiver.close();
    tracing::debug!(
        "Lane {} stopped with {} open guest contexts",
        index,
        scope.session_count()
    );
}
