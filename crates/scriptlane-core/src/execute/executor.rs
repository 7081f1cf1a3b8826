//! Asynchronous script executor.

use std::future::IntoFuture;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::bridge::{ResultSlot, settle_script_result};
use crate::config::{Engine, ExecutorConfig};
use crate::convert::Failure;
use crate::error::{Error, ErrorKind, Result};
use crate::lane::{LanePool, LaneScope};
use crate::session::{GuestSession, GuestState, Session};

use super::handler::ScriptHandler;

/// Runs scripts on a pool of lanes.
///
/// Every execution gets a fresh session bound to one lane, picked round
/// robin. Cloning the executor shares the pool.
///
/// # Example
///
/// ```no_run
/// use scriptlane_core::{AsyncScriptExecutor, SourceHandler};
///
/// # async fn run() -> scriptlane_core::Result<()> {
/// let executor = AsyncScriptExecutor::builder().lanes(2).build()?;
/// let greeting = executor
///     .execute(SourceHandler::new("(async () => 'Hello ' + 'world')"))
///     .await?;
/// assert_eq!(greeting, "Hello world");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AsyncScriptExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    lanes: LanePool,
    engine: Arc<Engine>,
    /// Runtime that drives bridged host operations; the caller's runtime when unset.
    host: Option<Handle>,
}

impl AsyncScriptExecutor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Executor with default settings: one lane per available CPU.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Executor configured from `config`.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Prepare an execution of `handler`.
    ///
    /// Nothing runs until the returned request is awaited. Dropping the
    /// future before it completes force-closes the session, interrupting the
    /// guest and cancelling its pending host operations.
    pub fn execute<H: ScriptHandler>(&self, handler: H) -> ExecutionRequest<H> {
        ExecutionRequest {
            inner: Arc::clone(&self.inner),
            handler,
        }
    }

    /// Engine shared by all lanes.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn lanes(&self) -> &LanePool {
        &self.inner.lanes
    }

    /// Shut the lanes down. Executions started afterwards fail.
    pub fn dispose(&self) {
        self.inner.lanes.dispose();
    }
}

impl std::fmt::Debug for AsyncScriptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncScriptExecutor")
            .field("lanes", &self.inner.lanes.len())
            .field("disposed", &self.inner.lanes.is_disposed())
            .finish()
    }
}

/// Builder for [`AsyncScriptExecutor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    lanes: Option<usize>,
    engine: Option<Arc<Engine>>,
    host: Option<Handle>,
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    /// Number of lanes. Overrides the configured value.
    pub fn lanes(mut self, count: usize) -> Self {
        self.lanes = Some(count);
        self
    }

    /// Share an existing engine instead of building one from the configuration.
    pub fn engine(mut self, engine: Arc<Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Runtime that drives host operations started through the bridge.
    pub fn host_runtime(mut self, handle: Handle) -> Self {
        self.host = Some(handle);
        self
    }

    pub fn config(mut self, config: &ExecutorConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn build(self) -> Result<AsyncScriptExecutor> {
        let lane_count = match self.lanes {
            Some(count) => count,
            None => self.config.lane_count()?,
        };
        let engine = match self.engine {
            Some(engine) => engine,
            None => Engine::new(self.config.context_config()),
        };
        let lanes = LanePool::new(lane_count, Arc::clone(&engine))?;

        Ok(AsyncScriptExecutor {
            inner: Arc::new(ExecutorInner {
                lanes,
                engine,
                host: self.host,
            }),
        })
    }
}

/// A pending execution. Await it to run the script.
#[must_use = "an execution does nothing unless awaited"]
pub struct ExecutionRequest<H> {
    inner: Arc<ExecutorInner>,
    handler: H,
}

impl<H: ScriptHandler> IntoFuture for ExecutionRequest<H> {
    type Output = Result<H::Output>;
    type IntoFuture = BoxFuture<'static, Result<H::Output>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(run(self.inner, self.handler))
    }
}

/// Closes the session when the execution ends: gracefully through
/// [`release`](Self::release), forcefully if dropped before that.
struct SessionGuard {
    session: Option<Arc<Session>>,
}

impl SessionGuard {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close(false);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(
                "Execution in session {} cancelled, force closing",
                session.transaction_id()
            );
            session.close(true);
        }
    }
}

async fn run<H: ScriptHandler>(inner: Arc<ExecutorInner>, handler: H) -> Result<H::Output> {
    let host = match &inner.host {
        Some(handle) => handle.clone(),
        None => Handle::try_current()
            .map_err(|_| Error::config("no tokio runtime available to drive host operations"))?,
    };

    let lane = inner.lanes.next_lane()?;
    let session = Session::open(lane.clone());
    let guard = SessionGuard::new(Arc::clone(&session));
    let id = session.transaction_id();
    tracing::debug!("Starting script in session {} on lane {}", id, lane.index());

    let (sender, receiver) = oneshot::channel();
    let target = Arc::clone(&session);
    lane.submit(move |scope| evaluate_on_lane(scope, target, host, handler, sender))
        .map_err(|e| e.with_session(id, String::new()))?;

    let outcome = match receiver.await {
        Ok(result) => result,
        Err(_) => Err(Error::new(
            ErrorKind::SessionClosed,
            "session closed before the script settled",
        )
        .with_session(id, session.script_output())),
    };

    match &outcome {
        Ok(_) => tracing::debug!("Script finished in session {}", id),
        Err(e) => tracing::debug!("Script failed in session {}: {}", id, e),
    }
    guard.release();
    outcome
}

/// First lane task of an execution: build the guest context, evaluate, and
/// hook the result up to `sender`.
fn evaluate_on_lane<H: ScriptHandler>(
    lane: &mut LaneScope,
    session: Arc<Session>,
    host: Handle,
    handler: H,
    sender: oneshot::Sender<Result<H::Output>>,
) {
    let slot = ResultSlot::new(sender);
    let id = session.transaction_id();
    if !session.is_open() {
        return;
    }

    let config = handler.initiate_context_builder(lane.engine().context_defaults().clone());
    let state = Rc::new(GuestState::new(Arc::clone(&session), host));
    let guest = match GuestSession::create(lane.engine(), &config, state) {
        Ok(guest) => guest,
        Err(e) => {
            let error = Error::lane(format!("failed to create guest context: {e}"))
                .with_session(id, session.script_output());
            slot.complete(Err(error));
            return;
        }
    };

    let handler = Rc::new(handler);
    let guest = lane.insert_session(guest);
    guest.with(|scope| {
        let evaluated = handler
            .initiate_context(&scope)
            .and_then(|()| handler.evaluate_script(&scope));
        match evaluated {
            Ok(value) => {
                let handler = Rc::clone(&handler);
                settle_script_result(
                    &scope,
                    value,
                    move |scope, value| handler.transform_script_response(scope, value),
                    slot,
                );
            }
            Err(e) => slot.complete(Err(scope.classify(Failure::Engine(e)))),
        }
    });
    guest.drain_jobs();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::SourceHandler;

    #[test]
    fn test_builder_rejects_zero_lanes() {
        let err = AsyncScriptExecutor::builder().lanes(0).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_builder_uses_config() {
        let config = ExecutorConfig {
            lanes: Some(3),
            memory_limit: Some(8 * 1024 * 1024),
            ..Default::default()
        };
        let executor = AsyncScriptExecutor::from_config(&config).unwrap();
        assert_eq!(executor.lanes().len(), 3);
        assert_eq!(executor.engine().context_defaults().memory_limit, Some(8 * 1024 * 1024));
    }

    #[test]
    fn test_request_is_cold() {
        let executor = AsyncScriptExecutor::builder().lanes(2).build().unwrap();
        let request = executor.execute(SourceHandler::new("'never'"));
        drop(request);

        // Round robin cursor untouched: nothing was assigned
        assert_eq!(executor.lanes().next_lane().unwrap().index(), 0);
    }

    #[test]
    fn test_execute_without_runtime_fails() {
        let executor = AsyncScriptExecutor::builder().lanes(1).build().unwrap();
        let future = executor.execute(SourceHandler::new("1")).into_future();
        let err = futures::executor::block_on(future).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_simple_source() {
        let executor = AsyncScriptExecutor::builder().lanes(2).build().unwrap();
        let result = executor
            .execute(SourceHandler::new("'Hello ' + 'world'"))
            .await
            .unwrap();
        assert_eq!(result, "Hello world");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_explicit_host_runtime() {
        let host = tokio::runtime::Runtime::new().unwrap();
        let executor = AsyncScriptExecutor::builder()
            .lanes(1)
            .host_runtime(host.handle().clone())
            .build()
            .unwrap();
        let result = executor
            .execute(SourceHandler::new("({ answer: 42 })"))
            .await
            .unwrap();
        assert_eq!(result, r#"{"answer":42}"#);
        host.shutdown_background();
    }
}
