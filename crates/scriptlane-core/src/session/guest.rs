//! Lane-local half of a session: the guest runtime and context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rquickjs::convert::Coerced;
use rquickjs::function::{Constructor, Rest};
use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime, Value};

use crate::config::{ContextConfig, Engine};
use crate::error::Error;
use crate::value::render_console_arg;

use super::{OperationId, ScriptScope, Session, TransactionId};

/// Settlement capabilities of a guest promise created by the bridge.
pub(crate) struct Resolvers {
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
    pub description: String,
    /// Guest call stack captured when the operation was started.
    pub call_stack: Option<String>,
}

/// State shared between a guest session and the host functions installed in
/// its context. Only ever touched on the session's lane.
pub(crate) struct GuestState {
    session: Arc<Session>,
    host: tokio::runtime::Handle,
    resolvers: RefCell<HashMap<OperationId, Resolvers>>,
    /// Guest error objects thrown for converted errors, matched by identity.
    host_failures: RefCell<Vec<(Persistent<Object<'static>>, Error)>>,
}

impl GuestState {
    pub fn new(session: Arc<Session>, host: tokio::runtime::Handle) -> Self {
        Self {
            session,
            host,
            resolvers: RefCell::new(HashMap::new()),
            host_failures: RefCell::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Runtime host operations are driven on.
    pub fn host(&self) -> &tokio::runtime::Handle {
        &self.host
    }

    pub fn store_resolvers(&self, id: OperationId, resolvers: Resolvers) {
        self.resolvers.borrow_mut().insert(id, resolvers);
    }

    pub fn take_resolvers(&self, id: OperationId) -> Option<Resolvers> {
        self.resolvers.borrow_mut().remove(&id)
    }

    /// Look up the converted error `object` was built for.
    ///
    /// Only the exact object returned by [`failure_value`](Self::failure_value)
    /// matches; copies and look-alikes built by the script do not.
    pub fn host_failure<'js>(&self, ctx: &Ctx<'js>, object: &Object<'js>) -> rquickjs::Result<Option<Error>> {
        for (thrown, error) in self.host_failures.borrow().iter() {
            if thrown.clone().restore(ctx)?.as_value() == object.as_value() {
                return Ok(Some(error.clone()));
            }
        }
        Ok(None)
    }

    /// Build a guest `Error` carrying `error`'s message, remembered so the
    /// converter later recovers `error` itself.
    pub fn failure_value<'js>(&self, ctx: &Ctx<'js>, error: Error) -> rquickjs::Result<Value<'js>> {
        let constructor: Constructor = ctx.globals().get("Error")?;
        let object: Object = constructor.construct((error.message().to_string(),))?;

        self.host_failures
            .borrow_mut()
            .push((Persistent::save(ctx, object.clone()), error));

        Ok(object.into_value())
    }

    /// Release every guest value held from the host side.
    fn clear(&self) {
        self.resolvers.borrow_mut().clear();
        self.host_failures.borrow_mut().clear();
    }
}

/// QuickJS runtime and context owned by one session.
///
/// Field order matters: the context must go before the runtime, and the
/// persistent values in `state` before both (see `Drop`).
pub(crate) struct GuestSession {
    state: Rc<GuestState>,
    context: Context,
    runtime: Runtime,
}

impl GuestSession {
    /// Build the runtime and context for `state`'s session.
    pub fn create(engine: &Engine, config: &ContextConfig, state: Rc<GuestState>) -> rquickjs::Result<Self> {
        let runtime = engine.create_runtime(config)?;

        let interrupted = state.session().interrupt_flag();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupted.load(Ordering::Acquire))));

        let context = Context::full(&runtime)?;
        if config.capture_console {
            context.with(|ctx| install_console(&ctx, Arc::clone(state.session())))?;
        }

        Ok(Self {
            state,
            context,
            runtime,
        })
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.state.session().transaction_id()
    }

    pub fn session(&self) -> &Arc<Session> {
        self.state.session()
    }

    /// Enter the guest context.
    pub fn with<R>(&self, f: impl for<'js> FnOnce(ScriptScope<'js>) -> R) -> R {
        let state = Rc::clone(&self.state);
        self.context.with(move |ctx| f(ScriptScope::new(ctx, state)))
    }

    /// Run queued promise jobs until none are left.
    ///
    /// Stops early once the session is interrupted; the remaining jobs are
    /// discarded with the runtime.
    pub fn drain_jobs(&self) {
        let session = self.state.session();
        while !session.is_interrupted() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    let reason = self.context.with(|ctx| {
                        let thrown = ctx.catch();
                        thrown.get::<Coerced<String>>().map(|text| text.0).unwrap_or_default()
                    });
                    tracing::debug!(
                        "Pending job raised an exception in session {}: {}",
                        session.transaction_id(),
                        reason
                    );
                }
            }
        }
    }
}

impl Drop for GuestSession {
    fn drop(&mut self) {
        // Persistent values must be freed while their runtime is still alive
        self.state.clear();
    }
}

/// Install a `console` whose methods append to the session output.
fn install_console<'js>(ctx: &Ctx<'js>, session: Arc<Session>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    for method in ["log", "info", "warn", "error", "debug", "trace"] {
        let session = Arc::clone(&session);
        let function = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
                let mut line = String::new();
                for (i, arg) in args.0.into_iter().enumerate() {
                    if i > 0 {
                        line.push(' ');
                    }
                    line.push_str(&render_console_arg(&ctx, arg)?);
                }
                tracing::trace!("[{}] console.{}: {}", session.transaction_id(), method, line);
                line.push('\n');
                session.append_output(&line);
                Ok(())
            },
        )?;
        console.set(method, function)?;
    }

    ctx.globals().set("console", console)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::LanePool;

    fn guest_session(host: &tokio::runtime::Runtime) -> (LanePool, GuestSession) {
        let engine = Arc::new(Engine::default());
        let pool = LanePool::new(1, Arc::clone(&engine)).unwrap();
        let session = Session::open(pool.next_lane().unwrap());
        let state = Rc::new(GuestState::new(session, host.handle().clone()));
        let guest = GuestSession::create(&engine, &ContextConfig::default(), state).unwrap();
        (pool, guest)
    }

    #[test]
    fn test_drain_jobs_clears_job_exception() {
        let host = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (_pool, guest) = guest_session(&host);

        guest.with(|scope| {
            scope.eval::<Value>("Promise.resolve().then(() => { while (true) {} })").unwrap();
        });

        let interrupted = guest.session().interrupt_flag();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            interrupted.store(true, Ordering::Release);
        });
        guest.drain_jobs();
        interrupter.join().unwrap();

        guest.with(|scope| assert!(!scope.ctx().catch().is_error()));
    }

    #[test]
    fn test_failure_value_matches_only_itself() {
        let host = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (_pool, guest) = guest_session(&host);

        guest.with(|scope| {
            let error = Error::new(crate::ErrorKind::Host, "connection reset");
            let thrown = scope.state().failure_value(scope.ctx(), error).unwrap();
            let thrown = thrown.into_object().unwrap();
            let found = scope.state().host_failure(scope.ctx(), &thrown).unwrap();
            assert_eq!(found.unwrap().message(), "connection reset");

            let other: Object = scope.eval("new Error('connection reset')").unwrap();
            assert!(scope.state().host_failure(scope.ctx(), &other).unwrap().is_none());
        });
    }
}
