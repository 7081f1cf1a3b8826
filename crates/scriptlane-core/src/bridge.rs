//! Promise bridge between host futures and guest promises.
//!
//! Host operations run on the host tokio runtime, but their outcome is always
//! delivered to the guest on the session's lane: completion posts a settle
//! task to the lane, and only that task touches the guest promise.
//!
//! The reverse direction, [`settle_script_result`], waits for a promise-shaped
//! script result by attaching guest-side `then` handlers.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::function::{Opt, This};
use rquickjs::{Ctx, Function, IntoJs, Object, Persistent, Promise, Value};
use tokio::sync::oneshot;

use crate::convert::Failure;
use crate::error::{Error, ErrorKind, Result};
use crate::lane::LaneScope;
use crate::session::{OperationId, PendingOperation, Resolvers, ScriptScope, Session};
use crate::value::current_stack;

/// Exposes host futures to a session's guest code as native promises.
///
/// Obtained from [`ScriptScope::bridge`], typically inside a binding installed
/// by `initiate_context`.
pub struct PromiseBridge<'js> {
    scope: ScriptScope<'js>,
}

impl<'js> PromiseBridge<'js> {
    pub(crate) fn new(scope: ScriptScope<'js>) -> Self {
        Self { scope }
    }

    /// Start `operation` on the host runtime and return a guest promise that
    /// settles with its outcome.
    ///
    /// The operation is tracked by the session: if the session closes first,
    /// the operation is cancelled and the promise never settles. A failure is
    /// converted to an [`Error`] tagged with `description` and the guest call
    /// stack at the time of this call.
    pub fn promise<F, V>(&self, description: impl Into<String>, operation: F) -> rquickjs::Result<Promise<'js>>
    where
        F: Future<Output = anyhow::Result<V>> + Send + 'static,
        V: for<'a> IntoJs<'a> + Send + 'static,
    {
        let ctx = self.scope.ctx();
        let session = Arc::clone(self.scope.session());
        let description = description.into();
        let call_stack = current_stack(ctx);

        let (promise, resolve, reject) = Promise::new(ctx)?;

        let id = session.next_operation_id();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let entry = PendingOperation::new(description.clone(), move || {
            let _ = cancel_tx.send(());
        });
        if session.register_operation(id, entry).is_err() {
            tracing::debug!(
                "Session {} is closed, not starting {} ({})",
                session.transaction_id(),
                id,
                description
            );
            return Ok(promise);
        }

        let state = self.scope.state();
        state.store_resolvers(
            id,
            Resolvers {
                resolve: Persistent::save(ctx, resolve),
                reject: Persistent::save(ctx, reject),
                description: description.clone(),
                call_stack,
            },
        );

        let lane = session.lane().clone();
        state.host().spawn(async move {
            tokio::select! {
                outcome = operation => {
                    let target = Arc::clone(&session);
                    let submitted = lane.submit(move |scope| settle_operation(scope, &target, id, outcome));
                    if submitted.is_err() {
                        tracing::debug!(
                            "Lane gone, dropping outcome of {} ({}) in session {}",
                            id,
                            description,
                            session.transaction_id()
                        );
                    }
                }
                _ = cancel_rx => {
                    tracing::trace!(
                        "Stopped {} ({}) of session {}",
                        id,
                        description,
                        session.transaction_id()
                    );
                }
            }
        });

        Ok(promise)
    }
}

/// Lane task delivering a host outcome to the guest promise of operation `id`.
fn settle_operation<V>(lane: &mut LaneScope, session: &Session, id: OperationId, outcome: anyhow::Result<V>)
where
    V: for<'a> IntoJs<'a>,
{
    // Loses the race against close: the cancel already had the effect
    if !session.unregister_operation(id) {
        tracing::trace!(
            "Ignoring outcome of cancelled {} in session {}",
            id,
            session.transaction_id()
        );
        return;
    }

    let Some(guest) = lane.session(&session.transaction_id()) else {
        return;
    };

    guest.with(|scope| {
        let Some(resolvers) = scope.state().take_resolvers(id) else {
            return;
        };
        if let Err(e) = deliver(&scope, id, resolvers, outcome) {
            let error = scope.classify(Failure::Engine(e));
            tracing::debug!(
                "Failed to settle {} in session {}: {}",
                id,
                session.transaction_id(),
                error
            );
        }
    });
    guest.drain_jobs();
}

fn deliver<'js, V>(scope: &ScriptScope<'js>, id: OperationId, resolvers: Resolvers, outcome: anyhow::Result<V>) -> rquickjs::Result<()>
where
    V: IntoJs<'js>,
{
    let Resolvers {
        resolve,
        reject,
        description,
        call_stack,
    } = resolvers;
    let resolve = resolve.restore(scope.ctx())?;
    let reject = reject.restore(scope.ctx())?;

    match outcome {
        Ok(value) => {
            tracing::trace!("Resolving {} ({})", id, description);
            resolve.call::<_, ()>((value,))
        }
        Err(e) => {
            tracing::trace!("Rejecting {} ({}): {:#}", id, description, e);
            let failure = match e.downcast::<Error>() {
                Ok(error) => Failure::Converted(error),
                Err(e) => Failure::Host(e),
            };
            let error = scope
                .classify(failure)
                .with_operation(description)
                .with_guest_stack(call_stack);
            let reason = scope.state().failure_value(scope.ctx(), error)?;
            reject.call::<_, ()>((reason,))
        }
    }
}

/// Capability check for promise-shaped values: any object, functions
/// included, with a callable `then` member.
///
/// Reading `then` may run a guest getter; its exception is returned.
pub fn as_thenable<'js>(value: &Value<'js>) -> rquickjs::Result<Option<(Object<'js>, Function<'js>)>> {
    let Some(object) = value.clone().into_object() else {
        return Ok(None);
    };
    let then: Value = object.get("then")?;
    Ok(then.into_function().map(|then| (object, then)))
}

/// One-shot completion of an execution's result, shared by the guest
/// callbacks that may complete it. Later completions are ignored.
pub(crate) struct ResultSlot<T>(Rc<RefCell<Option<oneshot::Sender<Result<T>>>>>);

impl<T> Clone for ResultSlot<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T> ResultSlot<T> {
    pub fn new(sender: oneshot::Sender<Result<T>>) -> Self {
        Self(Rc::new(RefCell::new(Some(sender))))
    }

    pub fn complete(&self, result: Result<T>) {
        if let Some(sender) = self.0.borrow_mut().take() {
            let _ = sender.send(result);
        }
    }
}

/// Settle the value produced by the script's evaluation into `slot`.
///
/// A promise-shaped value is awaited through guest `then` handlers; anything
/// else is settled at once. `transform` only runs while the session is open.
pub(crate) fn settle_script_result<'js, T, F>(scope: &ScriptScope<'js>, value: Value<'js>, transform: F, slot: ResultSlot<T>)
where
    T: 'static,
    F: FnOnce(&ScriptScope<'js>, Value<'js>) -> rquickjs::Result<T> + 'js,
{
    match as_thenable(&value) {
        Ok(None) => slot.complete(apply_transform(scope, value, transform)),
        Ok(Some((object, then))) => {
            if let Err(e) = attach_handlers(scope, object, then, transform, slot.clone()) {
                tracing::debug!(
                    "Failed to attach result handlers in session {}",
                    scope.transaction_id()
                );
                slot.complete(Err(scope.classify(Failure::Engine(e))));
            }
        }
        Err(e) => slot.complete(Err(scope.classify(Failure::Engine(e)))),
    }
}

fn attach_handlers<'js, T, F>(
    scope: &ScriptScope<'js>,
    object: Object<'js>,
    then: Function<'js>,
    transform: F,
    slot: ResultSlot<T>,
) -> rquickjs::Result<()>
where
    T: 'static,
    F: FnOnce(&ScriptScope<'js>, Value<'js>) -> rquickjs::Result<T> + 'js,
{
    let ctx = scope.ctx().clone();

    let on_fulfilled = {
        let handle = scope.handle();
        let slot = slot.clone();
        let transform = RefCell::new(Some(transform));
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: Opt<Value<'js>>| {
            let Some(transform) = transform.borrow_mut().take() else {
                return;
            };
            let scope = handle.enter(ctx.clone());
            let value = value.0.unwrap_or_else(|| Value::new_undefined(ctx));
            slot.complete(apply_transform(&scope, value, transform));
        })?
    };

    let on_rejected = {
        let handle = scope.handle();
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, reason: Opt<Value<'js>>| {
            let scope = handle.enter(ctx.clone());
            let reason = reason.0.unwrap_or_else(|| Value::new_undefined(ctx));
            slot.complete(Err(scope.classify(Failure::Guest(reason))));
        })?
    };

    then.call::<_, Value>((This(object), on_fulfilled, on_rejected))?;
    Ok(())
}

fn apply_transform<'js, T, F>(scope: &ScriptScope<'js>, value: Value<'js>, transform: F) -> Result<T>
where
    F: FnOnce(&ScriptScope<'js>, Value<'js>) -> rquickjs::Result<T>,
{
    if !scope.session().is_open() {
        return Err(Error::new(
            ErrorKind::SessionClosed,
            "session closed before the script result was transformed",
        )
        .with_session(scope.transaction_id(), scope.script_output()));
    }
    transform(scope, value).map_err(|e| scope.classify(Failure::Engine(e)))
}
