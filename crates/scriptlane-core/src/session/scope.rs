use std::rc::Rc;
use std::sync::Arc;

use rquickjs::{Ctx, FromJs, Object};

use crate::bridge::PromiseBridge;
use crate::convert;
use crate::error::{Error, ErrorKind};

use super::{GuestState, Session, TransactionId};

/// View of a session from inside its guest context.
///
/// Handed to every [`ScriptHandler`](crate::ScriptHandler) hook. Only exists
/// on the session's lane, while the context is entered.
#[derive(Clone)]
pub struct ScriptScope<'js> {
    ctx: Ctx<'js>,
    state: Rc<GuestState>,
}

impl<'js> ScriptScope<'js> {
    pub(crate) fn new(ctx: Ctx<'js>, state: Rc<GuestState>) -> Self {
        Self { ctx, state }
    }

    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub fn globals(&self) -> Object<'js> {
        self.ctx.globals()
    }

    pub fn session(&self) -> &Arc<Session> {
        self.state.session()
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.state.session().transaction_id()
    }

    /// Console output captured so far.
    pub fn script_output(&self) -> String {
        self.state.session().script_output()
    }

    /// Bridge for exposing host futures to the guest as promises.
    pub fn bridge(&self) -> PromiseBridge<'js> {
        PromiseBridge::new(self.clone())
    }

    /// Evaluate `source` as a global script.
    pub fn eval<T: FromJs<'js>>(&self, source: &str) -> rquickjs::Result<T> {
        self.ctx.eval(source)
    }

    /// Throw `error` into the guest as an exception.
    ///
    /// Return the result from a binding. If the guest does not catch it, the
    /// execution fails with a host error carrying `error`'s message.
    pub fn throw_host_error(&self, error: anyhow::Error) -> rquickjs::Error {
        self.throw_error(Error::new(ErrorKind::Host, format!("{error:#}")))
    }

    /// Throw an already classified error; the execution fails with it as is.
    pub fn throw_error(&self, error: Error) -> rquickjs::Error {
        match self.state.failure_value(&self.ctx, error) {
            Ok(value) => self.ctx.throw(value),
            Err(e) => e,
        }
    }

    /// Handle for re-entering this scope from host functions.
    pub fn handle(&self) -> ScopeHandle {
        ScopeHandle {
            state: Rc::clone(&self.state),
        }
    }

    pub(crate) fn state(&self) -> &Rc<GuestState> {
        &self.state
    }

    /// Classify a guest-side failure against this session.
    pub(crate) fn classify(&self, failure: convert::Failure<'js>) -> Error {
        convert::classify(self, failure)
    }
}

/// Lifetime-free reference to a session's guest state.
///
/// Host functions installed into the context capture this rather than the
/// scope itself, and rebuild the scope from the `Ctx` they are called with.
/// Capturing a `Ctx` in a guest function would keep the context alive past
/// teardown.
#[derive(Clone)]
pub struct ScopeHandle {
    state: Rc<GuestState>,
}

impl ScopeHandle {
    pub fn enter<'js>(&self, ctx: Ctx<'js>) -> ScriptScope<'js> {
        ScriptScope::new(ctx, Rc::clone(&self.state))
    }

    pub fn session(&self) -> &Arc<Session> {
        self.state.session()
    }
}
