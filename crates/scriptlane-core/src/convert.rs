//! Classification of host and guest failures into [`Error`].
//!
//! Every failure observed at an evaluation or settlement boundary goes through
//! [`classify`], which never fails itself: if inspecting the raw failure
//! raises, the result is an [`ErrorKind::Conversion`] error instead.

use rquickjs::convert::Coerced;
use rquickjs::{Object, Value};

use crate::error::{Error, ErrorKind};
use crate::session::ScriptScope;

/// Raw failure awaiting classification.
pub enum Failure<'js> {
    /// Already classified; passed through unchanged.
    Converted(Error),
    /// Raised by host-side code.
    Host(anyhow::Error),
    /// A value the guest threw or rejected with.
    Guest(Value<'js>),
    /// Error reported by the engine. `Exception` means the thrown value is
    /// pending on the context and is taken from there.
    Engine(rquickjs::Error),
}

impl std::fmt::Debug for Failure<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converted(e) => f.debug_tuple("Converted").field(e).finish(),
            Self::Host(e) => f.debug_tuple("Host").field(e).finish(),
            Self::Guest(_) => f.write_str("Guest(..)"),
            Self::Engine(e) => f.debug_tuple("Engine").field(e).finish(),
        }
    }
}

/// Classify `failure` and attach the session's transaction id and captured
/// output.
pub fn classify<'js>(scope: &ScriptScope<'js>, failure: Failure<'js>) -> Error {
    let error = match failure {
        Failure::Converted(error) => error,
        Failure::Host(error) => Error::new(ErrorKind::Host, format!("{error:#}")),
        Failure::Guest(value) => classify_value(scope, value),
        Failure::Engine(rquickjs::Error::Exception) => {
            let value = scope.ctx().catch();
            classify_value(scope, value)
        }
        Failure::Engine(error) => Error::new(ErrorKind::Host, error.to_string()),
    };
    error.with_session(scope.transaction_id(), scope.script_output())
}

fn classify_value<'js>(scope: &ScriptScope<'js>, value: Value<'js>) -> Error {
    match inspect(scope, value) {
        Ok(error) => error,
        Err(e) => {
            if matches!(e, rquickjs::Error::Exception) {
                // Leave no exception pending on the context
                let _ = scope.ctx().catch();
            }
            Error::new(ErrorKind::Conversion, format!("failed to convert script error: {e}"))
        }
    }
}

fn inspect<'js>(scope: &ScriptScope<'js>, value: Value<'js>) -> rquickjs::Result<Error> {
    if let Some(object) = value.as_object() {
        if let Some(error) = host_failure(scope, object)? {
            return Ok(error);
        }

        if value.is_error() {
            let name = text_member(object, "name")?.unwrap_or_else(|| "Error".to_string());
            let message = text_member(object, "message")?.unwrap_or_default();
            let stack = text_member(object, "stack")?;

            let kind = if name == "SyntaxError" {
                ErrorKind::Syntax
            } else {
                ErrorKind::Guest
            };
            let text = if message.is_empty() {
                name
            } else {
                format!("{name}: {message}")
            };
            return Ok(Error::new(kind, text).with_guest_stack(stack));
        }

        if object.contains_key("stack")? {
            let stack = text_member(object, "stack")?;
            let message = match text_member(object, "message")? {
                Some(message) => message,
                None => value.get::<Coerced<String>>()?.0,
            };
            return Ok(Error::new(ErrorKind::Guest, message).with_guest_stack(stack));
        }
    }

    let text = value.get::<Coerced<String>>()?.0;
    Ok(Error::new(
        ErrorKind::Unknown,
        format!("unknown script error: {text}"),
    ))
}

/// Recover an error converted earlier and thrown back into the guest.
///
/// A message the script rewrote before rethrowing replaces the original one.
fn host_failure<'js>(scope: &ScriptScope<'js>, object: &Object<'js>) -> rquickjs::Result<Option<Error>> {
    let Some(error) = scope.state().host_failure(scope.ctx(), object)? else {
        return Ok(None);
    };
    match text_member(object, "message")? {
        Some(message) if message != error.message() => Ok(Some(error.with_message(message))),
        _ => Ok(Some(error)),
    }
}

fn text_member<'js>(object: &Object<'js>, key: &str) -> rquickjs::Result<Option<String>> {
    let member: Option<Coerced<String>> = object.get(key)?;
    Ok(member.map(|c| c.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_scope;

    fn classify_source(source: &'static str) -> Error {
        with_scope(move |scope| {
            let err = scope.eval::<Value>(source).unwrap_err();
            scope.classify(Failure::Engine(err))
        })
    }

    #[test]
    fn test_syntax_error() {
        let err = classify_source("function (");
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.message().starts_with("SyntaxError"), "{}", err.message());
    }

    #[test]
    fn test_reference_error_keeps_stack() {
        let err = classify_source("function lookup() { return company.name; }\nlookup()");
        assert_eq!(err.kind(), ErrorKind::Guest);
        assert_eq!(err.message(), "ReferenceError: company is not defined");
        assert!(err.guest_stack().unwrap().contains("lookup"));
        assert!(err.transaction_id().is_some());
    }

    #[test]
    fn test_stack_bearing_object() {
        let err = classify_source(r#"throw { message: "custom failure", stack: "at somewhere" }"#);
        assert_eq!(err.kind(), ErrorKind::Guest);
        assert_eq!(err.message(), "custom failure");
        assert_eq!(err.guest_stack(), Some("at somewhere"));
    }

    #[test]
    fn test_plain_value_is_unknown() {
        let err = classify_source("throw 42");
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.message(), "unknown script error: 42");
    }

    #[test]
    fn test_host_failure_and_passthrough() {
        with_scope(|scope| {
            let err = scope.classify(Failure::Host(anyhow::anyhow!("404 NOT FOUND")));
            assert_eq!(err.kind(), ErrorKind::Host);
            assert_eq!(err.message(), "404 NOT FOUND");

            let original = Error::new(ErrorKind::Host, "already converted").with_operation("get /x");
            let passed = scope.classify(Failure::Converted(original));
            assert_eq!(passed.message(), "already converted");
            assert_eq!(passed.operation(), Some("get /x"));
        });
    }

    #[test]
    fn test_thrown_host_error_is_recognized() {
        with_scope(|scope| {
            let handle = scope.handle();
            let fail = rquickjs::Function::new(
                scope.ctx().clone(),
                move |ctx: rquickjs::Ctx<'_>| -> rquickjs::Result<()> {
                    Err(handle.enter(ctx).throw_host_error(anyhow::anyhow!("404 NOT FOUND")))
                },
            )
            .unwrap();
            scope.globals().set("fail", fail).unwrap();

            let err = scope.eval::<Value>("fail()").unwrap_err();
            let err = scope.classify(Failure::Engine(err));
            assert_eq!(err.kind(), ErrorKind::Host);
            assert_eq!(err.message(), "404 NOT FOUND");
        });
    }

    fn install_fail<'js>(scope: &ScriptScope<'js>) {
        let handle = scope.handle();
        let fail = rquickjs::Function::new(
            scope.ctx().clone(),
            move |ctx: rquickjs::Ctx<'js>| -> rquickjs::Result<()> {
                Err(handle.enter(ctx).throw_host_error(anyhow::anyhow!("connection reset")))
            },
        )
        .unwrap();
        scope.globals().set("fail", fail).unwrap();
    }

    #[test]
    fn test_look_alike_object_is_a_guest_error() {
        with_scope(|scope| {
            install_fail(&scope);
            let source = r#"
                let tag;
                try { fail(); } catch (e) { tag = Object.keys(e); }
                throw { hostFailureId: 1, message: "script's own failure", stack: "at mine", tag };
            "#;
            let err = scope.eval::<Value>(source).unwrap_err();
            let err = scope.classify(Failure::Engine(err));
            assert_eq!(err.kind(), ErrorKind::Guest);
            assert_eq!(err.message(), "script's own failure");
            assert_eq!(err.guest_stack(), Some("at mine"));
        });
    }

    #[test]
    fn test_copied_host_error_is_a_guest_error() {
        with_scope(|scope| {
            install_fail(&scope);
            let source = r#"
                try { fail(); } catch (e) { throw Object.assign(new Error(e.message), e); }
            "#;
            let err = scope.eval::<Value>(source).unwrap_err();
            let err = scope.classify(Failure::Engine(err));
            assert_eq!(err.kind(), ErrorKind::Guest);
            assert_eq!(err.message(), "Error: connection reset");
        });
    }

    #[test]
    fn test_rethrown_host_error_keeps_script_message() {
        with_scope(|scope| {
            install_fail(&scope);
            let source = r#"
                try { fail(); } catch (e) { e.message = "wrapped by script: " + e.message; throw e; }
            "#;
            let err = scope.eval::<Value>(source).unwrap_err();
            let err = scope.classify(Failure::Engine(err));
            assert_eq!(err.kind(), ErrorKind::Host);
            assert_eq!(err.message(), "wrapped by script: connection reset");
        });
    }

    #[test]
    fn test_no_exception_left_pending() {
        with_scope(|scope| {
            let err = scope.eval::<Value>("null.field").unwrap_err();
            scope.classify(Failure::Engine(err));
            let value: i32 = scope.eval("1 + 1").unwrap();
            assert_eq!(value, 2);
        });
    }
}
