//! Per-execution script handlers.

use std::sync::Arc;

use rquickjs::Value;

use crate::config::ContextConfig;
use crate::session::ScriptScope;
use crate::value::stringify_to_string;

/// Pluggable behavior of one execution.
///
/// The executor calls the hooks in order on the session's lane:
/// `initiate_context_builder`, `initiate_context`, `evaluate_script`, and,
/// once the evaluated value has settled, `transform_script_response`.
pub trait ScriptHandler: Send + 'static {
    /// Host-visible result type.
    type Output: Send + 'static;

    /// Adjust the context settings before the guest context is built.
    fn initiate_context_builder(&self, config: ContextConfig) -> ContextConfig {
        config
    }

    /// Install bindings into the fresh context before evaluation.
    fn initiate_context<'js>(&self, _scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
        Ok(())
    }

    /// Run the script. The returned value may be promise-shaped.
    fn evaluate_script<'js>(&self, scope: &ScriptScope<'js>) -> rquickjs::Result<Value<'js>>;

    /// Convert the settled value into the host result.
    fn transform_script_response<'js>(
        &self,
        scope: &ScriptScope<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<Self::Output>;
}

type Bindings = Arc<dyn for<'js> Fn(&ScriptScope<'js>) -> rquickjs::Result<()> + Send + Sync>;

/// Handler evaluating a JavaScript source and returning its result as text.
///
/// If the source evaluates to a function, the function is called and its
/// return value is the result, so a source like `(async function() { ... })`
/// works as expected. Strings are returned as is; anything else is rendered
/// with `JSON.stringify`.
#[derive(Clone)]
pub struct SourceHandler {
    source: String,
    bindings: Vec<Bindings>,
}

impl SourceHandler {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bindings: Vec::new(),
        }
    }

    /// Run `install` from `initiate_context`, e.g. to add host bindings.
    ///
    /// Bindings are easiest written as named functions generic over `'js`:
    ///
    /// ```
    /// use scriptlane_core::{ScriptScope, SourceHandler};
    ///
    /// fn install_answer<'js>(scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
    ///     scope.globals().set("answer", 42)
    /// }
    ///
    /// let handler = SourceHandler::new("answer").with_bindings(install_answer);
    /// assert_eq!(handler.source(), "answer");
    /// ```
    pub fn with_bindings<F>(mut self, install: F) -> Self
    where
        F: for<'js> Fn(&ScriptScope<'js>) -> rquickjs::Result<()> + Send + Sync + 'static,
    {
        self.bindings.push(Arc::new(install));
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for SourceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandler")
            .field("source_len", &self.source.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl ScriptHandler for SourceHandler {
    type Output = String;

    fn initiate_context<'js>(&self, scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
        for install in &self.bindings {
            install(scope)?;
        }
        Ok(())
    }

    fn evaluate_script<'js>(&self, scope: &ScriptScope<'js>) -> rquickjs::Result<Value<'js>> {
        let value: Value = scope.eval(self.source.as_str())?;
        match value.as_function() {
            Some(function) => function.call(()),
            None => Ok(value),
        }
    }

    fn transform_script_response<'js>(
        &self,
        scope: &ScriptScope<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<String> {
        if let Some(text) = value.as_string() {
            return text.to_string();
        }
        Ok(stringify_to_string(scope.ctx(), value)?.unwrap_or_else(|| "undefined".to_string()))
    }
}
