//! Configuration for the executor, the shared engine and per-session contexts.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings applied when building one guest context.
///
/// A [`ScriptHandler`](crate::ScriptHandler) receives a copy of the engine
/// defaults in `initiate_context_builder` and may adjust it before the context
/// is constructed.
///
/// There is no time-zone setting: QuickJS resolves `Date` local time from the
/// process environment (`TZ`), not per context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Heap limit for the guest runtime, in bytes.
    pub memory_limit: Option<usize>,
    /// Maximum guest stack size, in bytes.
    pub max_stack_size: Option<usize>,
    /// Allocation threshold that triggers a guest GC cycle, in bytes.
    pub gc_threshold: Option<usize>,
    /// Install a `console` object whose output is captured by the session.
    pub capture_console: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            capture_console: true,
        }
    }
}

impl ContextConfig {
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_console_capture(mut self, enabled: bool) -> Self {
        self.capture_console = enabled;
        self
    }
}

/// Process-wide guest engine settings.
///
/// Built once when the executor starts and shared read-only by every lane and
/// session. It is handed to lanes explicitly rather than looked up globally.
#[derive(Debug, Default)]
pub struct Engine {
    defaults: ContextConfig,
}

impl Engine {
    /// Create an engine with the given context defaults.
    pub fn new(defaults: ContextConfig) -> Arc<Self> {
        Arc::new(Self { defaults })
    }

    /// Context settings each session starts from.
    pub fn context_defaults(&self) -> &ContextConfig {
        &self.defaults
    }

    /// Create a guest runtime configured per `config`.
    pub(crate) fn create_runtime(&self, config: &ContextConfig) -> rquickjs::Result<rquickjs::Runtime> {
        let runtime = rquickjs::Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        Ok(runtime)
    }
}

/// Serializable executor configuration.
///
/// Every field is optional; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Number of lanes. Defaults to the available hardware parallelism.
    pub lanes: Option<usize>,
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
    pub gc_threshold: Option<usize>,
    pub capture_console: Option<bool>,
}

impl ExecutorConfig {
    /// Environment variable prefix read by [`from_env`](Self::from_env).
    pub const ENV_PREFIX: &'static str = "SCRIPTLANE_";

    /// Read configuration from `SCRIPTLANE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a full variable name
    /// (e.g. `SCRIPTLANE_LANES`) to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |name: &str| -> Result<Option<usize>> {
            let key = format!("{}{}", Self::ENV_PREFIX, name);
            match lookup(&key) {
                Some(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|e| Error::config(format!("invalid value for {key}: {raw:?} ({e})"))),
                None => Ok(None),
            }
        };

        let capture_console = match lookup(&format!("{}CAPTURE_CONSOLE", Self::ENV_PREFIX)) {
            Some(raw) => Some(match raw.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(Error::config(format!(
                        "invalid value for {}CAPTURE_CONSOLE: {other:?}",
                        Self::ENV_PREFIX
                    )));
                }
            }),
            None => None,
        };

        Ok(Self {
            lanes: read("LANES")?,
            memory_limit: read("MEMORY_LIMIT")?,
            max_stack_size: read("MAX_STACK_SIZE")?,
            gc_threshold: read("GC_THRESHOLD")?,
            capture_console,
        })
    }

    /// Resolved lane count.
    pub fn lane_count(&self) -> Result<usize> {
        match self.lanes {
            Some(0) => Err(Error::config("lane count must be at least 1")),
            Some(n) => Ok(n),
            None => Ok(default_lane_count()),
        }
    }

    /// Context defaults described by this configuration.
    pub fn context_config(&self) -> ContextConfig {
        let mut config = ContextConfig::default();
        config.memory_limit = self.memory_limit;
        config.max_stack_size = self.max_stack_size;
        config.gc_threshold = self.gc_threshold;
        if let Some(capture) = self.capture_console {
            config.capture_console = capture;
        }
        config
    }
}

/// Available hardware parallelism, or 1 when it cannot be determined.
pub fn default_lane_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
