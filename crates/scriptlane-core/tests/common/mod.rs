//! Shared bindings and handlers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use rquickjs::{Ctx, Function, Object, Promise, Value};
use scriptlane_core::{Json, ScriptHandler, ScriptScope, Session, SessionStatus, SourceHandler};

pub const COMPANY_INFO: &str = include_str!("../json/company-info.json");
pub const CEO_LIST: &str = include_str!("../json/ceo-list.json");

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parse a JSON fixture.
pub fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}

/// Install `timeout.ms(delay, value)`, resolving to `value` after `delay` ms.
pub fn install_timeout<'js>(scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
    let handle = scope.handle();
    let ms = Function::new(
        scope.ctx().clone(),
        move |ctx: Ctx<'js>, delay: u32, value: String| -> rquickjs::Result<Promise<'js>> {
            handle.enter(ctx).bridge().promise(format!("timeout {delay}ms"), async move {
                tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
                Ok(value)
            })
        },
    )?;

    let timeout = Object::new(scope.ctx().clone())?;
    timeout.set("ms", ms)?;
    scope.globals().set("timeout", timeout)
}

#[derive(Clone)]
enum MockedResponse {
    Ok { status: u16, data: String, delay: Duration },
    Fail { message: String, delay: Duration },
}

/// HTTP client double exposed to scripts as `client.get(url)`.
///
/// Known URLs resolve to `{ status, data }` after their delay; an unknown URL
/// makes `get` throw "404 NOT FOUND" synchronously.
#[derive(Clone, Default)]
pub struct MockedHttpClient {
    responses: Arc<Mutex<HashMap<String, MockedResponse>>>,
}

impl MockedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, url: &str, status: u16, data: &str, delay_ms: u64) -> &Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            MockedResponse::Ok {
                status,
                data: data.to_string(),
                delay: Duration::from_millis(delay_ms),
            },
        );
        self
    }

    /// Make `url` fail asynchronously with `message`.
    pub fn add_failure(&self, url: &str, message: &str, delay_ms: u64) -> &Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            MockedResponse::Fail {
                message: message.to_string(),
                delay: Duration::from_millis(delay_ms),
            },
        );
        self
    }

    pub fn install<'js>(&self, scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
        let handle = scope.handle();
        let responses = Arc::clone(&self.responses);
        let get = Function::new(
            scope.ctx().clone(),
            move |ctx: Ctx<'js>, url: String| -> rquickjs::Result<Promise<'js>> {
                let scope = handle.enter(ctx);
                let Some(response) = responses.lock().unwrap().get(&url).cloned() else {
                    return Err(scope.throw_host_error(anyhow!("404 NOT FOUND")));
                };

                tracing::trace!("Request {} started", url);
                scope.bridge().promise(format!("get {url}"), async move {
                    match response {
                        MockedResponse::Ok { status, data, delay } => {
                            tokio::time::sleep(delay).await;
                            tracing::trace!("Request {} finished", url);
                            Ok(Json(serde_json::json!({ "status": status, "data": data })))
                        }
                        MockedResponse::Fail { message, delay } => {
                            tokio::time::sleep(delay).await;
                            Err(anyhow!(message))
                        }
                    }
                })
            },
        )?;

        let client = Object::new(scope.ctx().clone())?;
        client.set("get", get)?;
        scope.globals().set("client", client)
    }
}

/// What a [`TestScriptHandler`] saw while running.
#[derive(Default)]
pub struct Observed {
    pub session: Option<Arc<Session>>,
    pub lane_thread: Option<String>,
    pub transform_status: Option<SessionStatus>,
}

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Observed>>);

impl Recorder {
    pub fn session(&self) -> Arc<Session> {
        self.0
            .lock()
            .unwrap()
            .session
            .clone()
            .expect("handler never initiated a context")
    }

    pub fn lane_thread(&self) -> Option<String> {
        self.0.lock().unwrap().lane_thread.clone()
    }

    pub fn transform_status(&self) -> Option<SessionStatus> {
        self.0.lock().unwrap().transform_status
    }
}

/// Handler with the `timeout` binding and, optionally, the mocked client.
pub struct TestScriptHandler {
    inner: SourceHandler,
    client: Option<MockedHttpClient>,
    recorder: Recorder,
}

impl TestScriptHandler {
    pub fn new(source: &str, client: Option<MockedHttpClient>) -> Self {
        Self {
            inner: SourceHandler::new(source),
            client,
            recorder: Recorder::default(),
        }
    }

    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }
}

impl ScriptHandler for TestScriptHandler {
    type Output = String;

    fn initiate_context<'js>(&self, scope: &ScriptScope<'js>) -> rquickjs::Result<()> {
        {
            let mut observed = self.recorder.0.lock().unwrap();
            observed.session = Some(Arc::clone(scope.session()));
            observed.lane_thread = std::thread::current().name().map(str::to_string);
        }
        install_timeout(scope)?;
        if let Some(client) = &self.client {
            client.install(scope)?;
        }
        self.inner.initiate_context(scope)
    }

    fn evaluate_script<'js>(&self, scope: &ScriptScope<'js>) -> rquickjs::Result<Value<'js>> {
        self.inner.evaluate_script(scope)
    }

    fn transform_script_response<'js>(
        &self,
        scope: &ScriptScope<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<String> {
        self.recorder.0.lock().unwrap().transform_status = Some(scope.session().status());
        self.inner.transform_script_response(scope, value)
    }
}

/// Wait until `session` reaches `Closed`.
pub async fn wait_closed(session: &Session) {
    for _ in 0..500 {
        if session.status() == SessionStatus::Closed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never closed", session.transaction_id());
}
