//! Conversions between guest values and host data.

use rquickjs::convert::Coerced;
use rquickjs::function::Constructor;
use rquickjs::{Array, Ctx, FromJs, Function, IntoJs, Object, Value};

/// JSON data crossing the guest boundary.
///
/// Converts to plain guest objects and arrays, and back. Functions and
/// symbols read back as `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Json(pub serde_json::Value);

impl From<serde_json::Value> for Json {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl<'js> IntoJs<'js> for Json {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        json_to_js(ctx, &self.0)
    }
}

impl<'js> FromJs<'js> for Json {
    fn from_js(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        js_to_json(ctx, value).map(Self)
    }
}

fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => {
            let small = n.as_i64().and_then(|i| i32::try_from(i).ok());
            match (small, n.as_f64()) {
                (Some(i), _) => Ok(Value::new_int(ctx.clone(), i)),
                (None, Some(f)) => Ok(Value::new_float(ctx.clone(), f)),
                (None, None) => Ok(Value::new_null(ctx.clone())),
            }
        }
        serde_json::Value::String(s) => s.as_str().into_js(ctx),
        serde_json::Value::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(array.into_value())
        }
        serde_json::Value::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            Ok(object.into_value())
        }
    }
}

fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value<'js>>() {
            items.push(js_to_json(ctx, item?)?);
        }
        return Ok(serde_json::Value::Array(items));
    }
    if value.is_function() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(object) = value.as_object() {
        let mut map = serde_json::Map::new();
        for entry in object.props::<String, Value<'js>>() {
            let (key, item) = entry?;
            map.insert(key, js_to_json(ctx, item)?);
        }
        return Ok(serde_json::Value::Object(map));
    }
    Ok(serde_json::Value::Null)
}

/// Read `name` from the global object.
pub fn global_member<'js, T: FromJs<'js>>(ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<T> {
    ctx.globals().get(name)
}

/// `JSON.stringify(value)` as a host string.
///
/// Returns `None` for values JSON cannot represent, such as `undefined` or a
/// function.
pub fn stringify_to_string<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Option<String>> {
    let json: Object = global_member(ctx, "JSON")?;
    let stringify: Function = json.get("stringify")?;
    stringify.call((value,))
}

/// `JSON.parse(text)` inside the guest.
pub fn parse_json<'js>(ctx: &Ctx<'js>, text: &str) -> rquickjs::Result<Value<'js>> {
    let json: Object = global_member(ctx, "JSON")?;
    let parse: Function = json.get("parse")?;
    parse.call((text,))
}

/// Snapshot of the current guest call stack.
pub fn current_stack(ctx: &Ctx<'_>) -> Option<String> {
    let constructor: Constructor = global_member(ctx, "Error").ok()?;
    let marker: Object = constructor.construct(()).ok()?;
    marker
        .get::<_, Option<String>>("stack")
        .ok()
        .flatten()
        .filter(|stack| !stack.trim().is_empty())
}

/// Render one `console.*` argument: strings verbatim, errors and functions
/// through `toString`, other objects as JSON.
pub(crate) fn render_console_arg<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<String> {
    if let Some(s) = value.as_string() {
        return s.to_string();
    }
    if value.is_object() && !value.is_error() && !value.is_function() {
        if let Some(text) = stringify_to_string(ctx, value.clone())? {
            return Ok(text);
        }
    }
    Ok(value.get::<Coerced<String>>()?.0)
}
