use anyhow::anyhow;
use wasm_bindgen::{JsCast, JsValue};

/// Converts the JsValue-flavored results of web_sys calls into anyhow errors
/// carrying a step description, so failures name the operation that broke.
pub trait Require<T> {
    fn require(self, err: &'static str) -> anyhow::Result<T>;
}

impl<T> Require<T> for Result<T, JsValue> {
    fn require(self, err: &'static str) -> anyhow::Result<T> {
        self.map_err(|e| anyhow!("{} - {}", err, extract_message(e)))
    }
}

impl<T> Require<T> for Option<T> {
    fn require(self, err: &'static str) -> anyhow::Result<T> { self.ok_or_else(|| anyhow!("{} is None", err)) }
}

impl<T> Require<T> for Result<T, web_sys::Event> {
    fn require(self, err: &'static str) -> anyhow::Result<T> {
        self.map_err(|e| {
            if let Some(target) = e.target() {
                if let Ok(request) = target.dyn_into::<web_sys::IdbRequest>() {
                    if let Ok(Some(exception)) = request.error() {
                        return anyhow!("{}: {} (code: {})", err, exception.message(), exception.code());
                    }
                }
            }
            anyhow!("{}: event {}", err, e.type_())
        })
    }
}

fn extract_message(err: JsValue) -> String {
    if let Some(e) = err.dyn_ref::<js_sys::Error>() {
        return format!("{}: {}", e.name(), e.message());
    }
    if let Some(s) = err.as_string() {
        return s;
    }
    js_sys::JSON::stringify(&err).ok().and_then(|s| s.as_string()).unwrap_or_else(|| format!("{:?}", err))
}

/// True when a failed request carries a DomException with the given name
/// (e.g. "ConstraintError" for unique violations, "VersionError").
pub fn event_error_named(event: &web_sys::Event, name: &str) -> bool {
    event
        .target()
        .and_then(|t| t.dyn_into::<web_sys::IdbRequest>().ok())
        .and_then(|r| r.error().ok().flatten())
        .map(|e| e.name() == name)
        .unwrap_or(false)
}
