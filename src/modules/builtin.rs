/// Built-in utility modules
///
/// A small set of modules that ship with the engine so a self-hosted deployment can run
/// useful workflows without the integration catalogue:
/// - `utility.http.request`: outbound HTTP call with reqwest
/// - `utility.code.lua`: sandboxed Lua script over the step input
/// - `data.json.query`: JSONPath selection
/// - `utility.core.echo`: returns its inputs

use async_trait::async_trait;
use mlua::LuaSerdeExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Module, ModuleDescriptor, ModuleError, ModuleRegistry};

pub fn register_all(registry: &mut ModuleRegistry) {
    registry.register(Arc::new(HttpRequestModule::new()));
    registry.register(Arc::new(LuaScriptModule::new()));
    registry.register(Arc::new(JsonQueryModule::new()));
    registry.register(Arc::new(EchoModule::new()));
}

/// `utility.http.request`
///
/// Inputs: { "url", "method"?, "headers"?, "body"?, "timeoutMs"? }
/// Output: { "status", "headers", "data" }
pub struct HttpRequestModule {
    descriptor: ModuleDescriptor,
    client: reqwest::Client,
}

impl HttpRequestModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new("utility.http.request")
                .required(&["url"])
                .credential_field("bearerToken"),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for HttpRequestModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError> {
        let url = inputs
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| ModuleError::InvalidInput("'url' must be a string".into()))?;
        let method = inputs.get("method").and_then(|m| m.as_str()).unwrap_or("GET");

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            other => return Err(ModuleError::InvalidInput(format!("unsupported HTTP method: {}", other))),
        };

        if let Some(headers) = inputs.get("headers").and_then(|h| h.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        if let Some(token) = inputs.get("bearerToken").and_then(|t| t.as_str()) {
            request = request.bearer_auth(token);
        }
        match inputs.get("body") {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(body) if !body.is_null() => request = request.json(body),
            _ => {}
        }
        let timeout_ms = inputs.get("timeoutMs").and_then(|t| t.as_u64()).unwrap_or(30_000);
        request = request.timeout(Duration::from_millis(timeout_ms));

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ModuleError::Timeout(e.to_string())
            } else {
                ModuleError::Failed(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| ModuleError::Timeout(format!("failed to read response body: {}", e)))?;

        if status.as_u16() == 429 {
            return Err(ModuleError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            return Err(ModuleError::Http { status: status.as_u16(), message: truncate(&text, 512) });
        }

        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        tracing::debug!("📡 HTTP {} {} -> {}", method, url, status);
        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
        }))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// `utility.code.lua`
///
/// Inputs: { "script", "input"? }. The script sees `input` as a global and its return
/// value becomes the step output. `os`, `io`, `debug` and `package` are removed.
pub struct LuaScriptModule {
    descriptor: ModuleDescriptor,
}

impl LuaScriptModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new("utility.code.lua").required(&["script"]),
        }
    }
}

impl Default for LuaScriptModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for LuaScriptModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError> {
        let script = inputs
            .get("script")
            .and_then(|s| s.as_str())
            .ok_or_else(|| ModuleError::InvalidInput("'script' must be a string".into()))?
            .to_string();
        let input = inputs.get("input").cloned().unwrap_or(Value::Null);

        tokio::task::spawn_blocking(move || run_lua(&script, &input))
            .await
            .map_err(|e| ModuleError::Failed(format!("Lua task aborted: {}", e)))?
    }
}

fn run_lua(script: &str, input: &Value) -> Result<Value, ModuleError> {
    let lua = mlua::Lua::new();
    let globals = lua.globals();

    for name in ["os", "io", "debug", "package", "dofile", "loadfile", "require"] {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| ModuleError::Failed(format!("Lua sandbox setup failed: {}", e)))?;
    }

    let lua_input = lua
        .to_value(input)
        .map_err(|e| ModuleError::InvalidInput(format!("input not representable in Lua: {}", e)))?;
    globals
        .set("input", lua_input)
        .map_err(|e| ModuleError::Failed(format!("Lua setup failed: {}", e)))?;

    let result: mlua::Value = lua
        .load(script)
        .eval()
        .map_err(|e| ModuleError::Failed(format!("Lua script execution failed: {}", e)))?;

    lua.from_value(result)
        .map_err(|e| ModuleError::Failed(format!("Lua result not representable as JSON: {}", e)))
}

/// `data.json.query`
///
/// Inputs: { "data", "path" }. Output: array of matches.
pub struct JsonQueryModule {
    descriptor: ModuleDescriptor,
}

impl JsonQueryModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new("data.json.query").required(&["data", "path"]),
        }
    }
}

impl Default for JsonQueryModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for JsonQueryModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError> {
        let path = inputs
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| ModuleError::InvalidInput("'path' must be a string".into()))?;
        let data = inputs.get("data").unwrap_or(&Value::Null);

        let matches = jsonpath_lib::select(data, path)
            .map_err(|e| ModuleError::InvalidInput(format!("invalid JSONPath '{}': {:?}", path, e)))?;
        Ok(Value::Array(matches.into_iter().cloned().collect()))
    }
}

/// `utility.core.echo`
pub struct EchoModule {
    descriptor: ModuleDescriptor,
}

impl EchoModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new("utility.core.echo"),
        }
    }
}

impl Default for EchoModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for EchoModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError> {
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = ModuleRegistry::with_builtins();
        assert_eq!(
            registry.references(),
            vec!["data.json.query", "utility.code.lua", "utility.core.echo", "utility.http.request"]
        );
        assert_eq!(
            registry.resolve("utility.http.request").unwrap().descriptor().required_inputs,
            vec!["url".to_string()]
        );
    }

    #[tokio::test]
    async fn lua_script_sees_input_and_returns_json() {
        let module = LuaScriptModule::new();
        let output = module
            .invoke(json!({
                "script": "return { total = input.a + input.b, tag = 'sum' }",
                "input": { "a": 2, "b": 3 }
            }))
            .await
            .unwrap();
        assert_eq!(output["total"], json!(5));
        assert_eq!(output["tag"], json!("sum"));
    }

    #[tokio::test]
    async fn lua_sandbox_hides_os() {
        let module = LuaScriptModule::new();
        let output = module.invoke(json!({ "script": "return os == nil" })).await.unwrap();
        assert_eq!(output, json!(true));
    }

    #[tokio::test]
    async fn lua_errors_are_module_failures() {
        let module = LuaScriptModule::new();
        let err = module.invoke(json!({ "script": "error('boom')" })).await.unwrap_err();
        assert!(matches!(err, ModuleError::Failed(_)));
    }

    #[tokio::test]
    async fn json_query_selects_matches() {
        let module = JsonQueryModule::new();
        let output = module
            .invoke(json!({
                "data": { "orders": [ { "id": 1, "total": 10 }, { "id": 2, "total": 25 } ] },
                "path": "$.orders[*].id"
            }))
            .await
            .unwrap();
        assert_eq!(output, json!([1, 2]));
    }

    #[tokio::test]
    async fn http_request_rejects_unknown_method() {
        let module = HttpRequestModule::new();
        let err = module
            .invoke(json!({ "url": "http://localhost", "method": "BREW" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidInput(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
