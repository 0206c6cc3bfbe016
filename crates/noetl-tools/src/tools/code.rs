//! In-process code task plugin.
//!
//! Executes a script body in an embedded rhai engine. The body must define a
//! `main` function; dispatch follows its signature: `main()` for no
//! parameters, a single parameter receives the whole args mapping, and named
//! parameters are looked up individually. Literal-looking strings in args
//! coerce to native values before dispatch.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::registry::{Tool, ToolConfig};
use crate::result::ToolResult;
use crate::template::TemplateEngine;

/// In-process code plugin, registered under the `python` tool identifier.
pub struct CodeTool {
    template: TemplateEngine,
}

impl CodeTool {
    pub fn new() -> Self {
        Self {
            template: TemplateEngine::new(),
        }
    }

    /// Decode a code body that may be base64-encoded.
    pub fn decode_code(raw: &str) -> String {
        if let Ok(bytes) = BASE64.decode(raw.trim().as_bytes()) {
            if let Ok(text) = String::from_utf8(bytes) {
                if text.contains("fn main") || text.contains('\n') {
                    return text;
                }
            }
        }
        raw.to_string()
    }

    /// Run a script body with the given args on a blocking thread.
    pub async fn run_code(
        code: String,
        args: serde_json::Map<String, Value>,
    ) -> Result<Value, ToolError> {
        tokio::task::spawn_blocking(move || execute_script(&code, &args))
            .await
            .map_err(|e| ToolError::Script(format!("script task join error: {}", e)))?
    }
}

impl Default for CodeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CodeTool {
    fn name(&self) -> &'static str {
        "python"
    }

    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();
        let template_ctx = ctx.to_template_context();

        let raw_code = config
            .field("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Configuration("code task requires a 'code' body".to_string()))?;
        let code = Self::decode_code(raw_code);

        // Without an explicit args block the script sees the context itself,
        // so loop bodies can reach their element directly.
        let args_value = config
            .field("args")
            .cloned()
            .unwrap_or_else(|| ctx.sanitized_snapshot());
        let rendered = self.template.render_value(&args_value, &template_ctx)?;

        let args = match rendered {
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, coerce_literal(v)))
                .collect(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input_data".to_string(), other);
                map
            }
        };

        let data = Self::run_code(code, args).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok(ToolResult::success(data).with_duration(duration_ms))
    }
}

/// Compile and dispatch `main` according to its parameter list.
fn execute_script(code: &str, args: &serde_json::Map<String, Value>) -> Result<Value, ToolError> {
    let engine = build_engine();

    let ast: AST = engine
        .compile(code)
        .map_err(|e| ToolError::Script(format!("compile error: {}", e)))?;

    let params = main_params(&ast).ok_or_else(|| {
        ToolError::Script("code body must define a 'main' function".to_string())
    })?;

    let call_args: Vec<Dynamic> = if params.is_empty() {
        Vec::new()
    } else if params.len() == 1 {
        // single parameter receives the whole args mapping
        vec![json_to_dynamic(&Value::Object(args.clone()))]
    } else {
        params
            .iter()
            .map(|name| {
                args.get(name)
                    .map(json_to_dynamic)
                    .unwrap_or(Dynamic::UNIT)
            })
            .collect()
    };

    let mut scope = Scope::new();
    let result: Dynamic = engine
        .call_fn(&mut scope, &ast, "main", call_args)
        .map_err(|e| ToolError::Script(format!("main() failed: {}", e)))?;

    Ok(dynamic_to_json(&result))
}

/// Parameter names of the script's `main` function, if defined.
fn main_params(ast: &AST) -> Option<Vec<String>> {
    ast.iter_functions()
        .find(|f| f.name == "main")
        .map(|f| f.params.iter().map(|p| p.to_string()).collect())
}

/// Build the script engine with utility functions registered.
fn build_engine() -> Engine {
    let mut engine = Engine::new();

    engine.register_fn("log", |msg: &str| {
        tracing::info!(target: "code", "{}", msg);
    });
    engine.register_fn("debug", |msg: &str| {
        tracing::debug!(target: "code", "{}", msg);
    });
    engine.register_fn("warn", |msg: &str| {
        tracing::warn!(target: "code", "{}", msg);
    });

    engine.register_fn("timestamp", || chrono::Utc::now().timestamp().to_string());

    engine.register_fn("parse_json", |s: &str| -> Dynamic {
        match serde_json::from_str::<Value>(s) {
            Ok(v) => json_to_dynamic(&v),
            Err(_) => Dynamic::UNIT,
        }
    });

    engine.register_fn("to_json", |val: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(&val)).unwrap_or_else(|_| "null".to_string())
    });

    engine
}

/// Coerce literal-looking strings into native values.
fn coerce_literal(value: Value) -> Value {
    let Value::String(ref s) = value else {
        return value;
    };
    let trimmed = s.trim();

    if let Ok(b) = trimmed.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    value
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => {
            let items: rhai::Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(items)
        }
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (k, v) in map {
                out.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(out)
        }
    }
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return serde_json::json!(b);
    }
    if let Ok(i) = value.as_int() {
        return serde_json::json!(i);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::json!(f);
    }
    if value.is_string() {
        return serde_json::json!(value.clone().into_string().unwrap_or_default());
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        return Value::Array(arr.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut out = serde_json::Map::new();
        for (k, v) in &map {
            out.insert(k.to_string(), dynamic_to_json(v));
        }
        return Value::Object(out);
    }
    serde_json::json!(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_main_no_args() {
        let code = r#"fn main() { #{"status": "ok"} }"#;
        let result = CodeTool::run_code(code.to_string(), serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(result["status"], serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn test_main_single_param_receives_args() {
        let code = r#"fn main(input_data) { input_data.count + 1 }"#;
        let mut args = serde_json::Map::new();
        args.insert("count".to_string(), serde_json::json!(41));

        let result = CodeTool::run_code(code.to_string(), args).await.unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_main_named_params() {
        let code = r#"fn main(a, b) { a * b }"#;
        let mut args = serde_json::Map::new();
        args.insert("a".to_string(), serde_json::json!(6));
        args.insert("b".to_string(), serde_json::json!(7));

        let result = CodeTool::run_code(code.to_string(), args).await.unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_missing_main_is_error() {
        let code = "let x = 1;";
        let result = CodeTool::run_code(code.to_string(), serde_json::Map::new()).await;
        assert!(matches!(result, Err(ToolError::Script(_))));
    }

    #[tokio::test]
    async fn test_execute_with_base64_and_templates() {
        let tool = CodeTool::new();
        let code = BASE64.encode("fn main(value, offset) { value * 2 + offset }\n");
        let config = ToolConfig::new(
            "python",
            serde_json::json!({"code": code, "args": {"value": "{{ seed }}", "offset": "0"}}),
        );
        let mut ctx = ExecutionContext::default();
        ctx.set("seed", serde_json::json!(21));

        let result = tool.execute(&config, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.data.unwrap(), serde_json::json!(42));
    }

    #[test]
    fn test_coerce_literal() {
        assert_eq!(coerce_literal(serde_json::json!("42")), serde_json::json!(42));
        assert_eq!(coerce_literal(serde_json::json!("4.5")), serde_json::json!(4.5));
        assert_eq!(coerce_literal(serde_json::json!("true")), serde_json::json!(true));
        assert_eq!(
            coerce_literal(serde_json::json!("[1, 2]")),
            serde_json::json!([1, 2])
        );
        assert_eq!(
            coerce_literal(serde_json::json!("plain")),
            serde_json::json!("plain")
        );
    }

    #[test]
    fn test_decode_code() {
        let encoded = BASE64.encode("fn main() { 1 }");
        assert_eq!(CodeTool::decode_code(&encoded), "fn main() { 1 }");
        assert_eq!(CodeTool::decode_code("fn main() { 2 }"), "fn main() { 2 }");
    }

    #[test]
    fn test_dynamic_json_roundtrip() {
        let value = serde_json::json!({"a": [1, 2.5, "x", true, null], "b": {"c": 1}});
        let roundtripped = dynamic_to_json(&json_to_dynamic(&value));
        assert_eq!(roundtripped, value);
    }
}
