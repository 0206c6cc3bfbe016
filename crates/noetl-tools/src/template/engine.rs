//! Jinja2-style template rendering using minijinja.
//!
//! Strings containing `{{ .. }}` or `{% .. %}` render against the execution
//! context. Undefined variables raise an error in strict mode (the default).
//! A value that is exactly one `{{ expr }}` template resolves to the
//! underlying object with its type preserved; rendered strings that parse as
//! JSON arrays/objects come back parsed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, UndefinedBehavior, Value};
use std::collections::HashMap;

use crate::error::ToolError;

/// Template renderer with custom filters and strictness control.
pub struct TemplateEngine {
    env: Environment<'static>,
    strict: bool,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a strict-undefined template engine.
    pub fn new() -> Self {
        Self::with_strictness(true)
    }

    /// Create a lenient engine: rendering errors fall back to the raw
    /// template or an empty string instead of propagating.
    pub fn lenient() -> Self {
        Self::with_strictness(false)
    }

    fn with_strictness(strict: bool) -> Self {
        let mut env = Environment::new();
        if strict {
            env.set_undefined_behavior(UndefinedBehavior::Strict);
        }

        // Custom filters
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("to_json", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("d", filter_default);
        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("string", filter_string);
        env.add_filter("lower", filter_lower);
        env.add_filter("upper", filter_upper);
        env.add_filter("trim", filter_trim);
        env.add_filter("split", filter_split);
        env.add_filter("join", filter_join);
        env.add_filter("first", filter_first);
        env.add_filter("last", filter_last);
        env.add_filter("length", filter_length);
        env.add_filter("len", filter_length);
        env.add_filter("keys", filter_keys);
        env.add_filter("values", filter_values);

        // Custom tests
        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env.add_test("none", test_none);
        env.add_test("mapping", test_mapping);
        env.add_test("sequence", test_sequence);

        // Globals
        env.add_function("now", global_now);

        Self { env, strict }
    }

    /// Whether this engine runs with strict undefined behavior.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Check if a string contains Jinja2 template syntax.
    pub fn is_template(s: &str) -> bool {
        (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<String, ToolError> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }

        let ctx = context_value(context);
        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| ToolError::Template(format!("Template parse error: {}", e)))?;

        match tmpl.render(ctx) {
            Ok(rendered) => Ok(rendered),
            Err(e) if self.strict => {
                Err(ToolError::Template(format!("Template render error: {}", e)))
            }
            Err(_) => Ok(template.to_string()),
        }
    }

    /// Render a template, falling back to an empty string on error.
    ///
    /// Only meaningful on a lenient engine; a strict engine still propagates.
    pub fn render_or_empty(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<String, ToolError> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }
        let ctx = context_value(context);
        match self.env.template_from_str(template).and_then(|t| t.render(ctx)) {
            Ok(rendered) => Ok(rendered),
            Err(e) if self.strict => {
                Err(ToolError::Template(format!("Template render error: {}", e)))
            }
            Err(_) => Ok(String::new()),
        }
    }

    /// Render a template and return the result as a JSON value.
    ///
    /// A template that is exactly one `{{ expr }}` returns the resolved
    /// object with its type preserved when it is a container or not a
    /// string. Rendered strings that look like JSON are parsed; primitive
    /// renderings coerce to native booleans/numbers/null.
    pub fn render_to_value(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        if let Some(expr) = single_expression(template) {
            match self.eval_expression(expr, context) {
                Ok(Some(value)) => {
                    if !matches!(value, serde_json::Value::String(_)) {
                        return Ok(value);
                    }
                }
                Ok(None) => {
                    if self.strict {
                        return Err(ToolError::Template(format!(
                            "undefined value in expression: {}",
                            expr
                        )));
                    }
                }
                Err(e) => {
                    if self.strict {
                        return Err(e);
                    }
                }
            }
        }

        let rendered = self.render(template, context)?;
        Ok(parse_rendered(rendered))
    }

    /// Render a nested structure (mapping or sequence) recursively.
    ///
    /// Non-string leaves pass through untouched; the context is never
    /// mutated.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, context),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    let rendered_key = self.render(k, context)?;
                    result.insert(rendered_key, self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, context)).collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a condition expression to a boolean.
    ///
    /// Bare expressions are wrapped in `{{ }}` before rendering.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<bool, ToolError> {
        let template = if Self::is_template(condition) {
            condition.to_string()
        } else {
            format!("{{{{ {} }}}}", condition)
        };

        let rendered = self.render(&template, context)?;
        let trimmed = rendered.trim().to_lowercase();

        Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"))
    }

    /// Evaluate a single expression against the context.
    ///
    /// Returns `Ok(None)` when the expression resolves to undefined.
    fn eval_expression(
        &self,
        expr: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, ToolError> {
        let compiled = self
            .env
            .compile_expression(expr)
            .map_err(|e| ToolError::Template(format!("Expression parse error: {}", e)))?;

        let value = compiled
            .eval(context_value(context))
            .map_err(|e| ToolError::Template(format!("Expression eval error: {}", e)))?;

        if value.is_undefined() {
            return Ok(None);
        }

        let json = serde_json::to_value(&value)
            .map_err(|e| ToolError::Template(format!("Expression result error: {}", e)))?;
        Ok(Some(json))
    }
}

/// Extract the inner expression when the whole string is one `{{ expr }}`.
fn single_expression(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

/// Parse a rendered string into a JSON value.
fn parse_rendered(rendered: String) -> serde_json::Value {
    let trimmed = rendered.trim();

    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }

    if let Ok(b) = trimmed.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    if trimmed == "null" || trimmed == "None" {
        return serde_json::Value::Null;
    }

    serde_json::Value::String(rendered)
}

/// Convert a JSON context map to a minijinja Value.
fn context_value(context: &HashMap<String, serde_json::Value>) -> Value {
    Value::from_serialize(context)
}

// ============================================================================
// Custom Filters
// ============================================================================

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value.to_string().as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("b64decode error: {}", e))
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let s = value.to_string();
    let json: serde_json::Value = serde_json::from_str(&s).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("fromjson error: {}", e))
    })?;
    Ok(Value::from_serialize(&json))
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or_else(|| Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_int(value: &Value) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Ok(f as i64);
    }
    s.parse::<i64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("int error: {}", e)))
}

fn filter_float(value: &Value) -> Result<f64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i as f64);
    }
    let s = value.to_string();
    s.parse::<f64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("float error: {}", e)))
}

fn filter_string(value: &Value) -> String {
    value.to_string()
}

fn filter_lower(value: &Value) -> String {
    value.to_string().to_lowercase()
}

fn filter_upper(value: &Value) -> String {
    value.to_string().to_uppercase()
}

fn filter_trim(value: &Value) -> String {
    value.to_string().trim().to_string()
}

fn filter_split(value: &Value, sep: Option<&Value>) -> Vec<String> {
    let s = value.to_string();
    let separator = sep.map(|v| v.to_string()).unwrap_or_else(|| " ".to_string());
    s.split(&separator).map(|s| s.to_string()).collect()
}

fn filter_join(value: &Value, sep: Option<&Value>) -> Result<String, Error> {
    let separator = sep.map(|v| v.to_string()).unwrap_or_default();
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "join requires a sequence"))?;
    let items: Vec<String> = iter.map(|v| v.to_string()).collect();
    Ok(items.join(&separator))
}

fn filter_first(value: &Value) -> Result<Value, Error> {
    let mut iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "first requires a sequence"))?;
    iter.next()
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "sequence is empty"))
}

fn filter_last(value: &Value) -> Result<Value, Error> {
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "last requires a sequence"))?;
    iter.last()
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "sequence is empty"))
}

fn filter_length(value: &Value) -> Result<usize, Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.len());
    }
    if let Some(len) = value.len() {
        return Ok(len);
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        "length requires string, sequence, or mapping",
    ))
}

fn filter_keys(value: &Value) -> Result<Vec<String>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(ErrorKind::InvalidOperation, "keys requires a mapping"));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate keys"))?;
    Ok(iter.map(|v| v.to_string()).collect())
}

fn filter_values(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(ErrorKind::InvalidOperation, "values requires a mapping"));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate values"))?;
    let mut result = Vec::new();
    for key in iter {
        if let Ok(val) = value.get_item(&key) {
            result.push(val);
        }
    }
    Ok(result)
}

// ============================================================================
// Custom Tests and Globals
// ============================================================================

fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

fn test_none(value: &Value) -> bool {
    value.is_none()
}

fn test_mapping(value: &Value) -> bool {
    value.kind() == ValueKind::Map
}

fn test_sequence(value: &Value) -> bool {
    value.kind() == ValueKind::Seq
}

fn global_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> HashMap<String, serde_json::Value> {
        let mut ctx = HashMap::new();
        ctx.insert("name".to_string(), serde_json::json!("Alice"));
        ctx.insert("age".to_string(), serde_json::json!(30));
        ctx.insert("active".to_string(), serde_json::json!(true));
        ctx.insert(
            "items".to_string(),
            serde_json::json!(["apple", "banana", "cherry"]),
        );
        ctx.insert(
            "user".to_string(),
            serde_json::json!({"email": "alice@example.com", "id": 123}),
        );
        ctx
    }

    #[test]
    fn test_simple_variable() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let result = engine.render("Hello, {{ name }}!", &ctx).unwrap();
        assert_eq!(result, "Hello, Alice!");
    }

    #[test]
    fn test_no_template_passthrough() {
        let engine = TemplateEngine::new();
        let result = engine.render("Plain text", &make_context()).unwrap();
        assert_eq!(result, "Plain text");
    }

    #[test]
    fn test_strict_undefined_errors() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let result = engine.render("{{ missing }}", &ctx);
        assert!(result.is_err());
    }

    #[test]
    fn test_lenient_returns_raw() {
        let engine = TemplateEngine::lenient();
        let ctx = make_context();

        // Lenient rendering of an undefined variable yields an empty
        // rendering rather than an error.
        let result = engine.render("{{ missing }}", &ctx).unwrap();
        assert!(result == "{{ missing }}" || result.is_empty());

        let result = engine.render_or_empty("x{{ [invalid }}", &ctx).unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn test_single_expression_preserves_type() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        // container value comes back as the object, not a string
        let result = engine.render_to_value("{{ user }}", &ctx).unwrap();
        assert_eq!(result["email"], serde_json::json!("alice@example.com"));

        // sequence
        let result = engine.render_to_value("{{ items }}", &ctx).unwrap();
        assert_eq!(result, serde_json::json!(["apple", "banana", "cherry"]));

        // number keeps its type
        let result = engine.render_to_value("{{ age }}", &ctx).unwrap();
        assert_eq!(result, serde_json::json!(30));

        // strings stay strings
        let result = engine.render_to_value("{{ name }}", &ctx).unwrap();
        assert_eq!(result, serde_json::json!("Alice"));
    }

    #[test]
    fn test_render_idempotent() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let once = engine.render("{{ name }}-{{ age }}", &ctx).unwrap();
        let twice = engine.render("{{ name }}-{{ age }}", &ctx).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_json_auto_parse() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let result = engine
            .render_to_value("{{ user | tojson }}", &ctx)
            .unwrap();
        assert_eq!(result["id"], serde_json::json!(123));

        let result = engine.render_to_value("[1, 2, {{ age }}]", &ctx).unwrap();
        assert_eq!(result, serde_json::json!([1, 2, 30]));
    }

    #[test]
    fn test_dotted_path_lookup() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let result = engine.render("Email: {{ user.email }}", &ctx).unwrap();
        assert_eq!(result, "Email: alice@example.com");
    }

    #[test]
    fn test_filters() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        assert_eq!(engine.render("{{ name | upper }}", &ctx).unwrap(), "ALICE");
        assert_eq!(engine.render("{{ items | length }}", &ctx).unwrap(), "3");
        assert_eq!(engine.render("{{ items | first }}", &ctx).unwrap(), "apple");
        assert_eq!(
            engine.render("{{ items | join(', ') }}", &ctx).unwrap(),
            "apple, banana, cherry"
        );
        assert_eq!(
            engine.render("{{ name | b64encode }}", &ctx).unwrap(),
            "QWxpY2U="
        );

        // defaults for absent keys render on the lenient engine
        let lenient = TemplateEngine::lenient();
        assert_eq!(
            lenient
                .render("{{ missing | default('fallback') }}", &ctx)
                .unwrap(),
            "fallback"
        );
    }

    #[test]
    fn test_now_global() {
        let engine = TemplateEngine::new();
        let ctx = HashMap::new();

        let result = engine.render("{{ now() }}", &ctx).unwrap();
        // RFC 3339 timestamps carry a date separator and a time separator
        assert!(result.contains('T'));
        assert!(result.contains('-'));
    }

    #[test]
    fn test_evaluate_condition() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        assert!(engine.evaluate_condition("age > 25", &ctx).unwrap());
        assert!(!engine.evaluate_condition("age < 25", &ctx).unwrap());
        assert!(engine.evaluate_condition("active", &ctx).unwrap());
        assert!(engine
            .evaluate_condition("{{ age % 2 == 0 }}", &ctx)
            .unwrap());
    }

    #[test]
    fn test_render_value_nested() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let value = serde_json::json!({
            "greeting": "Hello, {{ name }}!",
            "raw_number": 42,
            "info": {
                "age": "{{ age }}",
                "tags": ["{{ name | lower }}", "static"]
            }
        });

        let result = engine.render_value(&value, &ctx).unwrap();
        assert_eq!(result["greeting"], "Hello, Alice!");
        assert_eq!(result["raw_number"], 42);
        assert_eq!(result["info"]["age"], serde_json::json!(30));
        assert_eq!(result["info"]["tags"][0], "alice");
    }

    #[test]
    fn test_single_expression_detection() {
        assert_eq!(single_expression("{{ user }}"), Some("user"));
        assert_eq!(single_expression("  {{ a.b.c }}  "), Some("a.b.c"));
        assert_eq!(single_expression("x {{ user }}"), None);
        assert_eq!(single_expression("{{ a }}{{ b }}"), None);
        assert_eq!(single_expression("plain"), None);
    }

    #[test]
    fn test_conditional_and_loop_blocks() {
        let engine = TemplateEngine::new();
        let ctx = make_context();

        let result = engine
            .render("{% if active %}yes{% else %}no{% endif %}", &ctx)
            .unwrap();
        assert_eq!(result, "yes");

        let result = engine
            .render("{% for item in items %}{{ item }} {% endfor %}", &ctx)
            .unwrap();
        assert_eq!(result, "apple banana cherry ");
    }
}
