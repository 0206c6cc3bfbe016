//! HTTP request tool.
//!
//! Requests carry a unified `data` block: `data.query` and `data.body`
//! override the method-based routing (GET/DELETE send data as query
//! parameters, POST/PUT/PATCH as a JSON body). Legacy `params`/`payload`
//! fields are still accepted. A deterministic mock transport answers for
//! `.local` hostnames so playbooks remain testable offline.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::{http_headers, AuthResolver};
use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::registry::{Tool, ToolConfig};
use crate::result::ToolResult;
use crate::template::TemplateEngine;

/// Default per-task timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One canned response in a mock route sequence.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: Value,
}

impl MockResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16) -> Self {
        Self {
            status,
            body: serde_json::json!({"error": format!("mock status {}", status)}),
        }
    }
}

struct MockRoute {
    pattern: regex::Regex,
    responses: Vec<MockResponse>,
    hits: AtomicUsize,
}

/// Programmable mock transport keyed by URL pattern.
///
/// Each route carries a response sequence; hits beyond the end repeat the
/// last response. Requests are recorded for assertions.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Arc<MockRoute>>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canned payloads used when `.local` hosts are called without an
    /// explicitly-registered route.
    pub fn with_defaults() -> Self {
        let transport = Self::new();
        transport.register(
            r"/forecast",
            vec![MockResponse::ok(serde_json::json!({
                "max_temp": 30,
                "min_temp": 18,
                "unit": "celsius"
            }))],
        );
        transport
    }

    /// Register a route; `pattern` is a regex matched against the full URL.
    pub fn register(&self, pattern: &str, responses: Vec<MockResponse>) {
        let Ok(re) = regex::Regex::new(pattern) else {
            tracing::warn!(pattern, "Ignoring invalid mock route pattern");
            return;
        };
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Arc::new(MockRoute {
                pattern: re,
                responses,
                hits: AtomicUsize::new(0),
            }));
        }
    }

    /// URLs of every request answered by this transport.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn respond(&self, url: &str) -> (u16, Value) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }

        let route = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.iter().find(|r| r.pattern.is_match(url)).cloned());

        match route {
            Some(route) if !route.responses.is_empty() => {
                let hit = route.hits.fetch_add(1, Ordering::SeqCst);
                let idx = hit.min(route.responses.len() - 1);
                let response = &route.responses[idx];
                (response.status, response.body.clone())
            }
            _ => (
                200,
                serde_json::json!({"mock": true, "url": url}),
            ),
        }
    }
}

/// HTTP request tool.
pub struct HttpTool {
    client: reqwest::Client,
    resolver: Arc<AuthResolver>,
    template: TemplateEngine,
    mock: Arc<MockTransport>,
    force_mock: bool,
}

impl HttpTool {
    pub fn new(resolver: Arc<AuthResolver>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            resolver,
            template: TemplateEngine::new(),
            mock: Arc::new(MockTransport::with_defaults()),
            force_mock: false,
        }
    }

    /// Build a tool that answers every request from the given mock.
    pub fn with_mock(resolver: Arc<AuthResolver>, mock: Arc<MockTransport>) -> Self {
        let mut tool = Self::new(resolver);
        tool.mock = mock;
        tool.force_mock = true;
        tool
    }

    /// The mock transport backing `.local` requests.
    pub fn mock(&self) -> Arc<MockTransport> {
        Arc::clone(&self.mock)
    }

    fn mock_active(&self, url: &str) -> bool {
        if self.force_mock {
            return true;
        }
        if std::env::var("NOETL_HTTP_MOCK_LOCAL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            return true;
        }
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.ends_with(".local")))
            .unwrap_or(false)
    }

    /// Perform one HTTP exchange and return `(status_code, headers, data)`.
    ///
    /// This is the raw entry point shared with the pagination controller and
    /// the http sink.
    pub async fn request_raw(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        query: Option<&Value>,
        body: Option<&Value>,
        timeout: Option<u64>,
    ) -> Result<(u16, HashMap<String, String>, Value), ToolError> {
        if self.mock_active(url) {
            let full_url = append_query(url, query);
            let (status, data) = self.mock.respond(&full_url);
            return Ok((status, HashMap::new(), data));
        }

        let mock_on_error = std::env::var("NOETL_HTTP_MOCK_ON_ERROR")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| ToolError::Configuration(format!("Invalid HTTP method: {}", method)))?;

        let mut request = self.client.request(method, url);

        if let Some(Value::Object(map)) = query {
            let pairs: Vec<(String, String)> = map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_query_string(v)))
                .collect();
            request = request.query(&pairs);
        }

        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let is_form = headers
            .iter()
            .any(|(k, v)| {
                k.eq_ignore_ascii_case("content-type")
                    && v.contains("application/x-www-form-urlencoded")
            });

        if let Some(body) = body {
            if is_form {
                if let Value::Object(map) = body {
                    let pairs: Vec<(String, String)> = map
                        .iter()
                        .map(|(k, v)| (k.clone(), value_to_query_string(v)))
                        .collect();
                    request = request.form(&pairs);
                }
            } else if let Value::String(s) = body {
                request = request.body(s.clone());
            } else {
                request = request.json(body);
            }
        }

        request = request.timeout(Duration::from_secs(timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)));

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if mock_on_error => {
                tracing::warn!(url, error = %e, "Transport error; answering from mock");
                let full_url = append_query(url, query);
                let (status, data) = self.mock.respond(&full_url);
                return Ok((status, HashMap::new(), data));
            }
            Err(e) => return Err(e.into()),
        };

        let status_code = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let text = response.text().await.unwrap_or_default();
        let data: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok((status_code, response_headers, data))
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();
        let template_ctx = ctx.to_template_context();
        let rendered = self.template.render_value(&config.config, &template_ctx)?;

        let endpoint = rendered
            .get("endpoint")
            .or_else(|| rendered.get("url"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::Configuration("http task requires an 'endpoint'".to_string())
            })?
            .to_string();

        let method = rendered
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let mut headers: HashMap<String, String> = rendered
            .get("headers")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), value_to_query_string(v)))
                    .collect()
            })
            .unwrap_or_default();

        // Auth headers from the resolver
        if let Some(ref auth_spec) = config.auth {
            let resolved = self
                .resolver
                .resolve(auth_spec, &self.template, &template_ctx)
                .await?;
            for auth in resolved.items.values() {
                for (name, value) in http_headers(auth)? {
                    headers.insert(name, value);
                }
            }
        }

        let (query, body) = route_data(&rendered, &method);

        tracing::debug!(
            url = %endpoint,
            method = %method,
            has_query = query.is_some(),
            has_body = body.is_some(),
            "Executing HTTP request"
        );

        let (status_code, response_headers, data) = self
            .request_raw(
                &method,
                &endpoint,
                &headers,
                query.as_ref(),
                body.as_ref(),
                config.timeout,
            )
            .await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let payload = serde_json::json!({
            "data": data,
            "status_code": status_code,
            "headers": response_headers,
        });

        if (200..300).contains(&status_code) {
            Ok(ToolResult::success(payload).with_duration(duration_ms))
        } else {
            Ok(ToolResult::error(format!("HTTP {} from {}", status_code, endpoint))
                .with_data(payload)
                .with_duration(duration_ms))
        }
    }
}

/// Split the unified `data` block into query and body per the request method.
fn route_data(config: &Value, method: &str) -> (Option<Value>, Option<Value>) {
    let data = config.get("data");

    // explicit overrides inside data
    if let Some(data) = data {
        let query = data.get("query").cloned();
        let body = data.get("body").cloned();
        if query.is_some() || body.is_some() {
            return (query, body);
        }
    }

    // legacy fields
    let legacy_query = config.get("params").cloned();
    let legacy_body = config.get("payload").cloned();
    if legacy_query.is_some() || legacy_body.is_some() {
        return (legacy_query, legacy_body);
    }

    match (data, method) {
        (Some(d), "GET") | (Some(d), "DELETE") => (Some(d.clone()), None),
        (Some(d), _) => (None, Some(d.clone())),
        (None, _) => (None, None),
    }
}

fn value_to_query_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn append_query(url: &str, query: Option<&Value>) -> String {
    let Some(Value::Object(map)) = query else {
        return url.to_string();
    };
    if map.is_empty() {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    let pairs: Vec<String> = map
        .iter()
        .map(|(k, v)| format!("{}={}", k, value_to_query_string(v)))
        .collect();
    format!("{}{}{}", url, sep, pairs.join("&"))
}
