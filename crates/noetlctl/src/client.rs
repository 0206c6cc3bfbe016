//! HTTP client for the control plane API.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::Value;

/// Thin wrapper over the control plane REST endpoints.
pub struct ServerClient {
    base_url: String,
    client: Client,
}

impl ServerClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: Client::new(),
        }
    }

    /// `POST /catalog/register`
    pub async fn register(&self, content_base64: &str, resource_type: &str) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/catalog/register", self.base_url))
            .json(&serde_json::json!({
                "content_base64": content_base64,
                "resource_type": resource_type,
            }))
            .send()
            .await?;
        Self::into_json(response).await
    }

    /// `GET /catalog/list`
    pub async fn list(&self, resource_type: Option<&str>) -> Result<Value> {
        let mut request = self.client.get(format!("{}/catalog/list", self.base_url));
        if let Some(rt) = resource_type {
            request = request.query(&[("resource_type", rt)]);
        }
        Self::into_json(request.send().await?).await
    }

    /// `POST /agent/execute` or `/agent/execute-async`
    pub async fn execute(
        &self,
        path: &str,
        version: Option<&str>,
        payload: Option<Value>,
        sync: bool,
        merge: bool,
    ) -> Result<Value> {
        let endpoint = if sync {
            "/agent/execute"
        } else {
            "/agent/execute-async"
        };

        let mut body = serde_json::json!({"path": path, "merge": merge});
        if let Some(version) = version {
            body["version"] = serde_json::json!(version);
        }
        if let Some(payload) = payload {
            body["input_payload"] = payload;
        }

        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&body)
            .send()
            .await?;
        Self::into_json(response).await
    }

    /// `POST /credentials`
    pub async fn register_secret(
        &self,
        name: &str,
        credential_type: &str,
        data: Value,
        meta: Option<Value>,
        tags: Option<Value>,
        description: Option<String>,
    ) -> Result<Value> {
        let mut body = serde_json::json!({
            "name": name,
            "type": credential_type,
            "data": data,
        });
        if let Some(meta) = meta {
            body["meta"] = meta;
        }
        if let Some(tags) = tags {
            body["tags"] = tags;
        }
        if let Some(description) = description {
            body["description"] = serde_json::json!(description);
        }

        let response = self
            .client
            .post(format!("{}/credentials", self.base_url))
            .json(&body)
            .send()
            .await?;
        Self::into_json(response).await
    }

    async fn into_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({"error": "non-JSON response"}));

        if status.is_success() {
            Ok(body)
        } else {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("request failed");
            Err(anyhow!("server returned {}: {}", status, message))
        }
    }
}
