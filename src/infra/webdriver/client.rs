//! Minimal W3C WebDriver wire client.

use std::time::Duration;

use reqwest::{Client, Method, Url};
use serde_json::Value;

use crate::application::automation::AutomationError;

#[derive(Clone, Debug)]
pub struct WebDriverClient {
    http: Client,
    base: Url,
}

impl WebDriverClient {
    pub fn new(base: Url) -> Result<Self, AutomationError> {
        let http = Client::builder()
            .user_agent(concat!("jsbrain/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AutomationError::transport(err.to_string()))?;
        Ok(Self { http, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn get(&self, path: &str) -> Result<Value, AutomationError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, AutomationError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, AutomationError> {
        self.request(Method::DELETE, path, None).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, AutomationError> {
        let url = self
            .base
            .join(path)
            .map_err(|err| AutomationError::protocol(format!("invalid endpoint `{path}`: {err}")))?;

        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|err| {
            if err.is_connect() {
                AutomationError::Disconnected
            } else {
                AutomationError::transport(err.to_string())
            }
        })?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|err| AutomationError::transport(format!("status {status}: {err}")))?;

        decode_response(payload)
    }
}

/// Unwrap the `value` member of a WebDriver response, mapping wire errors.
pub(crate) fn decode_response(mut payload: Value) -> Result<Value, AutomationError> {
    let value = payload
        .get_mut("value")
        .map(Value::take)
        .unwrap_or(Value::Null);

    let Some(code) = value.get("error").and_then(Value::as_str) else {
        return Ok(value);
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Err(match code {
        "timeout" | "script timeout" => AutomationError::Timeout(Duration::ZERO),
        "unknown command" | "unknown method" | "unsupported operation" => {
            AutomationError::Unsupported(format!("{code}: {message}"))
        }
        "invalid session id" => AutomationError::Disconnected,
        other => AutomationError::protocol(format!("{other}: {message}")),
    })
}
