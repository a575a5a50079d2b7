use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::application::automation::{
    AutomationError, BoundingBox, BrowserSession, ConsoleEntry,
};

use super::client::WebDriverClient;

/// W3C web element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4d3a4d3a4d3a";
const CONDITION_POLL_INTERVAL: Duration = Duration::from_millis(100);

const INNER_HTML_SCRIPT: &str =
    "const el = document.querySelector(arguments[0]); return el ? el.innerHTML : null;";
const OUTER_HTML_SCRIPT: &str =
    "const el = document.querySelector(arguments[0]); return el ? el.outerHTML : null;";
const BBOX_SCRIPT: &str = "const el = document.querySelector(arguments[0]);\
 if (!el || typeof el.getBBox !== 'function') return null;\
 const b = el.getBBox(); return {x: b.x, y: b.y, width: b.width, height: b.height};";

/// One browser tab driven through a WebDriver session.
#[derive(Debug)]
pub struct WebDriverSession {
    client: WebDriverClient,
    id: String,
}

impl WebDriverSession {
    pub(crate) fn new(client: WebDriverClient, id: String) -> Self {
        Self { client, id }
    }

    fn path(&self, suffix: &str) -> String {
        format!("session/{}/{suffix}", self.id)
    }

    async fn execute(&self, script: &str, args: Value) -> Result<Value, AutomationError> {
        self.client
            .post(
                &self.path("execute/sync"),
                json!({ "script": script, "args": args }),
            )
            .await
    }

    async fn evaluate_flag(&self, expression: &str) -> Result<bool, AutomationError> {
        let script = format!(
            "try {{ return Boolean({expression}); }} catch (e) {{ return false; }}"
        );
        let value = self.execute(&script, json!([])).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn optional_string(
        &self,
        script: &str,
        selector: &str,
    ) -> Result<Option<String>, AutomationError> {
        match self.execute(script, json!([selector])).await? {
            Value::Null => Ok(None),
            Value::String(text) => Ok(Some(text)),
            other => Err(AutomationError::protocol(format!(
                "expected string result, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), AutomationError> {
        let path = self.path("url");
        let request = self.client.post(&path, json!({ "url": url }));
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if err.is_timeout() => Err(AutomationError::Timeout(timeout)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AutomationError::Timeout(timeout)),
        }
    }

    async fn wait_for_condition(
        &self,
        expression: &str,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AutomationError::Timeout(timeout));
            }
            match tokio::time::timeout(remaining, self.evaluate_flag(expression)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(err)) if err.is_timeout() => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(AutomationError::Timeout(timeout)),
            }
            tokio::time::sleep(CONDITION_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn inner_html(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        self.optional_string(INNER_HTML_SCRIPT, selector).await
    }

    async fn outer_html(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        self.optional_string(OUTER_HTML_SCRIPT, selector).await
    }

    async fn bounding_box(&self, selector: &str) -> Result<Option<BoundingBox>, AutomationError> {
        let value = self.execute(BBOX_SCRIPT, json!([selector])).await?;
        serde_json::from_value(value)
            .map_err(|err| AutomationError::protocol(format!("malformed bounding box: {err}")))
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, AutomationError> {
        let element = self
            .client
            .post(
                &self.path("element"),
                json!({ "using": "css selector", "value": selector }),
            )
            .await?;
        let element_id = element
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AutomationError::protocol(format!("no element reference for `{selector}`"))
            })?;

        let encoded = self
            .client
            .get(&self.path(&format!("element/{element_id}/screenshot")))
            .await?;
        let encoded = encoded
            .as_str()
            .ok_or_else(|| AutomationError::protocol("screenshot payload is not a string"))?;
        STANDARD
            .decode(encoded)
            .map_err(|err| AutomationError::protocol(format!("invalid screenshot encoding: {err}")))
    }

    async fn drain_console(&self) -> Result<Vec<ConsoleEntry>, AutomationError> {
        let entries = match self
            .client
            .post(&self.path("se/log"), json!({ "type": "browser" }))
            .await
        {
            Ok(entries) => entries,
            Err(AutomationError::Unsupported(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(parse_log_entries(&entries))
    }
}

/// Convert driver log entries (`{level, message, timestamp}`) to console entries.
pub(crate) fn parse_log_entries(entries: &Value) -> Vec<ConsoleEntry> {
    entries
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let message = item.get("message")?.as_str()?;
                    let level = item.get("level").and_then(Value::as_str).unwrap_or("INFO");
                    Some(if level.eq_ignore_ascii_case("SEVERE") {
                        ConsoleEntry::error(message)
                    } else {
                        ConsoleEntry::log(message)
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, routing::post};
    use reqwest::Url;

    use super::*;

    #[derive(Clone, Default)]
    struct DriverStub {
        visited: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    async fn record_navigation(
        State(stub): State<DriverStub>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        tokio::time::sleep(stub.delay).await;
        if let Some(url) = body.get("url").and_then(Value::as_str) {
            stub.visited.lock().expect("visited").push(url.to_string());
        }
        Json(json!({ "value": null }))
    }

    async fn session_against(stub: DriverStub) -> WebDriverSession {
        let app = Router::new()
            .route("/session/{id}/url", post(record_navigation))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub driver");
        let addr = listener.local_addr().expect("stub address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let base = Url::parse(&format!("http://{addr}/")).expect("stub url");
        WebDriverSession::new(WebDriverClient::new(base).expect("client"), "abc".into())
    }

    #[tokio::test]
    async fn navigate_posts_target_url_to_session() {
        let stub = DriverStub::default();
        let session = session_against(stub.clone()).await;

        session
            .navigate("file:///srv/generate.html?NOGRAPH=false", Duration::from_secs(5))
            .await
            .expect("navigation");

        assert_eq!(
            stub.visited.lock().expect("visited").as_slice(),
            ["file:///srv/generate.html?NOGRAPH=false"]
        );
    }

    #[tokio::test]
    async fn slow_navigation_times_out() {
        let stub = DriverStub {
            delay: Duration::from_secs(5),
            ..DriverStub::default()
        };
        let session = session_against(stub).await;

        let err = session
            .navigate("file:///srv/generate.html", Duration::from_millis(50))
            .await
            .expect_err("navigation should time out");
        assert_eq!(err, AutomationError::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn severe_entries_become_errors() {
        let entries = json!([
            {"level": "INFO", "message": "goal loaded", "timestamp": 1},
            {"level": "SEVERE", "message": "Uncaught TypeError", "timestamp": 2},
            {"level": "WARNING"},
        ]);
        assert_eq!(
            parse_log_entries(&entries),
            vec![
                ConsoleEntry::log("goal loaded"),
                ConsoleEntry::error("Uncaught TypeError"),
            ]
        );
    }

    #[test]
    fn non_array_log_payload_is_empty() {
        assert!(parse_log_entries(&Value::Null).is_empty());
    }
}
