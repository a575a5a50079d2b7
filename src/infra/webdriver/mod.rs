//! WebDriver-backed automation environment.
//!
//! Each render worker owns one chromedriver child ([`DriverProcess`]) and one
//! [`WebDriverEnvironment`] that opens browser sessions against it. Once the
//! driver goes away the environment is marked disconnected and every later
//! call fails fast.

mod client;
mod driver;
mod session;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    application::automation::{AutomationEnvironment, AutomationError, BrowserSession},
    config::AutomationSettings,
};

pub use client::WebDriverClient;
pub use driver::{DriverProcess, driver_port};
pub use session::WebDriverSession;

pub struct WebDriverEnvironment {
    client: WebDriverClient,
    capabilities: Value,
    disconnected: AtomicBool,
}

impl WebDriverEnvironment {
    pub fn new(base_url: Url, settings: &AutomationSettings) -> Result<Self, AutomationError> {
        Ok(Self {
            client: WebDriverClient::new(base_url)?,
            capabilities: session_capabilities(settings),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), AutomationError> {
        if self.is_disconnected() {
            Err(AutomationError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AutomationEnvironment for WebDriverEnvironment {
    async fn open_session(&self) -> Result<Arc<dyn BrowserSession>, AutomationError> {
        self.ensure_connected()?;
        let value = self
            .client
            .post("session", self.capabilities.clone())
            .await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AutomationError::protocol("new session response has no sessionId"))?
            .to_string();

        debug!(
            target = "infra::webdriver",
            op = "open_session",
            result = "ok",
            session_id = %id,
            "Browser session opened"
        );
        Ok(Arc::new(WebDriverSession::new(self.client.clone(), id)))
    }

    async fn close_session(
        &self,
        session: Arc<dyn BrowserSession>,
    ) -> Result<(), AutomationError> {
        self.ensure_connected()?;
        let id = session.id().to_string();
        match self.client.delete(&format!("session/{id}")).await {
            Ok(_) => {
                debug!(
                    target = "infra::webdriver",
                    op = "close_session",
                    result = "ok",
                    session_id = %id,
                    "Browser session closed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    target = "infra::webdriver",
                    op = "close_session",
                    result = "error",
                    session_id = %id,
                    error = %err,
                    "Failed to close browser session"
                );
                Err(err)
            }
        }
    }
}

/// New-session payload for a headless Chrome with browser console capture.
pub(crate) fn session_capabilities(settings: &AutomationSettings) -> Value {
    let mut chrome = Map::new();
    chrome.insert("args".into(), json!(settings.browser_args));
    if let Some(binary) = settings.browser_binary.as_ref() {
        chrome.insert("binary".into(), json!(binary.display().to_string()));
    }

    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": chrome,
                "goog:loggingPrefs": { "browser": "ALL" },
            }
        }
    })
}
