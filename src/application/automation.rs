//! Interface the render pipeline requires from the browser automation layer.
//!
//! An [`AutomationEnvironment`] is one running browser driver; each
//! [`BrowserSession`] is a tab-like handle owned by a pool slot. The concrete
//! WebDriver adapter lives in `infra::webdriver`; tests substitute in-memory
//! fakes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AutomationError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("automation protocol error: {0}")]
    Protocol(String),
    #[error("automation transport failed: {0}")]
    Transport(String),
    #[error("operation not supported by the automation environment: {0}")]
    Unsupported(String),
    #[error("automation environment disconnected")]
    Disconnected,
}

impl AutomationError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AutomationError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Error,
}

/// One message emitted on the document's console or error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
}

impl ConsoleEntry {
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            level: ConsoleLevel::Log,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ConsoleLevel::Error,
            message: message.into(),
        }
    }
}

/// SVG-space bounding box as reported by `getBBox()`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Driver-assigned identifier, used in logs only.
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), AutomationError>;

    /// Poll `expression` in the loaded document until it is truthy.
    async fn wait_for_condition(
        &self,
        expression: &str,
        timeout: Duration,
    ) -> Result<(), AutomationError>;

    /// `innerHTML` of the first node matching `selector`, `None` when absent.
    async fn inner_html(&self, selector: &str) -> Result<Option<String>, AutomationError>;

    /// `outerHTML` of the first node matching `selector`, `None` when absent.
    async fn outer_html(&self, selector: &str) -> Result<Option<String>, AutomationError>;

    async fn bounding_box(&self, selector: &str) -> Result<Option<BoundingBox>, AutomationError>;

    /// PNG bytes clipped to the bounding box of the node matching `selector`.
    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, AutomationError>;

    /// Console and page-error messages accumulated since the previous drain.
    async fn drain_console(&self) -> Result<Vec<ConsoleEntry>, AutomationError>;
}

#[async_trait]
pub trait AutomationEnvironment: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn BrowserSession>, AutomationError>;

    async fn close_session(&self, session: Arc<dyn BrowserSession>)
    -> Result<(), AutomationError>;
}
