//! The chromedriver child process owned by one render worker.

use std::{
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use reqwest::Url;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::{config::AutomationSettings, infra::error::InfraError};

use super::client::WebDriverClient;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Port for the driver of `worker_id`; ids are 1-based so worker 1 gets the base port.
pub fn driver_port(base: u16, worker_id: u32) -> Result<u16, InfraError> {
    let offset = worker_id.saturating_sub(1);
    u16::try_from(u32::from(base) + offset)
        .map_err(|_| InfraError::driver(format!("driver port {base}+{offset} is out of range")))
}

#[derive(Debug)]
pub struct DriverProcess {
    child: Child,
    base_url: Url,
}

impl DriverProcess {
    /// Spawn the driver and wait until its `status` endpoint reports ready.
    pub async fn launch(settings: &AutomationSettings, worker_id: u32) -> Result<Self, InfraError> {
        let started_at = Instant::now();
        let port = driver_port(settings.driver_port, worker_id)?;
        let base_url = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .map_err(|err| InfraError::driver(format!("invalid driver url: {err}")))?;

        let child = Command::new(&settings.driver_path)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                InfraError::driver(format!(
                    "failed to spawn `{}`: {err}",
                    settings.driver_path.display()
                ))
            })?;

        let mut process = Self { child, base_url };
        process.await_ready(settings.startup_timeout).await?;

        info!(
            target = "infra::webdriver::driver",
            op = "launch",
            result = "ok",
            worker_id,
            port,
            pid = process.pid().unwrap_or_default(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "WebDriver server ready"
        );
        Ok(process)
    }

    async fn await_ready(&mut self, timeout: Duration) -> Result<(), InfraError> {
        let client = WebDriverClient::new(self.base_url.clone())
            .map_err(|err| InfraError::driver(err.to_string()))?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(InfraError::driver(format!(
                    "driver exited during startup with {status}"
                )));
            }

            match client.get("status").await {
                Ok(value) if is_ready(&value) => return Ok(()),
                Ok(_) | Err(_) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    target = "infra::webdriver::driver",
                    op = "await_ready",
                    result = "timeout",
                    error_code = "driver_not_ready",
                    "WebDriver server did not become ready"
                );
                return Err(InfraError::driver(format!(
                    "driver not ready after {timeout:?}"
                )));
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Resolve when the driver process exits.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

fn is_ready(status: &Value) -> bool {
    status.get("ready").and_then(Value::as_bool).unwrap_or(false)
}
