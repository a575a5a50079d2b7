use std::{ffi::OsString, path::PathBuf};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the jsbrain binary.
#[derive(Debug, Parser)]
#[command(
    name = "jsbrain",
    version,
    about = "Render server for Beeminder goal graphs"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "JSBRAIN_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Supervise render workers sharing the listening port.
    Serve(Box<ServeArgs>),
    /// Run a single render worker. Started by `serve`.
    #[command(hide = true)]
    Worker(Box<WorkerArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Worker slot number assigned by the supervisor.
    #[arg(long = "worker-id", value_name = "ID", default_value_t = 1)]
    pub worker_id: u32,

    /// How many times this worker slot has been restarted.
    #[arg(long = "generation", value_name = "COUNT", default_value_t = 0)]
    pub generation: u32,

    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of worker processes.
    #[arg(long = "workers", value_name = "COUNT")]
    pub workers: Option<u32>,

    /// Override the maximum number of browser sessions per worker.
    #[arg(long = "pool-capacity", value_name = "COUNT")]
    pub pool_capacity: Option<u32>,

    /// Override the idle grace period before a session is closed.
    #[arg(long = "pool-idle-grace-ms", value_name = "MS")]
    pub pool_idle_grace_ms: Option<u64>,

    /// Override the WebDriver server executable.
    #[arg(long = "driver-path", value_name = "PATH")]
    pub driver_path: Option<PathBuf>,

    /// Override the port the WebDriver server listens on.
    #[arg(long = "driver-port", value_name = "PORT")]
    pub driver_port: Option<u16>,

    /// Override the rendering document location.
    #[arg(long = "render-page", value_name = "PATH")]
    pub render_page: Option<PathBuf>,

    /// Override the palette image used for quantization.
    #[arg(long = "render-palette", value_name = "PATH")]
    pub render_palette: Option<PathBuf>,
}

impl ServeOverrides {
    /// Re-encode the overrides as flags for a `worker` subprocess.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: OsString| {
            args.push(OsString::from(flag));
            args.push(value);
        };
        if let Some(host) = self.server_host.as_ref() {
            push("--server-host", host.into());
        }
        if let Some(port) = self.server_port {
            push("--server-port", port.to_string().into());
        }
        if let Some(level) = self.log_level.as_ref() {
            push("--log-level", level.into());
        }
        if let Some(json) = self.log_json {
            push("--log-json", json.to_string().into());
        }
        if let Some(capacity) = self.pool_capacity {
            push("--pool-capacity", capacity.to_string().into());
        }
        if let Some(grace) = self.pool_idle_grace_ms {
            push("--pool-idle-grace-ms", grace.to_string().into());
        }
        if let Some(path) = self.driver_path.as_ref() {
            push("--driver-path", path.into());
        }
        if let Some(port) = self.driver_port {
            push("--driver-port", port.to_string().into());
        }
        if let Some(page) = self.render_page.as_ref() {
            push("--render-page", page.into());
        }
        if let Some(palette) = self.render_palette.as_ref() {
            push("--render-palette", palette.into());
        }
        args
    }
}
