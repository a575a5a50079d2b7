//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides, WorkerArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "jsbrain";
const ENV_PREFIX: &str = "JSBRAIN";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_WORKERS: u64 = 1;
const DEFAULT_DRIVER_PATH: &str = "chromedriver";
const DEFAULT_DRIVER_PORT: u16 = 9515;
const DEFAULT_DRIVER_STARTUP_SECS: u64 = 10;
const DEFAULT_SESSION_OPEN_SECS: u64 = 10;
const DEFAULT_POOL_CAPACITY: u64 = 5;
const DEFAULT_IDLE_GRACE_MS: u64 = 3000;
const DEFAULT_PAGE_PATH: &str = "jsbrain_server/generate.html";
const DEFAULT_PAGE_TIMEOUT_SECS: u64 = 40;
const DEFAULT_INPUT_RETRY_DELAY_MS: u64 = 250;
const DEFAULT_PUBLIC_BASE_URL: &str = "http://brain.beeminder.com/";
const DEFAULT_PALETTE_PATH: &str = "palette.png";
const DEFAULT_THUMBNAIL_WIDTH: u32 = 208;
const DEFAULT_THUMBNAIL_HEIGHT: u32 = 136;
const DEFAULT_IMAGEMAGICK_PATH: &str = "convert";
const DEFAULT_SVGO_PATH: &str = "svgo";
const DEFAULT_POSTPROCESS_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_RENDERS: u64 = 2;

pub(crate) const DEFAULT_BROWSER_ARGS: [&str; 9] = [
    "--headless=new",
    "--no-sandbox",
    "--allow-file-access-from-files",
    "--disable-web-security",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--no-first-run",
    "--no-zygote",
    "--log-level=3",
];

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub supervisor: SupervisorSettings,
    pub automation: AutomationSettings,
    pub pool: PoolSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub workers: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct AutomationSettings {
    pub driver_path: PathBuf,
    pub driver_port: u16,
    pub browser_binary: Option<PathBuf>,
    pub browser_args: Vec<String>,
    pub startup_timeout: Duration,
    pub session_open_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub capacity: NonZeroUsize,
    pub idle_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub page_path: PathBuf,
    pub page_timeout: Duration,
    pub input_retry_delay: Duration,
    pub public_base_url: String,
    pub palette_path: PathBuf,
    pub thumbnail_size: (u32, u32),
    pub imagemagick_path: PathBuf,
    pub svgo_path: PathBuf,
    pub postprocess_timeout: Duration,
    pub max_concurrent_renders: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("automation.browser_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Worker(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    supervisor: RawSupervisorSettings,
    automation: RawAutomationSettings,
    pool: RawPoolSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(workers) = overrides.workers {
            self.supervisor.workers = Some(u64::from(workers));
        }
        if let Some(capacity) = overrides.pool_capacity {
            self.pool.capacity = Some(u64::from(capacity));
        }
        if let Some(grace) = overrides.pool_idle_grace_ms {
            self.pool.idle_grace_ms = Some(grace);
        }
        if let Some(path) = overrides.driver_path.as_ref() {
            self.automation.driver_path = Some(path.clone());
        }
        if let Some(port) = overrides.driver_port {
            self.automation.driver_port = Some(port);
        }
        if let Some(page) = overrides.render_page.as_ref() {
            self.render.page_path = Some(page.clone());
        }
        if let Some(palette) = overrides.render_palette.as_ref() {
            self.render.palette_path = Some(palette.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            supervisor,
            automation,
            pool,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            supervisor: build_supervisor_settings(supervisor)?,
            automation: build_automation_settings(automation)?,
            pool: build_pool_settings(pool)?,
            render: build_render_settings(render)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;
    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_supervisor_settings(
    supervisor: RawSupervisorSettings,
) -> Result<SupervisorSettings, LoadError> {
    let workers = non_zero_u32(
        supervisor.workers.unwrap_or(DEFAULT_WORKERS),
        "supervisor.workers",
    )?;
    Ok(SupervisorSettings { workers })
}

fn build_automation_settings(
    automation: RawAutomationSettings,
) -> Result<AutomationSettings, LoadError> {
    let driver_path = non_empty_path(automation.driver_path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DRIVER_PATH));

    let driver_port = automation.driver_port.unwrap_or(DEFAULT_DRIVER_PORT);
    if driver_port == 0 {
        return Err(LoadError::invalid(
            "automation.driver_port",
            "port must be greater than zero",
        ));
    }

    let browser_args = match automation.browser_args {
        Some(args) => args
            .into_iter()
            .map(|arg| arg.trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect(),
        None => DEFAULT_BROWSER_ARGS
            .iter()
            .map(|arg| (*arg).to_string())
            .collect(),
    };

    Ok(AutomationSettings {
        driver_path,
        driver_port,
        browser_binary: non_empty_path(automation.browser_binary),
        browser_args,
        startup_timeout: positive_secs(
            automation.startup_timeout_seconds,
            DEFAULT_DRIVER_STARTUP_SECS,
            "automation.startup_timeout_seconds",
        )?,
        session_open_timeout: positive_secs(
            automation.session_open_timeout_seconds,
            DEFAULT_SESSION_OPEN_SECS,
            "automation.session_open_timeout_seconds",
        )?,
    })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let capacity = non_zero_u32(
        pool.capacity.unwrap_or(DEFAULT_POOL_CAPACITY),
        "pool.capacity",
    )?;
    let capacity = usize::try_from(capacity.get())
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| LoadError::invalid("pool.capacity", "value exceeds supported range"))?;

    let idle_grace = Duration::from_millis(pool.idle_grace_ms.unwrap_or(DEFAULT_IDLE_GRACE_MS));

    Ok(PoolSettings {
        capacity,
        idle_grace,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let public_base_url = render
        .public_base_url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
    if public_base_url.is_empty() {
        return Err(LoadError::invalid(
            "render.public_base_url",
            "must not be empty",
        ));
    }

    let max_concurrent_renders = non_zero_u32(
        render
            .max_concurrent_renders
            .unwrap_or(DEFAULT_MAX_CONCURRENT_RENDERS),
        "render.max_concurrent_renders",
    )?;
    let max_concurrent_renders = usize::try_from(max_concurrent_renders.get())
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid(
                "render.max_concurrent_renders",
                "value exceeds supported range",
            )
        })?;

    let width = render.thumbnail_width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH);
    let height = render.thumbnail_height.unwrap_or(DEFAULT_THUMBNAIL_HEIGHT);
    if width == 0 || height == 0 {
        return Err(LoadError::invalid(
            "render.thumbnail_size",
            "width and height must be greater than zero",
        ));
    }

    Ok(RenderSettings {
        page_path: non_empty_path(render.page_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PAGE_PATH)),
        page_timeout: positive_secs(
            render.page_timeout_seconds,
            DEFAULT_PAGE_TIMEOUT_SECS,
            "render.page_timeout_seconds",
        )?,
        input_retry_delay: Duration::from_millis(
            render
                .input_retry_delay_ms
                .unwrap_or(DEFAULT_INPUT_RETRY_DELAY_MS),
        ),
        public_base_url,
        palette_path: non_empty_path(render.palette_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PALETTE_PATH)),
        thumbnail_size: (width, height),
        imagemagick_path: non_empty_path(render.imagemagick_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGEMAGICK_PATH)),
        svgo_path: non_empty_path(render.svgo_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SVGO_PATH)),
        postprocess_timeout: positive_secs(
            render.postprocess_timeout_seconds,
            DEFAULT_POSTPROCESS_TIMEOUT_SECS,
            "render.postprocess_timeout_seconds",
        )?,
        max_concurrent_renders,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSupervisorSettings {
    workers: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAutomationSettings {
    driver_path: Option<PathBuf>,
    driver_port: Option<u16>,
    browser_binary: Option<PathBuf>,
    browser_args: Option<Vec<String>>,
    startup_timeout_seconds: Option<u64>,
    session_open_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    capacity: Option<u64>,
    idle_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    page_path: Option<PathBuf>,
    page_timeout_seconds: Option<u64>,
    input_retry_delay_ms: Option<u64>,
    public_base_url: Option<String>,
    palette_path: Option<PathBuf>,
    thumbnail_width: Option<u32>,
    thumbnail_height: Option<u32>,
    imagemagick_path: Option<PathBuf>,
    svgo_path: Option<PathBuf>,
    postprocess_timeout_seconds: Option<u64>,
    max_concurrent_renders: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_secs(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    let secs = value.unwrap_or(default);
    if secs == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|path| !path.as_os_str().is_empty())
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
