//! Render pipeline: one goal file in, JSON statistics plus graph artifacts out.
//!
//! A job walks `Requested → Acquiring → Loading → AwaitingCompletion →
//! Extracting → PostProcessing → Writing → Released`. The session lease is held
//! as a local for the whole walk, so it is released exactly once on every exit
//! path, before the caller builds its response.

use std::{
    fmt::Write as _,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use super::{
    artifacts::{self, StagedArtifact},
    automation::{AutomationError, BrowserSession, ConsoleLevel},
    pool::{PoolError, SessionPool},
    raster::{CropRegion, RasterError, RasterTool, RasterTransform, SvgOptimizer},
};
use crate::domain::job::{ArtifactPaths, RenderJob};

const COMPLETION_FLAG: &str = "done";
const STATS_SELECTOR: &str = "#goaljson";
const GRAPH_SELECTOR: &str = "svg";
const ZOOM_SELECTOR: &str = ".zoomarea";
const SVG_PROLOG: &str = "<?xml version=\"1.0\" standalone=\"no\"?>\n";
const DEFAULT_BORDER_COLOR: &str = "black";
const PARSE_EXCERPT_CHARS: usize = 200;
const RETRY_HINT: &str = "Please retry in a few seconds.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Absolute path of the rendering document.
    pub page_path: PathBuf,
    pub page_timeout: Duration,
    pub input_retry_delay: Duration,
    pub public_base_url: String,
    pub palette_path: PathBuf,
    pub thumbnail_size: (u32, u32),
    /// Jobs past this many in flight are turned away before touching the pool.
    pub max_concurrent_renders: NonZeroUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderErrorKind {
    NotFound,
    PoolExhausted,
    Navigation,
    NavigationTimeout,
    CompletionTimeout,
    Extraction,
    PostProcessing,
    Internal,
}

impl RenderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderErrorKind::NotFound => "not_found",
            RenderErrorKind::PoolExhausted => "pool_exhausted",
            RenderErrorKind::Navigation => "navigation",
            RenderErrorKind::NavigationTimeout => "navigation_timeout",
            RenderErrorKind::CompletionTimeout => "completion_timeout",
            RenderErrorKind::Extraction => "extraction",
            RenderErrorKind::PostProcessing => "post_processing",
            RenderErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(
        "Server at capacity: {active}/{limit} concurrent renders active. {hint}",
        hint = RETRY_HINT
    )]
    AtCapacity { active: usize, limit: usize },
    #[error("Could not find directory {}", .0.display())]
    OutputDirMissing(PathBuf),
    #[error("Could not find file {} after second try", .0.display())]
    InputMissing(PathBuf),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("page navigation failed: {0}")]
    Navigation(AutomationError),
    #[error("page navigation timed out after {0:?}")]
    NavigationTimeout(Duration),
    #[error("page did not finish rendering within {0:?}")]
    CompletionTimeout(Duration),
    #[error("{0}")]
    Extraction(String),
    #[error(transparent)]
    PostProcessing(#[from] RasterError),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl RenderError {
    pub fn kind(&self) -> RenderErrorKind {
        match self {
            RenderError::OutputDirMissing(_) | RenderError::InputMissing(_) => {
                RenderErrorKind::NotFound
            }
            RenderError::AtCapacity { .. } | RenderError::Pool(PoolError::Exhausted { .. }) => {
                RenderErrorKind::PoolExhausted
            }
            RenderError::Pool(PoolError::SessionOpen(_)) => RenderErrorKind::Navigation,
            RenderError::Pool(PoolError::Disconnected) => RenderErrorKind::Internal,
            RenderError::Navigation(_) => RenderErrorKind::Navigation,
            RenderError::NavigationTimeout(_) => RenderErrorKind::NavigationTimeout,
            RenderError::CompletionTimeout(_) => RenderErrorKind::CompletionTimeout,
            RenderError::Extraction(_) => RenderErrorKind::Extraction,
            RenderError::PostProcessing(_) => RenderErrorKind::PostProcessing,
            RenderError::Internal(_) => RenderErrorKind::Internal,
        }
    }

    /// Failures that are not the job's fault and map to a 500 response.
    pub fn is_internal(&self) -> bool {
        self.kind() == RenderErrorKind::Internal
    }

    fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        RenderError::Internal(format!("{context}: {err}"))
    }

    fn extraction(context: &str, err: AutomationError) -> Self {
        match err {
            AutomationError::Disconnected => RenderError::Internal(err.to_string()),
            other => RenderError::Extraction(format!("{context}: {other}")),
        }
    }
}

/// Per-request log buffer. Every line carries the request tag.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    tag: String,
    buffer: String,
}

impl RequestLog {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            buffer: String::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Append `message` as one tagged line; embedded newlines are re-tagged.
    pub fn line(&mut self, message: impl AsRef<str>) {
        for part in message.as_ref().split('\n') {
            let _ = writeln!(self.buffer, "{}{part}", self.tag);
        }
    }

    /// Append `text` without tagging.
    pub fn append(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    pub fn timing(&mut self, label: &str, started_at: Instant) {
        self.line(format!(
            "{label}: {:.3}ms",
            started_at.elapsed().as_secs_f64() * 1000.0
        ));
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn into_string(self) -> String {
        self.buffer
    }
}

/// Outcome of one job. Artifact flags record what reached its canonical path.
#[derive(Debug)]
pub struct RenderResult {
    pub artifacts: ArtifactPaths,
    pub vector_graphic: Option<String>,
    pub raster_written: bool,
    pub thumbnail_written: bool,
    pub json_stats: Option<Map<String, Value>>,
    pub error: Option<RenderError>,
    pub log: RequestLog,
}

impl RenderResult {
    fn new(artifacts: ArtifactPaths, log: RequestLog) -> Self {
        Self {
            artifacts,
            vector_graphic: None,
            raster_written: false,
            thumbnail_written: false,
            json_stats: None,
            error: None,
            log,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One admitted job; dropping it frees the place.
struct RenderPermit<'a> {
    active: &'a AtomicUsize,
}

impl Drop for RenderPermit<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct RenderPipeline {
    pool: SessionPool,
    raster: Arc<dyn RasterTool>,
    svg_optimizer: Arc<dyn SvgOptimizer>,
    config: PipelineConfig,
    active_renders: AtomicUsize,
}

impl RenderPipeline {
    pub fn new(
        pool: SessionPool,
        raster: Arc<dyn RasterTool>,
        svg_optimizer: Arc<dyn SvgOptimizer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pool,
            raster,
            svg_optimizer,
            config,
            active_renders: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn active_renders(&self) -> usize {
        self.active_renders.load(Ordering::SeqCst)
    }

    fn admit(&self) -> Result<RenderPermit<'_>, RenderError> {
        let limit = self.config.max_concurrent_renders.get();
        match self
            .active_renders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < limit).then_some(active + 1)
            }) {
            Ok(_) => Ok(RenderPermit {
                active: &self.active_renders,
            }),
            Err(active) => {
                counter!("jsbrain_render_rejected_total").increment(1);
                Err(RenderError::AtCapacity { active, limit })
            }
        }
    }

    /// Run `job` to completion. Never fails: errors are carried in the result
    /// together with the log gathered up to the failure.
    pub async fn run(&self, job: &RenderJob, log: RequestLog) -> RenderResult {
        let started_at = Instant::now();
        let mut result = RenderResult::new(job.artifacts(), log);

        if let Err(err) = self.render(job, &mut result).await {
            let kind = err.kind();
            result.log.line(format!("ERROR: {err}"));
            counter!("jsbrain_render_failures_total", "kind" => kind.as_str()).increment(1);
            if err.is_internal() {
                error!(
                    target = "application::pipeline",
                    op = "pipeline::run",
                    request_id = job.request_id,
                    slug = %job.slug,
                    result = "error",
                    error_kind = kind.as_str(),
                    error = %err,
                    "Render job failed"
                );
            } else {
                warn!(
                    target = "application::pipeline",
                    op = "pipeline::run",
                    request_id = job.request_id,
                    slug = %job.slug,
                    result = "error",
                    error_kind = kind.as_str(),
                    error = %err,
                    "Render job failed"
                );
            }
            result.error = Some(err);
        } else {
            info!(
                target = "application::pipeline",
                op = "pipeline::run",
                request_id = job.request_id,
                slug = %job.slug,
                graph = !job.suppress_graph,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                result = "ok",
                "Render job completed"
            );
        }

        histogram!("jsbrain_render_ms").record(started_at.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn render(&self, job: &RenderJob, result: &mut RenderResult) -> Result<(), RenderError> {
        let _permit = self.admit()?;
        let paths = result.artifacts.clone();

        if !artifacts::is_dir(&job.output_dir).await {
            return Err(RenderError::OutputDirMissing(job.output_dir.clone()));
        }
        let goal_file = job.goal_file();
        if !artifacts::wait_for_file(&goal_file, self.config.input_retry_delay).await {
            return Err(RenderError::InputMissing(goal_file));
        }

        if job.suppress_graph {
            artifacts::remove_if_present(paths.graph_files())
                .await
                .map_err(|err| RenderError::internal("could not remove stale graph files", err))?;
        }

        let url = self.document_url(&goal_file, job.suppress_graph)?;

        let acquire_started = Instant::now();
        let lease = self.pool.acquire().await?;
        result
            .log
            .timing(&format!(" Session acquire ({})", job.slug), acquire_started);
        let session = lease.session();

        // Entries left over from the slot's previous job.
        let _ = session.drain_console().await;

        let timeout = self.config.page_timeout;
        let load_started = Instant::now();
        session
            .navigate(url.as_str(), timeout)
            .await
            .map_err(|err| match err {
                AutomationError::Timeout(_) => RenderError::NavigationTimeout(timeout),
                AutomationError::Disconnected => RenderError::Internal(err.to_string()),
                other => RenderError::Navigation(other),
            })?;

        let waited = session.wait_for_condition(COMPLETION_FLAG, timeout).await;
        collect_console(session, &mut result.log).await;
        waited.map_err(|err| match err {
            AutomationError::Timeout(_) => RenderError::CompletionTimeout(timeout),
            AutomationError::Disconnected => RenderError::Internal(err.to_string()),
            other => RenderError::Navigation(other),
        })?;
        result
            .log
            .timing(&format!(" Page render ({})", job.slug), load_started);

        let stats = self.extract_stats(session, &paths).await?;
        let encoded = serde_json::to_vec(&stats)
            .map_err(|err| RenderError::internal("could not encode statistics", err))?;
        artifacts::write_atomic(&paths.json, &encoded)
            .await
            .map_err(|err| RenderError::internal("could not write JSON", err))?;
        let border_color = stats
            .get("color")
            .and_then(Value::as_str)
            .filter(|color| !color.is_empty())
            .unwrap_or(DEFAULT_BORDER_COLOR)
            .to_string();
        result.json_stats = Some(stats);

        if job.suppress_graph {
            return Ok(());
        }

        let graph_started = Instant::now();
        let markup = session
            .outer_html(GRAPH_SELECTOR)
            .await
            .map_err(|err| RenderError::extraction("could not read SVG element", err))?
            .ok_or_else(|| RenderError::Extraction("Could not find SVG element on page!".into()))?;
        let document = format!("{SVG_PROLOG}{markup}");

        let staged_svg = StagedArtifact::new(&paths.svg);
        staged_svg
            .write(document.as_bytes())
            .await
            .map_err(|err| RenderError::internal("could not write SVG", err))?;
        if job.optimization.optimizes_vector() {
            self.svg_optimizer.optimize(staged_svg.temp_path()).await?;
        }
        staged_svg
            .commit()
            .await
            .map_err(|err| RenderError::internal("could not write SVG", err))?;
        result.vector_graphic = Some(document);

        let zoom = session
            .bounding_box(ZOOM_SELECTOR)
            .await
            .map_err(|err| RenderError::extraction("could not read zoom area", err))?
            .ok_or_else(|| {
                RenderError::Extraction("Could not find .zoomarea element on page!".into())
            })?;
        let crop = CropRegion::from_zoom_area(&zoom);

        let staged_png = StagedArtifact::new(&paths.png);
        if job.optimization.derives_raster() {
            self.raster
                .transform(&paths.svg, staged_png.temp_path(), &RasterTransform::convert())
                .await?;
        } else {
            let snapshot = session
                .screenshot_element(GRAPH_SELECTOR)
                .await
                .map_err(|err| RenderError::extraction("could not take screenshot", err))?;
            staged_png
                .write(&snapshot)
                .await
                .map_err(|err| RenderError::internal("could not write PNG", err))?;
        }

        let staged_thumb = StagedArtifact::new(&paths.thumbnail);
        let thumbnail = RasterTransform::thumbnail(
            crop,
            self.config.thumbnail_size,
            border_color,
            &self.config.palette_path,
        );
        self.raster
            .transform(staged_png.temp_path(), staged_thumb.temp_path(), &thumbnail)
            .await?;
        staged_thumb
            .commit()
            .await
            .map_err(|err| RenderError::internal("could not write thumbnail", err))?;
        result.thumbnail_written = true;

        let quantize = RasterTransform::quantize(&self.config.palette_path);
        self.raster
            .transform(staged_png.temp_path(), staged_png.temp_path(), &quantize)
            .await?;
        staged_png
            .commit()
            .await
            .map_err(|err| RenderError::internal("could not write PNG", err))?;
        result.raster_written = true;

        result
            .log
            .timing(&format!(" Graph output ({})", job.slug), graph_started);

        lease.release();
        Ok(())
    }

    /// `file://<page>?bb=file://<goal>&NOGRAPH=<bool>`
    fn document_url(&self, goal_file: &Path, suppress_graph: bool) -> Result<Url, RenderError> {
        let goal = std::path::absolute(goal_file)
            .map_err(|err| RenderError::internal("could not resolve goal file path", err))?;
        let goal_url = Url::from_file_path(&goal).map_err(|()| {
            RenderError::Internal(format!("goal path {} is not absolute", goal.display()))
        })?;
        let mut url = Url::from_file_path(&self.config.page_path).map_err(|()| {
            RenderError::Internal(format!(
                "document path {} is not absolute",
                self.config.page_path.display()
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("bb", goal_url.as_str())
            .append_pair("NOGRAPH", if suppress_graph { "true" } else { "false" });
        Ok(url)
    }

    async fn extract_stats(
        &self,
        session: &dyn BrowserSession,
        paths: &ArtifactPaths,
    ) -> Result<Map<String, Value>, RenderError> {
        let raw = session
            .inner_html(STATS_SELECTOR)
            .await
            .map_err(|err| RenderError::extraction("could not read #goaljson", err))?
            .ok_or_else(|| {
                RenderError::Extraction("Could not find #goaljson element on page!".into())
            })?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RenderError::Extraction(
                "Could not extract JSON from page!".into(),
            ));
        }

        let parsed: Value = serde_json::from_str(raw).map_err(|err| {
            let excerpt: String = raw.chars().take(PARSE_EXCERPT_CHARS).collect();
            RenderError::Extraction(format!(
                "Could not parse JSON: {err}. JSON start: {excerpt}"
            ))
        })?;
        let Value::Object(mut stats) = parsed else {
            return Err(RenderError::Extraction(
                "Goal JSON is not an object".into(),
            ));
        };

        let base = &self.config.public_base_url;
        stats.insert(
            "graphurl".into(),
            Value::String(format!("{base}{}", paths.png.display())),
        );
        stats.insert(
            "svgurl".into(),
            Value::String(format!("{base}{}", paths.svg.display())),
        );
        stats.insert(
            "thumburl".into(),
            Value::String(format!("{base}{}", paths.thumbnail.display())),
        );
        Ok(stats)
    }
}

async fn collect_console(session: &dyn BrowserSession, log: &mut RequestLog) {
    match session.drain_console().await {
        Ok(entries) => {
            for entry in entries {
                let label = match entry.level {
                    ConsoleLevel::Log => "PAGE LOG",
                    ConsoleLevel::Error => "PAGE ERROR",
                };
                log.line(format!(" {label}: {}", entry.message));
            }
        }
        Err(err) => warn!(
            target = "application::pipeline",
            op = "pipeline::collect_console",
            session = session.id(),
            error = %err,
            "Could not collect page console output"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_log_tags_every_line() {
        let mut log = RequestLog::new("(1:7) ");
        log.line("first\nsecond");
        log.append("raw\n");
        assert_eq!(log.as_str(), "(1:7) first\n(1:7) second\nraw\n");
    }

    #[test]
    fn pool_errors_map_to_distinct_kinds() {
        assert_eq!(
            RenderError::from(PoolError::Exhausted { capacity: 5 }).kind(),
            RenderErrorKind::PoolExhausted
        );
        assert!(RenderError::from(PoolError::Disconnected).is_internal());
        assert_eq!(
            RenderError::NavigationTimeout(Duration::from_secs(1)).kind(),
            RenderErrorKind::NavigationTimeout
        );
        assert_ne!(
            RenderError::CompletionTimeout(Duration::from_secs(1)).kind(),
            RenderErrorKind::NavigationTimeout
        );
    }

    #[test]
    fn capacity_rejection_is_a_fail_fast_error() {
        let err = RenderError::AtCapacity {
            active: 2,
            limit: 2,
        };
        assert_eq!(err.kind(), RenderErrorKind::PoolExhausted);
        assert!(!err.is_internal());
        assert_eq!(
            err.to_string(),
            "Server at capacity: 2/2 concurrent renders active. Please retry in a few seconds."
        );
    }

    #[test]
    fn not_found_errors_name_the_missing_path() {
        let err = RenderError::InputMissing(PathBuf::from("/in/alice+loseit.bb"));
        assert_eq!(err.kind(), RenderErrorKind::NotFound);
        assert!(err.to_string().contains("/in/alice+loseit.bb"));
    }
}
