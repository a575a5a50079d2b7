//! Job mediator: turns a render query into exactly one pipeline run and maps
//! the outcome onto the response document.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::info;

use super::{
    compare,
    error::AppError,
    pipeline::{RenderPipeline, RenderResult, RequestLog},
};
use crate::domain::job::{self, GoalSlug, RasterOptimization, RenderJob};

const LOG_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub const PING_REPLY: &str = "pong";

const USAGE: &str = "Usage:<br/>\
URL?slug=filebase&inpath=/path/to/dir OR<br/>\
URL?user=username&goal=goalname&inpath=/path/to/dir<br/>\
<br/>You can also supply a path for output files with the \"outpath\" parameter<br/>\
An optional check against a reference JSON can be initiated with the \"pyjson\" parameter<br/>\
Pass \"nograph\" to skip graph generation and \"svgo=0|1|2\" to optimize the SVG output<br/>";

/// Raw query parameters. Unknown parameters are ignored by deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderQuery {
    pub ping: Option<String>,
    pub inpath: Option<String>,
    pub outpath: Option<String>,
    pub slug: Option<String>,
    pub user: Option<String>,
    pub goal: Option<String>,
    pub pyjson: Option<String>,
    pub nograph: Option<String>,
    pub svgo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing \"inpath\"")]
    MissingInputPath,
    #[error("one of \"slug\" or (\"user\",\"goal\") must be supplied")]
    MissingSlug,
    #[error("\"slug\" and (\"user\",\"goal\") cannot be used together")]
    ConflictingSlug,
    #[error("invalid slug: {0}")]
    InvalidSlug(String),
    #[error("\"svgo\" must be 0, 1 or 2, got `{0}`")]
    InvalidOptimization(String),
}

impl ValidationError {
    /// Body returned to the caller, including usage instructions.
    pub fn usage_message(&self) -> String {
        match self {
            ValidationError::MissingInputPath => {
                format!("Bad URL parameters: Missing \"inpath\"<br/><br/>{USAGE}")
            }
            ValidationError::MissingSlug => format!(
                "Bad URL parameters: One of \"slug\" or (\"user\",\"goal\") must be supplied!<br/><br/>{USAGE}"
            ),
            ValidationError::ConflictingSlug => format!(
                "Bad URL parameters: \"slug\" and (\"user\",\"goal\") cannot be used together!<br/><br/>{USAGE}"
            ),
            other => format!("Bad URL parameters: {other}<br/><br/>{USAGE}"),
        }
    }
}

/// Validated render parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderParams {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub slug: GoalSlug,
    pub reference: Option<PathBuf>,
    pub suppress_graph: bool,
    pub optimization: RasterOptimization,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderRequest {
    Ping,
    Render(RenderParams),
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

fn truthy(value: &Option<String>) -> bool {
    match value.as_deref() {
        None => false,
        Some(flag) => !matches!(flag.trim(), "false" | "0"),
    }
}

impl RenderQuery {
    pub fn validate(&self) -> Result<RenderRequest, ValidationError> {
        if self.ping.is_some() {
            return Ok(RenderRequest::Ping);
        }

        let input_dir = present(&self.inpath).ok_or(ValidationError::MissingInputPath)?;
        let slug = match (present(&self.slug), present(&self.user), present(&self.goal)) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(ValidationError::ConflictingSlug);
            }
            (Some(slug), None, None) => GoalSlug::parse(slug),
            (None, Some(user), Some(goal)) => GoalSlug::from_user_goal(user, goal),
            (None, _, _) => return Err(ValidationError::MissingSlug),
        }
        .map_err(|err| ValidationError::InvalidSlug(err.to_string()))?;

        let optimization = match present(&self.svgo) {
            None => RasterOptimization::None,
            Some(raw) => raw
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(RasterOptimization::from_level)
                .ok_or_else(|| ValidationError::InvalidOptimization(raw.to_string()))?,
        };

        Ok(RenderRequest::Render(RenderParams {
            input_dir: PathBuf::from(input_dir),
            output_dir: PathBuf::from(present(&self.outpath).unwrap_or(input_dir)),
            slug,
            reference: present(&self.pyjson).map(PathBuf::from),
            suppress_graph: truthy(&self.nograph),
            optimization,
        }))
    }
}

/// Response document for a render request. Artifact fields are `null` when the
/// artifact was not produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResponse {
    pub inpath: String,
    pub outpath: String,
    pub slug: String,
    pub host: String,
    pub process: u32,
    pub request: u64,
    pub log: String,
    pub bb: Option<String>,
    pub svg: Option<String>,
    pub png: Option<String>,
    pub json: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorReply {
    Pong,
    Rendered(Box<RenderResponse>),
}

/// Stable identity of the worker process serving requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: u32,
    pub generation: u32,
    pub host: String,
}

impl WorkerIdentity {
    pub fn tag(&self, request_id: u64) -> String {
        format!("({}:{request_id}) ", self.worker_id)
    }
}

struct PendingGuard<'a> {
    counter: &'a AtomicUsize,
    active: bool,
}

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter,
            active: true,
        }
    }

    /// Leave and return the number of jobs still pending.
    fn leave(mut self) -> usize {
        self.active = false;
        self.counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct JobMediator {
    identity: WorkerIdentity,
    pipeline: Arc<RenderPipeline>,
    next_request: AtomicU64,
    pending: AtomicUsize,
}

impl JobMediator {
    pub fn new(identity: WorkerIdentity, pipeline: Arc<RenderPipeline>) -> Self {
        Self {
            identity,
            pipeline,
            next_request: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Validate `query` and, unless it is a ping, run one render job.
    ///
    /// Pipeline errors are reported inside the response; only internal
    /// failures surface as `Err`.
    pub async fn handle(&self, query: &RenderQuery) -> Result<MediatorReply, AppError> {
        let params = match query.validate()? {
            RenderRequest::Ping => return Ok(MediatorReply::Pong),
            RenderRequest::Render(params) => params,
        };

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let job = RenderJob::new(
            request_id,
            params.input_dir.clone(),
            params.output_dir.clone(),
            params.slug.clone(),
        )
        .with_suppressed_graph(params.suppress_graph)
        .with_optimization(params.optimization);

        let pending = PendingGuard::enter(&self.pending);
        let started_at = Instant::now();
        let mut log = RequestLog::new(self.identity.tag(request_id));
        log.line(format!(
            "<BEEBRAIN> {} @ {}",
            job.slug.short(),
            format_timestamp(job.started_at)
        ));

        let mut result = self.pipeline.run(&job, log).await;

        if result.is_success()
            && let (Some(reference), Some(stats)) = (&params.reference, &result.json_stats)
        {
            compare::compare_with_reference(stats, reference, &mut result.log).await;
        }

        result
            .log
            .timing(&format!(" Total processing ({})", job.slug), started_at);
        let remaining = pending.leave();
        result
            .log
            .line(format!("</BEEBRAIN> (pending: {remaining})"));

        let outcome = if result.is_success() { "ok" } else { "error" };
        info!(
            target = "application::mediator",
            op = "mediator::handle",
            worker_id = self.identity.worker_id,
            request_id,
            slug = %job.slug,
            pending = remaining,
            result = outcome,
            log = %result.log.as_str(),
            "Render request finished"
        );

        if let Some(err) = result.error.take_if(|err| err.is_internal()) {
            return Err(AppError::Render(err));
        }

        Ok(MediatorReply::Rendered(Box::new(
            self.build_response(&params, request_id, result),
        )))
    }

    fn build_response(
        &self,
        params: &RenderParams,
        request_id: u64,
        result: RenderResult,
    ) -> RenderResponse {
        let display = |path: &std::path::Path| path.display().to_string();
        let succeeded = result.is_success();
        RenderResponse {
            inpath: display(&params.input_dir),
            outpath: display(&params.output_dir),
            slug: params.slug.to_string(),
            host: self.identity.host.clone(),
            process: self.identity.worker_id,
            request: request_id,
            bb: succeeded.then(|| display(&job::goal_file(&params.input_dir, &params.slug))),
            svg: result
                .vector_graphic
                .as_ref()
                .map(|_| display(&result.artifacts.svg)),
            png: result.raster_written.then(|| display(&result.artifacts.png)),
            json: result
                .json_stats
                .as_ref()
                .map(|_| display(&result.artifacts.json)),
            error: result
                .error
                .as_ref()
                .map(|err| format!("Processing error: {err}")),
            log: result.log.into_string(),
        }
    }
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(LOG_TIMESTAMP)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> RenderQuery {
        let mut query = RenderQuery::default();
        for (key, value) in pairs {
            let value = Some((*value).to_string());
            match *key {
                "ping" => query.ping = value,
                "inpath" => query.inpath = value,
                "outpath" => query.outpath = value,
                "slug" => query.slug = value,
                "user" => query.user = value,
                "goal" => query.goal = value,
                "pyjson" => query.pyjson = value,
                "nograph" => query.nograph = value,
                "svgo" => query.svgo = value,
                other => panic!("unknown key {other}"),
            }
        }
        query
    }

    fn params(pairs: &[(&str, &str)]) -> RenderParams {
        match query(pairs).validate().expect("valid query") {
            RenderRequest::Render(params) => params,
            RenderRequest::Ping => panic!("unexpected ping"),
        }
    }

    #[test]
    fn ping_short_circuits_validation() {
        assert_eq!(query(&[("ping", "")]).validate(), Ok(RenderRequest::Ping));
    }

    #[test]
    fn missing_inpath_is_rejected_first() {
        assert_eq!(
            query(&[("slug", "alice+loseit")]).validate(),
            Err(ValidationError::MissingInputPath)
        );
        assert_eq!(
            query(&[("inpath", ""), ("slug", "alice+loseit")]).validate(),
            Err(ValidationError::MissingInputPath)
        );
    }

    #[test]
    fn slug_forms_are_exclusive() {
        assert_eq!(
            query(&[("inpath", "/in")]).validate(),
            Err(ValidationError::MissingSlug)
        );
        assert_eq!(
            query(&[("inpath", "/in"), ("user", "alice")]).validate(),
            Err(ValidationError::MissingSlug)
        );
        assert_eq!(
            query(&[("inpath", "/in"), ("slug", "a+b"), ("goal", "b")]).validate(),
            Err(ValidationError::ConflictingSlug)
        );
    }

    #[test]
    fn user_and_goal_build_slug_and_outpath_defaults_to_inpath() {
        let params = params(&[("inpath", "/in"), ("user", "alice"), ("goal", "loseit")]);
        assert_eq!(params.slug.as_str(), "alice+loseit");
        assert_eq!(params.output_dir, PathBuf::from("/in"));
        assert!(!params.suppress_graph);
        assert_eq!(params.optimization, RasterOptimization::None);
    }

    #[test]
    fn nograph_is_truthy_unless_false_or_zero() {
        let base = [("inpath", "/in"), ("slug", "a+b")];
        for (value, expected) in [
            ("1", true),
            ("", true),
            ("yes", true),
            ("false", false),
            ("0", false),
        ] {
            let mut pairs = base.to_vec();
            pairs.push(("nograph", value));
            assert_eq!(params(&pairs).suppress_graph, expected, "nograph={value}");
        }
    }

    #[test]
    fn svgo_accepts_only_known_levels() {
        let params = params(&[("inpath", "/in"), ("slug", "a+b"), ("svgo", "2")]);
        assert_eq!(params.optimization, RasterOptimization::VectorAndRaster);
        assert!(matches!(
            query(&[("inpath", "/in"), ("slug", "a+b"), ("svgo", "3")]).validate(),
            Err(ValidationError::InvalidOptimization(_))
        ));
    }

    #[test]
    fn usage_message_explains_parameters() {
        let message = ValidationError::ConflictingSlug.usage_message();
        assert!(message.starts_with("Bad URL parameters:"));
        assert!(message.contains("URL?user=username&goal=goalname&inpath=/path/to/dir"));
    }

    #[test]
    fn pending_guard_reports_remaining_jobs() {
        let counter = AtomicUsize::new(0);
        let outer = PendingGuard::enter(&counter);
        let inner = PendingGuard::enter(&counter);
        assert_eq!(inner.leave(), 1);
        drop(outer);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn log_timestamp_uses_calendar_format() {
        let at = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(format_timestamp(at), "2024-03-05 07:08:09");
    }
}
