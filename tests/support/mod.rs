#![allow(dead_code)]

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use jsbrain_server::application::{
    automation::{
        AutomationEnvironment, AutomationError, BoundingBox, BrowserSession, ConsoleEntry,
    },
    mediator::{JobMediator, WorkerIdentity},
    pipeline::PipelineConfig,
    pool::PoolConfig,
    raster::{RasterError, RasterTool, RasterTransform, SvgOptimizer},
    worker::{WorkerComponents, WorkerContext},
};
use tokio::sync::Notify;

pub const GOAL_STATS: &str =
    r#"{"limsum":"+2 in 3 days","color":"red","lane":-1,"safebuf":3,"error":""}"#;
pub const GRAPH_MARKUP: &str =
    r#"<svg xmlns="http://www.w3.org/2000/svg"><g class="zoomarea"/></svg>"#;
pub const SCREENSHOT: &[u8] = b"\x89PNG fake screenshot";

/// What the rendering document produces once loaded.
#[derive(Clone, Debug)]
pub struct PageScript {
    pub stats: Option<String>,
    pub graph: Option<String>,
    pub zoom_area: Option<BoundingBox>,
    pub console: Vec<ConsoleEntry>,
    pub completes: bool,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            stats: Some(GOAL_STATS.to_string()),
            graph: Some(GRAPH_MARKUP.to_string()),
            zoom_area: Some(BoundingBox {
                x: 10.0,
                y: 20.0,
                width: 100.0,
                height: 50.0,
            }),
            console: vec![ConsoleEntry::log("goal loaded")],
            completes: true,
        }
    }
}

/// In-memory automation environment that records session traffic.
#[derive(Default)]
pub struct FakeEnvironment {
    script: Mutex<PageScript>,
    gate: Option<Arc<Notify>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    navigations: Arc<Mutex<Vec<String>>>,
}

impl FakeEnvironment {
    pub fn new(script: PageScript) -> Self {
        Self {
            script: Mutex::new(script),
            ..Default::default()
        }
    }

    /// Navigation blocks until `gate` is notified.
    pub fn gated(script: PageScript, gate: Arc<Notify>) -> Self {
        Self {
            script: Mutex::new(script),
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().expect("navigations").clone()
    }
}

#[async_trait]
impl AutomationEnvironment for FakeEnvironment {
    async fn open_session(&self) -> Result<Arc<dyn BrowserSession>, AutomationError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            id: format!("fake-{n}"),
            script: self.script.lock().expect("script").clone(),
            gate: self.gate.clone(),
            navigations: Arc::clone(&self.navigations),
            console_pending: AtomicBool::new(false),
        }))
    }

    async fn close_session(
        &self,
        _session: Arc<dyn BrowserSession>,
    ) -> Result<(), AutomationError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSession {
    id: String,
    script: PageScript,
    gate: Option<Arc<Notify>>,
    navigations: Arc<Mutex<Vec<String>>>,
    console_pending: AtomicBool,
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), AutomationError> {
        self.navigations
            .lock()
            .expect("navigations")
            .push(url.to_string());
        if let Some(gate) = self.gate.as_ref() {
            gate.notified().await;
        }
        self.console_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_condition(
        &self,
        _expression: &str,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        if self.script.completes {
            Ok(())
        } else {
            Err(AutomationError::Timeout(timeout))
        }
    }

    async fn inner_html(&self, _selector: &str) -> Result<Option<String>, AutomationError> {
        Ok(self.script.stats.clone())
    }

    async fn outer_html(&self, _selector: &str) -> Result<Option<String>, AutomationError> {
        Ok(self.script.graph.clone())
    }

    async fn bounding_box(&self, _selector: &str) -> Result<Option<BoundingBox>, AutomationError> {
        Ok(self.script.zoom_area)
    }

    async fn screenshot_element(&self, _selector: &str) -> Result<Vec<u8>, AutomationError> {
        Ok(SCREENSHOT.to_vec())
    }

    async fn drain_console(&self) -> Result<Vec<ConsoleEntry>, AutomationError> {
        if self.console_pending.swap(false, Ordering::SeqCst) {
            Ok(self.script.console.clone())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Raster tool that copies its input and records each transform.
#[derive(Default)]
pub struct CopyRaster {
    transforms: Mutex<Vec<RasterTransform>>,
    fail_resized: AtomicBool,
}

impl CopyRaster {
    /// Fail every transform that resizes, i.e. thumbnail generation.
    pub fn failing_thumbnails() -> Self {
        Self {
            fail_resized: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn transforms(&self) -> Vec<RasterTransform> {
        self.transforms.lock().expect("transforms").clone()
    }
}

#[async_trait]
impl RasterTool for CopyRaster {
    async fn transform(
        &self,
        source: &Path,
        output: &Path,
        transform: &RasterTransform,
    ) -> Result<(), RasterError> {
        self.transforms
            .lock()
            .expect("transforms")
            .push(transform.clone());
        if transform.resize.is_some() && self.fail_resized.load(Ordering::SeqCst) {
            return Err(RasterError::Cli {
                exit_code: Some(1),
                stderr: "convert: no decode delegate".into(),
            });
        }
        if source != output {
            tokio::fs::copy(source, output).await.map_err(RasterError::Io)?;
        }
        Ok(())
    }
}

/// Optimizer that rewrites the file with a marker comment.
#[derive(Default)]
pub struct MarkingSvgo {
    runs: AtomicUsize,
}

impl MarkingSvgo {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SvgOptimizer for MarkingSvgo {
    async fn optimize(&self, path: &Path) -> Result<(), RasterError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut contents = tokio::fs::read_to_string(path)
            .await
            .map_err(RasterError::Io)?;
        contents.push_str("<!-- optimized -->");
        tokio::fs::write(path, contents)
            .await
            .map_err(RasterError::Io)
    }
}

pub struct Harness {
    pub worker: WorkerContext,
    pub environment: Arc<FakeEnvironment>,
    pub raster: Arc<CopyRaster>,
    pub svgo: Arc<MarkingSvgo>,
}

impl Harness {
    pub fn mediator(&self) -> Arc<JobMediator> {
        self.worker.mediator()
    }
}

pub struct HarnessBuilder {
    environment: FakeEnvironment,
    raster: CopyRaster,
    capacity: usize,
    max_renders: usize,
    retry_delay: Duration,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            environment: FakeEnvironment::new(PageScript::default()),
            raster: CopyRaster::default(),
            capacity: 2,
            max_renders: 4,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn environment(mut self, environment: FakeEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn raster(mut self, raster: CopyRaster) -> Self {
        self.raster = raster;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_renders(mut self, max_renders: usize) -> Self {
        self.max_renders = max_renders;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn build(self) -> Harness {
        let environment = Arc::new(self.environment);
        let raster = Arc::new(self.raster);
        let svgo = Arc::new(MarkingSvgo::default());
        let worker = WorkerContext::new(
            WorkerIdentity {
                worker_id: 1,
                generation: 0,
                host: "render-test".into(),
            },
            WorkerComponents {
                environment: environment.clone(),
                raster: raster.clone(),
                svg_optimizer: svgo.clone(),
                pool: PoolConfig {
                    capacity: NonZeroUsize::new(self.capacity).expect("non-zero capacity"),
                    idle_grace: Duration::from_secs(3),
                    open_timeout: Duration::from_secs(5),
                },
                pipeline: PipelineConfig {
                    page_path: PathBuf::from("/srv/jsbrain/generate.html"),
                    page_timeout: Duration::from_secs(5),
                    input_retry_delay: self.retry_delay,
                    public_base_url: "http://brain.example/".into(),
                    palette_path: PathBuf::from("/srv/jsbrain/palette.png"),
                    thumbnail_size: (208, 136),
                    max_concurrent_renders: NonZeroUsize::new(self.max_renders)
                        .expect("non-zero render limit"),
                },
            },
        );
        Harness {
            worker,
            environment,
            raster,
            svgo,
        }
    }
}

/// Directory listing sorted by file name.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}
