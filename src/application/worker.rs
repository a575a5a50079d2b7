//! Per-worker lifecycle: `Starting → Serving → (Draining | Disconnected)`.
//!
//! A [`WorkerContext`] owns everything a single render worker shares across
//! requests: its identity, session pool and job mediator. It holds no
//! transport or process concerns; the binary wires those around it.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use tracing::{error, info};

use super::{
    automation::AutomationEnvironment,
    mediator::{JobMediator, WorkerIdentity},
    pipeline::{PipelineConfig, RenderPipeline},
    pool::{PoolConfig, SessionPool},
    raster::{RasterTool, SvgOptimizer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Serving,
    Draining,
    Disconnected,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Serving,
            1 => WorkerState::Draining,
            _ => WorkerState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Serving => 0,
            WorkerState::Draining => 1,
            WorkerState::Disconnected => 2,
        }
    }
}

/// Collaborators a worker is built from.
pub struct WorkerComponents {
    pub environment: Arc<dyn AutomationEnvironment>,
    pub raster: Arc<dyn RasterTool>,
    pub svg_optimizer: Arc<dyn SvgOptimizer>,
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
}

pub struct WorkerContext {
    pool: SessionPool,
    mediator: Arc<JobMediator>,
    state: AtomicU8,
}

impl WorkerContext {
    pub fn new(identity: WorkerIdentity, components: WorkerComponents) -> Self {
        let WorkerComponents {
            environment,
            raster,
            svg_optimizer,
            pool,
            pipeline,
        } = components;

        let pool = SessionPool::new(environment, pool);
        let pipeline = Arc::new(RenderPipeline::new(
            pool.clone(),
            raster,
            svg_optimizer,
            pipeline,
        ));
        let mediator = Arc::new(JobMediator::new(identity, pipeline));

        info!(
            target = "application::worker",
            op = "worker::start",
            worker_id = mediator.identity().worker_id,
            generation = mediator.identity().generation,
            pool_capacity = pool.capacity(),
            "Render worker ready"
        );

        Self {
            pool,
            mediator,
            state: AtomicU8::new(WorkerState::Serving.as_u8()),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        self.mediator.identity()
    }

    pub fn mediator(&self) -> Arc<JobMediator> {
        Arc::clone(&self.mediator)
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The automation environment is gone: discard every slot. The caller is
    /// expected to terminate the process afterwards.
    pub fn environment_lost(&self) -> usize {
        self.state
            .store(WorkerState::Disconnected.as_u8(), Ordering::SeqCst);
        let discarded = self.pool.on_environment_disconnected();
        error!(
            target = "application::worker",
            op = "worker::environment_lost",
            worker_id = self.identity().worker_id,
            discarded,
            pending = self.mediator.pending(),
            "Automation environment disconnected; worker must exit"
        );
        discarded
    }

    /// Close every browser session after the HTTP server stopped accepting.
    pub async fn drain(&self) {
        let previous = self
            .state
            .swap(WorkerState::Draining.as_u8(), Ordering::SeqCst);
        if WorkerState::from_u8(previous) == WorkerState::Disconnected {
            self.state
                .store(WorkerState::Disconnected.as_u8(), Ordering::SeqCst);
            return;
        }
        self.pool.close_all().await;
        info!(
            target = "application::worker",
            op = "worker::drain",
            worker_id = self.identity().worker_id,
            "Render worker drained"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::application::{
        pool::{PoolError, testing::CountingEnvironment},
        raster::{RasterError, RasterTransform},
    };

    struct NoopRaster;

    #[async_trait]
    impl RasterTool for NoopRaster {
        async fn transform(
            &self,
            _source: &std::path::Path,
            _output: &std::path::Path,
            _transform: &RasterTransform,
        ) -> Result<(), RasterError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SvgOptimizer for NoopRaster {
        async fn optimize(&self, _path: &std::path::Path) -> Result<(), RasterError> {
            Ok(())
        }
    }

    fn context(environment: Arc<CountingEnvironment>) -> WorkerContext {
        WorkerContext::new(
            WorkerIdentity {
                worker_id: 3,
                generation: 1,
                host: "render-1".into(),
            },
            WorkerComponents {
                environment,
                raster: Arc::new(NoopRaster),
                svg_optimizer: Arc::new(NoopRaster),
                pool: PoolConfig {
                    capacity: NonZeroUsize::new(2).expect("non-zero"),
                    idle_grace: Duration::from_secs(3),
                    open_timeout: Duration::from_secs(1),
                },
                pipeline: PipelineConfig {
                    page_path: PathBuf::from("/srv/jsbrain/generate.html"),
                    page_timeout: Duration::from_secs(40),
                    input_retry_delay: Duration::from_millis(250),
                    public_base_url: "http://brain.example/".into(),
                    palette_path: PathBuf::from("/srv/jsbrain/palette.png"),
                    thumbnail_size: (208, 136),
                    max_concurrent_renders: NonZeroUsize::new(2).expect("non-zero"),
                },
            },
        )
    }

    #[tokio::test]
    async fn environment_loss_disables_pool() {
        let environment = Arc::new(CountingEnvironment::default());
        let worker = context(environment.clone());
        let lease = worker.pool().acquire().await.expect("acquire");
        drop(lease);

        assert_eq!(worker.environment_lost(), 1);
        assert_eq!(worker.state(), WorkerState::Disconnected);
        assert_eq!(
            worker.pool().acquire().await.err(),
            Some(PoolError::Disconnected)
        );
    }

    #[tokio::test]
    async fn drain_closes_open_sessions() {
        let environment = Arc::new(CountingEnvironment::default());
        let worker = context(environment.clone());
        worker.pool().acquire().await.expect("acquire").release();

        worker.drain().await;

        assert_eq!(worker.state(), WorkerState::Draining);
        assert_eq!(environment.closed(), 1);
        assert_eq!(worker.identity().worker_id, 3);
    }
}
