//! Process supervisor: keeps a fixed number of render workers alive.
//!
//! Every exit, clean or not, is answered with exactly one replacement carrying
//! the same worker id and the next generation. There is no backoff and no
//! crash-loop detection. A launch that fails is retried after a fixed delay
//! while the remaining workers keep running.

use std::{
    ffi::OsString,
    fmt,
    num::NonZeroU32,
    path::PathBuf,
    pin::Pin,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
};
use metrics::counter;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use super::error::InfraError;

const RELAUNCH_DELAY: Duration = Duration::from_secs(1);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return WorkerExit::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return WorkerExit::Signal(signal);
            }
        }
        WorkerExit::Unknown
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {code}"),
            WorkerExit::Signal(signal) => write!(f, "signal {signal}"),
            WorkerExit::Unknown => f.write_str("unknown status"),
        }
    }
}

#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolve once the worker has exited.
    async fn wait(&mut self) -> WorkerExit;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        worker_id: u32,
        generation: u32,
    ) -> Result<Box<dyn WorkerProcess>, InfraError>;
}

struct Exited {
    worker_id: u32,
    generation: u32,
    pid: Option<u32>,
    exit: WorkerExit,
}

pub struct Supervisor<L> {
    launcher: L,
    workers: NonZeroU32,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, workers: NonZeroU32) -> Self {
        Self { launcher, workers }
    }

    /// Run until `shutdown` resolves. Live workers are dropped, which kills them.
    ///
    /// Returns the number of replacements spawned.
    pub async fn run<S>(&self, shutdown: S) -> u64
    where
        S: std::future::Future<Output = ()> + Send,
    {
        let mut running: FuturesUnordered<BoxFuture<'static, (Exited, Box<dyn WorkerProcess>)>> =
            FuturesUnordered::new();
        let mut relaunches: FuturesUnordered<BoxFuture<'static, (u32, u32)>> =
            FuturesUnordered::new();

        for worker_id in 1..=self.workers.get() {
            match self.launch(worker_id, 0).await {
                Some(process) => running.push(watch(worker_id, 0, process)),
                None => relaunches.push(relaunch_later(worker_id, 0)),
            }
        }
        info!(
            target = "infra::supervisor",
            op = "supervisor::start",
            workers = self.workers.get(),
            live = running.len(),
            "Supervisor started workers"
        );

        let mut shutdown: Pin<Box<S>> = Box::pin(shutdown);
        let mut restarts = 0_u64;

        loop {
            let (worker_id, generation) = tokio::select! {
                _ = &mut shutdown => break,
                Some((exited, _process)) = running.next(), if !running.is_empty() => {
                    warn!(
                        target = "infra::supervisor",
                        op = "supervisor::worker_exit",
                        worker_id = exited.worker_id,
                        generation = exited.generation,
                        pid = exited.pid.unwrap_or_default(),
                        exit = %exited.exit,
                        "Worker exited; spawning replacement"
                    );
                    (exited.worker_id, exited.generation.wrapping_add(1))
                }
                Some(retry) = relaunches.next(), if !relaunches.is_empty() => retry,
                else => break,
            };

            match self.launch(worker_id, generation).await {
                Some(process) => {
                    if generation > 0 {
                        restarts += 1;
                        counter!("jsbrain_worker_restarts_total").increment(1);
                    }
                    running.push(watch(worker_id, generation, process));
                }
                None => relaunches.push(relaunch_later(worker_id, generation)),
            }
        }

        info!(
            target = "infra::supervisor",
            op = "supervisor::shutdown",
            live = running.len(),
            restarts,
            "Supervisor stopping workers"
        );
        drop(running);
        restarts
    }

    async fn launch(&self, worker_id: u32, generation: u32) -> Option<Box<dyn WorkerProcess>> {
        match self.launcher.launch(worker_id, generation).await {
            Ok(process) => Some(process),
            Err(err) => {
                counter!("jsbrain_worker_launch_failures_total").increment(1);
                error!(
                    target = "infra::supervisor",
                    op = "supervisor::launch",
                    result = "error",
                    worker_id,
                    generation,
                    retry_in_ms = RELAUNCH_DELAY.as_millis() as u64,
                    error = %err,
                    "Failed to spawn worker; will retry"
                );
                None
            }
        }
    }
}

fn relaunch_later(worker_id: u32, generation: u32) -> BoxFuture<'static, (u32, u32)> {
    async move {
        tokio::time::sleep(RELAUNCH_DELAY).await;
        (worker_id, generation)
    }
    .boxed()
}

fn watch(
    worker_id: u32,
    generation: u32,
    mut process: Box<dyn WorkerProcess>,
) -> BoxFuture<'static, (Exited, Box<dyn WorkerProcess>)> {
    async move {
        let pid = process.pid();
        let exit = process.wait().await;
        (
            Exited {
                worker_id,
                generation,
                pid,
                exit,
            },
            process,
        )
    }
    .boxed()
}

/// Launches workers by re-executing the current binary in `worker` mode.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    global_args: Vec<OsString>,
    worker_flags: Vec<OsString>,
}

impl ProcessLauncher {
    /// `worker_flags` are appended after the `worker` subcommand, typically the
    /// supervisor's own command-line overrides.
    pub fn current_exe(
        config_file: Option<PathBuf>,
        worker_flags: Vec<OsString>,
    ) -> Result<Self, InfraError> {
        let program = std::env::current_exe()?;
        let mut global_args = Vec::new();
        if let Some(path) = config_file {
            global_args.push(OsString::from("--config-file"));
            global_args.push(path.into_os_string());
        }
        Ok(Self::new(program, global_args, worker_flags))
    }

    pub fn new(
        program: impl Into<PathBuf>,
        global_args: Vec<OsString>,
        worker_flags: Vec<OsString>,
    ) -> Self {
        Self {
            program: program.into(),
            global_args,
            worker_flags,
        }
    }

    pub(crate) fn worker_args(&self, worker_id: u32, generation: u32) -> Vec<OsString> {
        let mut args = self.global_args.clone();
        args.extend([
            OsString::from("worker"),
            OsString::from("--worker-id"),
            OsString::from(worker_id.to_string()),
            OsString::from("--generation"),
            OsString::from(generation.to_string()),
        ]);
        args.extend(self.worker_flags.iter().cloned());
        args
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        worker_id: u32,
        generation: u32,
    ) -> Result<Box<dyn WorkerProcess>, InfraError> {
        let child = Command::new(&self.program)
            .args(self.worker_args(worker_id, generation))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            target = "infra::supervisor",
            op = "supervisor::launch",
            worker_id,
            generation,
            pid = child.id().unwrap_or_default(),
            "Worker process spawned"
        );
        Ok(Box::new(ChildWorker { child }))
    }
}

struct ChildWorker {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> WorkerExit {
        match self.child.wait().await {
            Ok(status) => WorkerExit::from_status(status),
            Err(err) => {
                warn!(
                    target = "infra::supervisor",
                    op = "supervisor::wait",
                    error = %err,
                    "Failed to wait for worker process"
                );
                WorkerExit::Unknown
            }
        }
    }
}
