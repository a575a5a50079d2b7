use std::{process, sync::Arc};

use jsbrain_server::{
    application::{
        error::AppError,
        mediator::WorkerIdentity,
        pipeline::PipelineConfig,
        pool::PoolConfig,
        worker::{WorkerComponents, WorkerContext},
    },
    config::{self, CliArgs, Command, ServeOverrides, Settings, WorkerArgs},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        imagemagick::{ImageMagick, Svgo},
        supervisor::{ProcessLauncher, Supervisor},
        telemetry,
        webdriver::{DriverProcess, WebDriverEnvironment},
    },
    util::host,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let CliArgs {
        config_file,
        command,
    } = cli_args;
    match command {
        Some(Command::Worker(args)) => run_worker(settings, *args).await,
        Some(Command::Serve(args)) => run_supervisor(settings, config_file, &args.overrides).await,
        None => run_supervisor(settings, config_file, &ServeOverrides::default()).await,
    }
}

async fn run_supervisor(
    settings: Settings,
    config_file: Option<std::path::PathBuf>,
    overrides: &ServeOverrides,
) -> Result<(), AppError> {
    let launcher = ProcessLauncher::current_exe(config_file, overrides.to_args())?;
    info!(
        target = "jsbrain::serve",
        addr = %settings.server.addr,
        workers = settings.supervisor.workers.get(),
        "Starting render supervisor"
    );

    let supervisor = Supervisor::new(launcher, settings.supervisor.workers);
    let restarts = supervisor.run(shutdown_signal()).await;

    info!(target = "jsbrain::serve", restarts, "Render supervisor stopped");
    Ok(())
}

async fn run_worker(settings: Settings, args: WorkerArgs) -> Result<(), AppError> {
    install_panic_hook(args.worker_id);

    let mut driver = DriverProcess::launch(&settings.automation, args.worker_id).await?;
    let environment = Arc::new(
        WebDriverEnvironment::new(driver.base_url().clone(), &settings.automation)
            .map_err(|err| InfraError::driver(err.to_string()))?,
    );

    let page_path = std::path::absolute(&settings.render.page_path).map_err(InfraError::from)?;
    let render = &settings.render;
    let worker = Arc::new(WorkerContext::new(
        WorkerIdentity {
            worker_id: args.worker_id,
            generation: args.generation,
            host: host::hostname(),
        },
        WorkerComponents {
            environment: environment.clone(),
            raster: Arc::new(ImageMagick::new(
                render.imagemagick_path.clone(),
                render.postprocess_timeout,
            )),
            svg_optimizer: Arc::new(Svgo::new(
                render.svgo_path.clone(),
                render.postprocess_timeout,
            )),
            pool: PoolConfig {
                capacity: settings.pool.capacity,
                idle_grace: settings.pool.idle_grace,
                open_timeout: settings.automation.session_open_timeout,
            },
            pipeline: PipelineConfig {
                page_path,
                page_timeout: render.page_timeout,
                input_retry_delay: render.input_retry_delay,
                public_base_url: render.public_base_url.clone(),
                palette_path: render.palette_path.clone(),
                thumbnail_size: render.thumbnail_size,
                max_concurrent_renders: render.max_concurrent_renders,
            },
        },
    ));

    let listener = http::bind_shared_listener(settings.server.addr).map_err(InfraError::from)?;
    let router = http::build_router(HttpState {
        mediator: worker.mediator(),
    });

    let driver_watch = {
        let worker = Arc::clone(&worker);
        let environment = Arc::clone(&environment);
        tokio::spawn(async move {
            let status = driver.wait().await;
            environment.mark_disconnected();
            worker.environment_lost();
            error!(
                target = "jsbrain::worker",
                worker_id = worker.identity().worker_id,
                status = ?status,
                "WebDriver server exited; terminating worker"
            );
            process::exit(1);
        })
    };

    info!(
        target = "jsbrain::worker",
        addr = %settings.server.addr,
        worker_id = args.worker_id,
        generation = args.generation,
        "Render worker listening"
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    worker.drain().await;
    driver_watch.abort();
    let _ = driver_watch.await;

    served
}

fn install_panic_hook(worker_id: u32) {
    std::panic::set_hook(Box::new(move |panic| {
        error!(
            target = "jsbrain::worker",
            worker_id,
            panic = %panic,
            "Render worker panicked; terminating"
        );
        process::exit(1);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "jsbrain::shutdown", error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "jsbrain::shutdown", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(target = "jsbrain::shutdown", "Shutdown signal received");
}
