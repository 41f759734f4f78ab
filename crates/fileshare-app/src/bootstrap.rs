//! Service wiring and shutdown sequencing.
//!
//! # Design
//! - Configuration is layered defaults, then the JSON file, then command-line flags, and
//!   validated once before anything starts.
//! - The transfer core is built here and passed down by reference; nothing is global.
//! - Shutdown order: stop accepting requests and drain them, cancel background work, then stop
//!   both worker pools on the blocking pool.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use fileshare_api::{ApiServer, ApiState};
use fileshare_config::{LogFormatSetting, ServerConfig, load_from_file};
use fileshare_fsops::{PartialFileJanitor, TransferContext};
use fileshare_telemetry::{LogFormat, LoggingConfig, Metrics, ServiceSpan, init_logging};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::error::{AppError, AppResult};

/// Dependencies required to bootstrap the server.
pub(crate) struct BootstrapDependencies {
    config: ServerConfig,
    telemetry: Metrics,
}

impl BootstrapDependencies {
    /// Resolve configuration from the command line and build the metrics registry.
    pub(crate) async fn from_cli(cli: &Cli) -> AppResult<Self> {
        let mut config = match &cli.config {
            Some(path) => load_from_file(path)
                .await
                .map_err(|err| AppError::config("config.load", err))?,
            None => ServerConfig::default(),
        };
        cli.apply(&mut config);
        config
            .validate()
            .map_err(|err| AppError::config("config.validate", err))?;
        config.root = std::path::absolute(&config.root).unwrap_or(config.root);

        let telemetry =
            Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        Ok(Self { config, telemetry })
    }

    fn logging(&self) -> LoggingConfig<'_> {
        let format = match self.config.logging.format {
            Some(LogFormatSetting::Json) => LogFormat::Json,
            Some(LogFormatSetting::Pretty) => LogFormat::Pretty,
            None => LogFormat::infer(),
        };
        LoggingConfig {
            level: &self.config.logging.level,
            format,
            build_sha: option_env!("FILESHARE_BUILD_SHA").unwrap_or("dev"),
        }
    }
}

/// Entry point for the fileshare boot sequence.
///
/// # Errors
///
/// Returns an error if configuration is invalid, logging cannot be installed, the transfer core
/// cannot start, or the listener fails.
pub async fn run_app() -> AppResult<()> {
    let cli = Cli::parse();
    let dependencies = BootstrapDependencies::from_cli(&cli).await?;
    init_logging(&dependencies.logging())
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let _span = ServiceSpan::enter("serve", &dependencies.config.root);
    run_app_with(dependencies, shutdown_signal()).await
}

/// Boot sequence over injected dependencies; returns once `shutdown` resolved and everything
/// stopped.
pub(crate) async fn run_app_with<F>(dependencies: BootstrapDependencies, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let BootstrapDependencies { config, telemetry } = dependencies;
    let transfer = Arc::new(
        TransferContext::start(&config.root, &config.transfer, telemetry.clone())
            .map_err(|err| AppError::fsops("transfer.start", err))?,
    );

    let stop = CancellationToken::new();
    let janitor = config.janitor.enabled.then(|| {
        PartialFileJanitor::new(
            &config.root,
            config.janitor.max_age(),
            config.janitor.interval(),
            telemetry.clone(),
        )
        .with_session_reaper(transfer.uploads().session_reaper())
        .spawn(stop.child_token())
    });

    let addr = config.socket_addr();
    announce(&config.root, addr);
    let server = ApiServer::new(ApiState::new(
        Arc::clone(&transfer),
        telemetry,
        stop.child_token(),
    ));
    let stop_on_signal = stop.clone();
    let serve_result = server
        .serve(addr, async move {
            shutdown.await;
            info!("shutdown requested");
            stop_on_signal.cancel();
        })
        .await;

    stop.cancel();
    if let Some(handle) = janitor {
        if let Err(err) = handle.await {
            warn!(error = %err, "janitor task ended abnormally");
        }
    }
    tokio::task::spawn_blocking(move || transfer.shutdown())
        .await
        .map_err(|err| AppError::join("transfer.shutdown", err))?;
    info!("fileshare stopped");

    serve_result.map_err(|err| AppError::api_server("api_server.serve", err))
}

fn announce(root: &Path, addr: std::net::SocketAddr) {
    let host = if addr.ip().is_unspecified() {
        "localhost".to_string()
    } else {
        addr.ip().to_string()
    };
    info!(
        root = %root.display(),
        addr = %addr,
        url = %format!("http://{host}:{}/", addr.port()),
        "sharing directory"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
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
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
