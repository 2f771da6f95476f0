mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use clearance_mirror::{
    AppState, CredentialCache, MirrorConfig, MirrorEngine, RemoteSolver, RemoteSolverConfig,
    SerializedSolver, SessionPool, ReqwestSessionFactory, serve,
};

use crate::cli::Cli;

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => log::info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => log::info!("received SIGTERM"),
                }
            }
            Err(err) => {
                log::warn!("failed to register SIGTERM handler: {err}");
                ctrl_c.await;
                log::info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        log::info!("received SIGINT (ctrl-c)");
    }
}

fn spawn_pruner(cache: CredentialCache, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.clear_expired();
            if removed > 0 {
                log::debug!("pruned {removed} expired clearance record(s)");
            }
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let cache = if cli.no_persist {
        CredentialCache::in_memory()
    } else {
        match CredentialCache::open(&cli.cache_file) {
            Ok(cache) => cache,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::FAILURE;
            }
        }
    };

    let solver_config = RemoteSolverConfig::new(cli.solver_url.clone()).with_retries(cli.solver_retries);
    let solver = match RemoteSolver::new(solver_config) {
        Ok(solver) => SerializedSolver::new(solver),
        Err(err) => {
            log::error!("failed to set up solver client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = MirrorConfig::builder()
        .with_max_retries(cli.max_retries)
        .with_retry_backoff(Duration::from_millis(cli.retry_backoff_ms))
        .with_credential_ttl(Duration::from_secs(cli.credential_ttl_secs))
        .with_solver_timeout(Duration::from_secs(cli.solver_timeout_secs));
    if cli.single_flight {
        config = config.enable_single_flight();
    }

    let sessions = Arc::new(SessionPool::new(
        Arc::new(ReqwestSessionFactory::default()),
        cli.session_capacity,
    ));
    let engine = Arc::new(MirrorEngine::new(
        config.build(),
        Arc::new(solver),
        cache.clone(),
        sessions.clone(),
    ));

    if cli.prune_interval_secs > 0 {
        spawn_pruner(cache, Duration::from_secs(cli.prune_interval_secs));
    }

    let listener = match TcpListener::bind(cli.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("failed to bind {}: {err}", cli.listen);
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "clearance-mirror {} starting (solver: {})",
        clearance_mirror::VERSION,
        cli.solver_url
    );
    let outcome = serve(listener, AppState::new(engine), shutdown_signal()).await;
    sessions.clear().await;

    match outcome {
        Ok(()) => {
            log::info!("server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("server error: {err}");
            ExitCode::FAILURE
        }
    }
}
