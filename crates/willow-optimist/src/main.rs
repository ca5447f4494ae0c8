use std::process::ExitCode;

use tokio::signal::unix::{
    signal,
    SignalKind,
};
use tracing::{
    error,
    info,
    warn,
};
use tracing_subscriber::EnvFilter;
use willow_optimist::{
    Config,
    Optimist,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cfg: Config = match Config::from_env() {
        Err(error) => {
            eprintln!("failed to read configuration:\n{error:?}");
            return ExitCode::FAILURE;
        }
        Ok(cfg) => cfg,
    };

    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log))
        .try_init()
    {
        eprintln!("failed to set up logging:\n{error:?}");
        return ExitCode::FAILURE;
    }

    info!(
        config = serde_json::to_string(&cfg).expect("serializing to a string cannot fail"),
        "initializing optimist node"
    );

    let mut sigterm = signal(SignalKind::terminate())
        .expect("setting a SIGTERM listener should always work on Unix");
    let (optimist, shutdown_handle) = match Optimist::new(cfg).await {
        Err(error) => {
            error!(%error, "failed initializing optimist node");
            return ExitCode::FAILURE;
        }
        Ok(handles) => handles,
    };
    let optimist_handle = tokio::spawn(optimist.run());

    let shutdown_token = shutdown_handle.token();
    tokio::select!(
        _ = sigterm.recv() => {
            // We don't care whether more SIGTERM signals are incoming; we
            // just want to shut down as soon as we receive the first one.
            info!("received SIGTERM, issuing shutdown to all tasks");
            shutdown_handle.shutdown();
        }
        () = shutdown_token.cancelled() => {
            warn!("stopped waiting for SIGTERM");
        }
    );

    if let Err(error) = optimist_handle.await {
        error!(%error, "failed to join main optimist task");
    }

    info!("optimist stopped");
    ExitCode::SUCCESS
}
