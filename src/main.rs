use std::process::ExitCode;

use inference_gateway::config::{Config, LogFormat};
use inference_gateway::shutdown;
use inference_gateway::Gateway;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            // Logging isn't initialized yet -- this is the one place we
            // write straight to stderr.
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.log_format);

    let gateway = match Gateway::build(config) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to build gateway");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    gateway.spawn_supervisor(cancel.clone());
    tokio::spawn(shutdown::listen(cancel.clone()));

    let addr = format!("0.0.0.0:{}", gateway.state.config.gateway_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind gateway listener");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "gateway listening");

    let router = gateway.router();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;

    if let Err(e) = result {
        error!(error = %e, "server error");
        return ExitCode::FAILURE;
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
