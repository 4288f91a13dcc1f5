//! Request gateway for an upstream LLM inference worker.
//!
//! Mediates between bursty client traffic and a single resource-constrained
//! worker process: a micro-batching window, admission control, a
//! degradation ladder, and a scale-to-zero subprocess supervisor.

pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod routes;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use config::Config;
use metrics::Metrics;
use queue::{BatchingQueue, Counters};
use routes::AppState;
use supervisor::Supervisor;
use worker::{WorkerClient, WorkerController};

/// Everything built from configuration that `main` needs to start serving
/// and to spawn the supervisor's background task.
pub struct Gateway {
    pub state: AppState,
    pub supervisor: Option<Arc<Supervisor>>,
}

impl Gateway {
    pub fn build(config: Config) -> Result<Self, error::GatewayError> {
        let config = Arc::new(config);
        let client = Arc::new(WorkerClient::new(config.vllm_url.clone())?);
        let counters = Arc::new(Counters::new());
        let metrics = Arc::new(Metrics::new(config.supervisor_enabled)?);

        let supervisor = if config.supervisor_enabled {
            let controller = Arc::new(WorkerController::new(config.worker.clone()));
            Some(Arc::new(Supervisor::new(
                controller,
                Arc::clone(&client),
                config.healthcheck_interval(),
                config.idle_timeout(),
                config.idle_check_interval(),
            )))
        } else {
            None
        };

        let queue = if config.batch_window_ms > 0 {
            Some(BatchingQueue::new(
                config.batch_window(),
                Arc::clone(&client),
                Arc::clone(&counters),
            ))
        } else {
            None
        };

        let state = AppState {
            config,
            client,
            counters,
            queue,
            supervisor: supervisor.clone(),
            metrics,
        };

        Ok(Self { state, supervisor })
    }

    pub fn router(&self) -> axum::Router {
        routes::router(self.state.clone())
    }

    /// Spawns the supervisor's background task, if the supervisor is
    /// enabled. Returns immediately otherwise.
    pub fn spawn_supervisor(&self, cancel: CancellationToken) {
        if let Some(supervisor) = self.supervisor.clone() {
            tokio::spawn(async move {
                info!("supervisor background task starting");
                supervisor.run(cancel).await;
                info!("supervisor background task stopped");
            });
        }
    }
}
