//! Scale-to-zero supervisor (spec.md §4.B): the state machine that owns
//! the worker subprocess lifecycle. Distilled from
//! `examples/original_source/v1/scripts/supervisor.py`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::{WorkerClient, WorkerController};

/// `WorkerState` invariant: a subprocess handle exists iff state is
/// `Starting`, `Running`, or `Stopping` (enforced by `WorkerController`,
/// never by this type directly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    /// Numeric encoding for the `gateway_worker_state` gauge.
    pub fn as_metric(self) -> i64 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Starting => 1,
            WorkerState::Running => 2,
            WorkerState::Stopping => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        }
    }
}

/// Result of `start_if_needed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Running, or now starting -- caller may proceed to wait for readiness.
    Ok,
    /// Currently stopping; caller should not attempt to start.
    NotNow,
}

struct Inner {
    state: WorkerState,
    last_request_time: Instant,
}

/// State machine around the `WorkerController`. All mutation goes
/// through `state_mutex` -- the spec explicitly calls out that the
/// source it was distilled from mixes sync and async mutation with no
/// serialization, and asks implementers to add it (see DESIGN.md).
pub struct Supervisor {
    controller: Arc<WorkerController>,
    client: Arc<WorkerClient>,
    inner: Mutex<Inner>,
    ready: Notify,
    healthcheck_interval: Duration,
    idle_timeout: Duration,
    idle_check_interval: Duration,
}

impl Supervisor {
    pub fn new(
        controller: Arc<WorkerController>,
        client: Arc<WorkerClient>,
        healthcheck_interval: Duration,
        idle_timeout: Duration,
        idle_check_interval: Duration,
    ) -> Self {
        Self {
            controller,
            client,
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                last_request_time: Instant::now(),
            }),
            ready: Notify::new(),
            healthcheck_interval,
            idle_timeout,
            idle_check_interval,
        }
    }

    /// Pure bookkeeping; never changes state.
    pub async fn request_activity(&self) {
        self.inner.lock().await.last_request_time = Instant::now();
    }

    pub async fn state(&self) -> WorkerState {
        self.inner.lock().await.state
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == WorkerState::Running
    }

    /// IDLE -> STARTING (spawns the worker); no-op if already
    /// running/starting; refuses if stopping.
    pub async fn start_if_needed(&self) -> StartOutcome {
        let should_spawn = {
            let mut guard = self.inner.lock().await;
            match guard.state {
                WorkerState::Running | WorkerState::Starting => return StartOutcome::Ok,
                WorkerState::Stopping => return StartOutcome::NotNow,
                WorkerState::Idle => {
                    guard.state = WorkerState::Starting;
                    guard.last_request_time = Instant::now();
                    true
                }
            }
        };

        if should_spawn {
            self.controller.start().await;
            info!("supervisor: state=STARTING");
        }
        StartOutcome::Ok
    }

    async fn healthcheck(&self) -> bool {
        self.client.healthcheck().await
    }

    /// Poll `is_ready` every second (woken early by the background loop's
    /// STARTING->RUNNING transition) for up to `timeout`.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        if self.is_ready().await {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            if self.is_ready().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Background activity (spec.md §4.B): the single logical task
    /// driving IDLE/STARTING/RUNNING/STOPPING transitions. Runs until
    /// `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let state = self.state().await;
            match state {
                WorkerState::Starting => {
                    if self.healthcheck().await {
                        self.inner.lock().await.state = WorkerState::Running;
                        self.ready.notify_waiters();
                        info!("supervisor: state=RUNNING");
                    }
                    sleep_or_cancel(self.healthcheck_interval, &cancel).await;
                }
                WorkerState::Running => {
                    if !self.controller.is_alive().await {
                        self.inner.lock().await.state = WorkerState::Idle;
                        warn!("supervisor: worker died, state=IDLE");
                        continue;
                    }
                    let elapsed = self.inner.lock().await.last_request_time.elapsed();
                    if elapsed >= self.idle_timeout {
                        info!(elapsed_secs = elapsed.as_secs(), "supervisor: idle timeout, stopping worker");
                        self.inner.lock().await.state = WorkerState::Stopping;
                        self.controller.stop().await;
                        self.inner.lock().await.state = WorkerState::Idle;
                        info!("supervisor: state=IDLE");
                    } else {
                        sleep_or_cancel(self.idle_check_interval, &cancel).await;
                    }
                }
                WorkerState::Stopping => {
                    sleep_or_cancel(Duration::from_secs(1), &cancel).await;
                }
                WorkerState::Idle => {
                    sleep_or_cancel(self.idle_check_interval, &cancel).await;
                }
            }
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSpawnConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn controller() -> Arc<WorkerController> {
        Arc::new(WorkerController::new(WorkerSpawnConfig {
            model: "m".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9,
            max_num_seqs: 1,
            gpu_memory_utilization: 0.1,
            max_num_batched_tokens: None,
            enable_chunked_prefill: false,
        }))
    }

    #[tokio::test]
    async fn initial_state_is_idle() {
        let client = Arc::new(WorkerClient::new("http://127.0.0.1:1".to_string()).unwrap());
        let sup = Supervisor::new(
            controller(),
            client,
            Duration::from_millis(10),
            Duration::from_secs(180),
            Duration::from_secs(15),
        );
        assert_eq!(sup.state().await, WorkerState::Idle);
        assert!(!sup.is_ready().await);
    }

    #[tokio::test]
    async fn start_if_needed_transitions_idle_to_starting() {
        let client = Arc::new(WorkerClient::new("http://127.0.0.1:1".to_string()).unwrap());
        let sup = Supervisor::new(
            controller(),
            client,
            Duration::from_millis(10),
            Duration::from_secs(180),
            Duration::from_secs(15),
        );
        assert_eq!(sup.start_if_needed().await, StartOutcome::Ok);
        assert_eq!(sup.state().await, WorkerState::Starting);
        // Idempotent from STARTING.
        assert_eq!(sup.start_if_needed().await, StartOutcome::Ok);
        assert_eq!(sup.state().await, WorkerState::Starting);
    }

    #[tokio::test]
    async fn background_loop_advances_starting_to_running_on_healthy_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = Arc::new(WorkerClient::new(server.uri()).unwrap());
        let sup = Arc::new(Supervisor::new(
            controller(),
            client,
            Duration::from_millis(10),
            Duration::from_secs(180),
            Duration::from_secs(15),
        ));
        sup.start_if_needed().await;
        assert_eq!(sup.state().await, WorkerState::Starting);

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&sup).run(cancel.clone()));

        let ready = sup.await_ready(Duration::from_secs(2)).await;
        cancel.cancel();

        assert!(ready);
        assert_eq!(sup.state().await, WorkerState::Running);
    }

    #[tokio::test]
    async fn state_metric_encoding() {
        assert_eq!(WorkerState::Idle.as_metric(), 0);
        assert_eq!(WorkerState::Starting.as_metric(), 1);
        assert_eq!(WorkerState::Running.as_metric(), 2);
        assert_eq!(WorkerState::Stopping.as_metric(), 3);
    }
}
