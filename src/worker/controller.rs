//! Worker Process Controller (spec.md §4.A).
//!
//! Owns the single worker subprocess handle. Spawn and termination waits
//! run on a blocking thread so they never stall the gateway's async
//! event loop (spec.md §5).

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::WorkerSpawnConfig;

const GRACEFUL_WAIT: Duration = Duration::from_secs(30);
const FORCE_WAIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns, terminates, and reports on the worker subprocess.
///
/// `start`/`stop` are idempotent and never panic: a spawn failure just
/// leaves the handle empty, observable via `is_alive() == false`.
pub struct WorkerController {
    spawn: WorkerSpawnConfig,
    child: Mutex<Option<Child>>,
}

impl WorkerController {
    pub fn new(spawn: WorkerSpawnConfig) -> Self {
        Self {
            spawn,
            child: Mutex::new(None),
        }
    }

    /// Build the `vllm serve <model> ...` argument vector from config
    /// (spec.md §6's worker spawn command).
    fn build_command(&self) -> Command {
        let mut cmd = Command::new("vllm");
        cmd.arg("serve").arg(&self.spawn.model);
        cmd.arg("--host").arg(&self.spawn.host);
        cmd.arg("--port").arg(self.spawn.port.to_string());
        cmd.arg("--max-model-len").arg("512");
        cmd.arg("--max-num-seqs").arg(self.spawn.max_num_seqs.to_string());
        cmd.arg("--gpu-memory-utilization")
            .arg(self.spawn.gpu_memory_utilization.to_string());
        if let Some(max_batched) = self.spawn.max_num_batched_tokens {
            cmd.arg("--max-num-batched-tokens").arg(max_batched.to_string());
        }
        if self.spawn.enable_chunked_prefill {
            cmd.arg("--enable-chunked-prefill");
        }

        if std::env::var_os("VLLM_MODEL").is_none() {
            cmd.env("VLLM_MODEL", &self.spawn.model);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        cmd
    }

    /// Idempotent: no-op if a live subprocess already exists.
    pub async fn start(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return;
            }
        }

        match self.build_command().spawn() {
            Ok(mut child) => {
                if let Some(stderr) = child.stderr.take() {
                    spawn_stderr_drain(stderr);
                }
                info!(pid = child.id(), "worker process started");
                *guard = Some(child);
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn worker process");
                *guard = None;
            }
        }
    }

    /// Idempotent: graceful term (30s), then force-kill (10s), never raises.
    pub async fn stop(&self) {
        let child = {
            let mut guard = self.child.lock().await;
            guard.take()
        };
        let Some(child) = child else {
            return;
        };

        tokio::task::spawn_blocking(move || terminate_blocking(child))
            .await
            .ok();
    }

    /// True iff a handle exists and the process has not exited.
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().map(Child::id)
    }
}

fn spawn_stderr_drain(stderr: std::process::ChildStderr) {
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            warn!(target: "worker", "{line}");
        }
    });
}

fn terminate_blocking(mut child: Child) {
    let pid = child.id();

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }

    if !wait_up_to(&mut child, GRACEFUL_WAIT) {
        warn!(pid, "worker did not exit within graceful window, killing");
        let _ = child.kill();
        wait_up_to(&mut child, FORCE_WAIT);
    }
    info!(pid, "worker process stopped");
}

/// Poll `try_wait` until the process exits or `budget` elapses.
fn wait_up_to(child: &mut Child, budget: Duration) -> bool {
    let deadline = std::time::Instant::now() + budget;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleepy_config() -> WorkerSpawnConfig {
        WorkerSpawnConfig {
            model: "test-model".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_num_seqs: 1,
            gpu_memory_utilization: 0.1,
            max_num_batched_tokens: None,
            enable_chunked_prefill: false,
        }
    }

    #[test]
    fn command_includes_fixed_max_model_len() {
        let controller = WorkerController::new(sleepy_config());
        let cmd = controller.build_command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.windows(2).any(|w| w[0] == "--max-model-len" && w[1] == "512"));
        assert!(!args.contains(&"--enable-chunked-prefill".to_string()));
    }

    #[tokio::test]
    async fn start_is_idempotent_without_a_real_binary() {
        // "vllm" is not on PATH in the test environment, so spawn fails
        // and is_alive reports false -- exercising the silent-failure path.
        let controller = WorkerController::new(sleepy_config());
        controller.start().await;
        controller.start().await;
        assert!(!controller.is_alive().await);
    }

    #[tokio::test]
    async fn stop_without_start_never_panics() {
        let controller = WorkerController::new(sleepy_config());
        controller.stop().await;
        controller.stop().await;
        assert!(!controller.is_alive().await);
    }
}
