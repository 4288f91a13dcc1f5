use thiserror::Error;

/// Errors surfaced by the gateway's internals.
///
/// Admission rejection and cold-start timeout are *not* represented here:
/// they are expected control flow on the request path and are built
/// directly as HTTP responses in `routes.rs`, not propagated as errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn worker process: {0}")]
    WorkerSpawn(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
