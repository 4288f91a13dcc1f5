//! Text-format metrics exposition (spec.md §4.F, §6).
//!
//! Grounded on the teacher's `pingora` package, which also exposes a
//! `prometheus::Registry` for a managed-process gateway.

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

use crate::error::GatewayError;

/// Owns the four gauges named in spec.md §6. Values are set at scrape
/// time, not on every mutation -- emission is stateless.
pub struct Metrics {
    registry: Registry,
    queue_depth: IntGauge,
    in_flight: IntGauge,
    pending_batch: IntGauge,
    worker_state: Option<IntGauge>,
}

impl Metrics {
    /// `worker_state` is only registered (and only ever emitted) when the
    /// supervisor is enabled, per spec.md §8 "if supervisor is disabled,
    /// worker state is never observed in any metric".
    pub fn new(supervisor_enabled: bool) -> Result<Self, GatewayError> {
        let registry = Registry::new();

        let queue_depth = IntGauge::with_opts(Opts::new(
            "gateway_queue_depth",
            "pending + in_flight requests currently admitted",
        ))
        .map_err(metrics_err)?;
        let in_flight = IntGauge::with_opts(Opts::new(
            "gateway_in_flight",
            "requests dispatched to the worker and not yet responded to",
        ))
        .map_err(metrics_err)?;
        let pending_batch = IntGauge::with_opts(Opts::new(
            "gateway_pending_batch",
            "requests currently held in the micro-batch window",
        ))
        .map_err(metrics_err)?;

        registry.register(Box::new(queue_depth.clone())).map_err(metrics_err)?;
        registry.register(Box::new(in_flight.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(pending_batch.clone()))
            .map_err(metrics_err)?;

        let worker_state = if supervisor_enabled {
            let gauge = IntGauge::with_opts(Opts::new(
                "gateway_worker_state",
                "0=idle 1=starting 2=running 3=stopping",
            ))
            .map_err(metrics_err)?;
            registry.register(Box::new(gauge.clone())).map_err(metrics_err)?;
            Some(gauge)
        } else {
            None
        };

        Ok(Self {
            registry,
            queue_depth,
            in_flight,
            pending_batch,
            worker_state,
        })
    }

    /// Refresh gauge values and render the Prometheus text exposition
    /// format. `worker_state_metric` is ignored (and should be `None`)
    /// when the supervisor is disabled.
    pub fn render(&self, pending: u64, in_flight: u64, worker_state_metric: Option<i64>) -> Result<String, GatewayError> {
        self.queue_depth.set((pending + in_flight) as i64);
        self.in_flight.set(in_flight as i64);
        self.pending_batch.set(pending as i64);
        if let (Some(gauge), Some(value)) = (&self.worker_state, worker_state_metric) {
            gauge.set(value);
        }

        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| GatewayError::Internal(format!("metrics encode failed: {e}")))?;
        String::from_utf8(buffer).map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> GatewayError {
    GatewayError::Internal(format!("metrics registration failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_core_gauges() {
        let metrics = Metrics::new(false).unwrap();
        let text = metrics.render(3, 2, None).unwrap();
        assert!(text.contains("gateway_queue_depth 5"));
        assert!(text.contains("gateway_in_flight 2"));
        assert!(text.contains("gateway_pending_batch 3"));
        assert!(!text.contains("gateway_worker_state"));
    }

    #[test]
    fn render_includes_worker_state_only_when_supervisor_enabled() {
        let metrics = Metrics::new(true).unwrap();
        let text = metrics.render(0, 0, Some(2)).unwrap();
        assert!(text.contains("gateway_worker_state 2"));
    }
}
