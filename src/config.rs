use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayError;

/// Fields used to build the worker's `vllm serve` command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSpawnConfig {
    pub model: String,
    pub host: String,
    pub port: u16,
    pub max_num_seqs: u32,
    pub gpu_memory_utilization: f64,
    pub max_num_batched_tokens: Option<u32>,
    pub enable_chunked_prefill: bool,
}

impl Default for WorkerSpawnConfig {
    fn default() -> Self {
        Self {
            model: "Qwen/Qwen2.5-0.5B-Instruct".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_num_seqs: 64,
            gpu_memory_utilization: 0.85,
            max_num_batched_tokens: None,
            enable_chunked_prefill: true,
        }
    }
}

/// Process-lifetime, immutable-after-init configuration (spec.md §3).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vllm_url: String,
    pub gateway_port: u16,
    pub batch_window_ms: u64,
    pub q_max: u32,
    pub supervisor_enabled: bool,
    pub idle_timeout_secs: u64,
    pub healthcheck_interval_secs: u64,
    pub idle_check_interval_secs: u64,
    pub worker: WorkerSpawnConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vllm_url: "http://localhost:8000".to_string(),
            gateway_port: 8001,
            batch_window_ms: 0,
            q_max: 128,
            supervisor_enabled: false,
            idle_timeout_secs: 180,
            healthcheck_interval_secs: 2,
            idle_check_interval_secs: 15,
            worker: WorkerSpawnConfig::default(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// the defaults in spec.md §6 for anything unset.
    pub fn from_env() -> Result<Self, GatewayError> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("VLLM_URL") {
            cfg.vllm_url = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = std::env::var("GATEWAY_PORT") {
            cfg.gateway_port = parse_env("GATEWAY_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("BATCH_WINDOW_MS") {
            cfg.batch_window_ms = parse_env("BATCH_WINDOW_MS", &v)?;
        }
        if let Ok(v) = std::env::var("Q_MAX") {
            cfg.q_max = parse_env("Q_MAX", &v)?;
        }
        if let Ok(v) = std::env::var("SUPERVISOR_ENABLED") {
            cfg.supervisor_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("IDLE_TIMEOUT_SECS") {
            cfg.idle_timeout_secs = parse_env("IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("HEALTHCHECK_INTERVAL_SECS") {
            cfg.healthcheck_interval_secs = parse_env("HEALTHCHECK_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("IDLE_CHECK_INTERVAL_SECS") {
            cfg.idle_check_interval_secs = parse_env("IDLE_CHECK_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("VLLM_MODEL") {
            cfg.worker.model = v;
        }
        if let Ok(v) = std::env::var("VLLM_HOST") {
            cfg.worker.host = v;
        }
        if let Ok(v) = std::env::var("VLLM_PORT") {
            cfg.worker.port = parse_env("VLLM_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("VLLM_MAX_NUM_SEQS") {
            cfg.worker.max_num_seqs = parse_env("VLLM_MAX_NUM_SEQS", &v)?;
        }
        if let Ok(v) = std::env::var("VLLM_GPU_MEMORY_UTILIZATION") {
            cfg.worker.gpu_memory_utilization = parse_env("VLLM_GPU_MEMORY_UTILIZATION", &v)?;
        }
        if let Ok(v) = std::env::var("VLLM_MAX_NUM_BATCHED_TOKENS") {
            cfg.worker.max_num_batched_tokens = Some(parse_env("VLLM_MAX_NUM_BATCHED_TOKENS", &v)?);
        }
        if let Ok(v) = std::env::var("VLLM_ENABLE_CHUNKED_PREFILL") {
            cfg.worker.enable_chunked_prefill = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            if v.eq_ignore_ascii_case("json") {
                cfg.log_format = LogFormat::Json;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Layer a TOML file under the environment (env vars still win).
    pub fn from_file_and_env(path: &std::path::Path) -> Result<Self, GatewayError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let mut cfg: Config = settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        // Environment variables are authoritative over the file.
        let from_env = Config::from_env()?;
        let defaults = Config::default();
        merge_env_over_file(&mut cfg, &from_env, &defaults);

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.q_max == 0 {
            return Err(GatewayError::Config("Q_MAX must be positive".to_string()));
        }
        if self.gateway_port == 0 {
            return Err(GatewayError::Config(
                "GATEWAY_PORT must be a valid port".to_string(),
            ));
        }
        if self.vllm_url.is_empty() {
            return Err(GatewayError::Config("VLLM_URL must not be empty".to_string()));
        }
        url::Url::parse(&self.vllm_url)
            .map_err(|e| GatewayError::Config(format!("invalid VLLM_URL: {e}")))?;
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }
}

/// Only overwrite file-sourced fields with env values that actually differ
/// from the built-in default, so an unset env var doesn't clobber a value
/// the operator set in the config file.
fn merge_env_over_file(cfg: &mut Config, from_env: &Config, defaults: &Config) {
    macro_rules! prefer_env {
        ($field:ident) => {
            if from_env.$field != defaults.$field {
                cfg.$field = from_env.$field.clone();
            }
        };
    }
    prefer_env!(vllm_url);
    prefer_env!(gateway_port);
    prefer_env!(batch_window_ms);
    prefer_env!(q_max);
    prefer_env!(supervisor_enabled);
    prefer_env!(idle_timeout_secs);
    prefer_env!(healthcheck_interval_secs);
    prefer_env!(idle_check_interval_secs);
    if std::env::var("VLLM_MODEL").is_ok() {
        cfg.worker.model = from_env.worker.model.clone();
    }
    if std::env::var("VLLM_HOST").is_ok() {
        cfg.worker.host = from_env.worker.host.clone();
    }
    if std::env::var("VLLM_PORT").is_ok() {
        cfg.worker.port = from_env.worker.port;
    }
    if std::env::var("VLLM_MAX_NUM_SEQS").is_ok() {
        cfg.worker.max_num_seqs = from_env.worker.max_num_seqs;
    }
    if std::env::var("VLLM_GPU_MEMORY_UTILIZATION").is_ok() {
        cfg.worker.gpu_memory_utilization = from_env.worker.gpu_memory_utilization;
    }
    if std::env::var("VLLM_MAX_NUM_BATCHED_TOKENS").is_ok() {
        cfg.worker.max_num_batched_tokens = from_env.worker.max_num_batched_tokens;
    }
    if std::env::var("VLLM_ENABLE_CHUNKED_PREFILL").is_ok() {
        cfg.worker.enable_chunked_prefill = from_env.worker.enable_chunked_prefill;
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::Config(format!("invalid value for {name}: {raw:?}")))
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.q_max, 128);
        assert_eq!(cfg.batch_window_ms, 0);
        assert_eq!(cfg.idle_timeout_secs, 180);
        assert_eq!(cfg.healthcheck_interval_secs, 2);
        assert_eq!(cfg.idle_check_interval_secs, 15);
        assert!(!cfg.supervisor_enabled);
        assert_eq!(cfg.worker.max_num_seqs, 64);
        assert!(cfg.worker.enable_chunked_prefill);
    }

    #[test]
    fn rejects_zero_q_max() {
        let mut cfg = Config::default();
        cfg.q_max = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_url() {
        let mut cfg = Config::default();
        cfg.vllm_url = String::new();
        assert!(cfg.validate().is_err());
    }
}
