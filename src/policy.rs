//! Admission control and the degradation ladder (spec.md §4.C).
//!
//! Both functions are pure over `queue_depth = pending + in_flight` and
//! are called on the hot path, so they do no I/O and touch no shared
//! state.

use serde_json::Value;

/// Result of an admission check for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionResult {
    pub admitted: bool,
    pub retry_after_seconds: u64,
    pub reason: String,
}

impl AdmissionResult {
    fn admitted() -> Self {
        Self {
            admitted: true,
            retry_after_seconds: 0,
            reason: String::new(),
        }
    }

    fn rejected(depth: u64, q_max: u32) -> Self {
        Self {
            admitted: false,
            retry_after_seconds: 60,
            reason: format!("queue_depth {depth} > Q_MAX {q_max}"),
        }
    }
}

/// One step of the degradation ladder (static table, spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradationTier {
    pub tier: u8,
    pub max_output_tokens: u32,
    pub label: &'static str,
}

const LADDER: [DegradationTier; 4] = [
    DegradationTier {
        tier: 0,
        max_output_tokens: 200,
        label: "normal",
    },
    DegradationTier {
        tier: 1,
        max_output_tokens: 128,
        label: "max_new_tokens=128",
    },
    DegradationTier {
        tier: 2,
        max_output_tokens: 96,
        label: "max_new_tokens=96",
    },
    DegradationTier {
        tier: 3,
        max_output_tokens: 64,
        label: "max_new_tokens=64",
    },
];

const DEFAULT_MAX_TOKENS: i64 = 200;

/// Admit iff `depth <= q_max`.
pub fn check_admission(depth: u64, q_max: u32) -> AdmissionResult {
    if depth <= q_max as u64 {
        AdmissionResult::admitted()
    } else {
        AdmissionResult::rejected(depth, q_max)
    }
}

/// Pick the degradation tier for a given queue depth.
pub fn tier_for(depth: u64) -> DegradationTier {
    match depth {
        0..=32 => LADDER[0],
        33..=64 => LADDER[1],
        65..=96 => LADDER[2],
        _ => LADDER[3],
    }
}

/// Cap `body.max_tokens` at the tier's ceiling if it exceeds it. Returns
/// the (possibly unchanged) body and the tier that was applied, so the
/// caller can log/measure it.
///
/// Idempotent: applying degradation to an already-degraded body at the
/// same depth is a no-op (the cap is a minimum-with-ceiling).
pub fn apply_degradation(body: &Value, depth: u64) -> (Value, DegradationTier) {
    let tier = tier_for(depth);
    let mut out = body.clone();

    let current = out
        .get("max_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_MAX_TOKENS);

    if current > tier.max_output_tokens as i64 {
        if let Some(obj) = out.as_object_mut() {
            obj.insert(
                "max_tokens".to_string(),
                Value::from(tier.max_output_tokens),
            );
        }
    }

    (out, tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn admits_at_boundary() {
        assert!(check_admission(128, 128).admitted);
        assert!(!check_admission(129, 128).admitted);
    }

    #[test]
    fn reject_reason_and_retry_after() {
        let r = check_admission(200, 128);
        assert!(!r.admitted);
        assert_eq!(r.retry_after_seconds, 60);
        assert_eq!(r.reason, "queue_depth 200 > Q_MAX 128");
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(tier_for(32).tier, 0);
        assert_eq!(tier_for(33).tier, 1);
        assert_eq!(tier_for(64).tier, 1);
        assert_eq!(tier_for(65).tier, 2);
        assert_eq!(tier_for(96).tier, 2);
        assert_eq!(tier_for(97).tier, 3);
    }

    #[test]
    fn degradation_caps_max_tokens() {
        let body = json!({"max_tokens": 200, "messages": []});
        let (out, tier) = apply_degradation(&body, 70);
        assert_eq!(tier.tier, 2);
        assert_eq!(out["max_tokens"], 96);
    }

    #[test]
    fn degradation_leaves_low_values_alone() {
        let body = json!({"max_tokens": 10});
        let (out, _) = apply_degradation(&body, 200);
        assert_eq!(out["max_tokens"], 10);
    }

    #[test]
    fn degradation_defaults_missing_max_tokens_to_200() {
        let body = json!({"messages": []});
        let (out, tier) = apply_degradation(&body, 70);
        assert_eq!(tier.max_output_tokens, 96);
        assert_eq!(out["max_tokens"], 96);
    }

    #[test]
    fn degradation_is_idempotent() {
        let body = json!({"max_tokens": 200});
        let (once, _) = apply_degradation(&body, 70);
        let (twice, _) = apply_degradation(&once, 70);
        assert_eq!(once, twice);
    }

    #[test]
    fn degradation_ignores_non_integer_max_tokens() {
        let body = json!({"max_tokens": "lots"});
        let (out, tier) = apply_degradation(&body, 70);
        assert_eq!(tier.max_output_tokens, 96);
        assert_eq!(out["max_tokens"], 96);
    }
}
