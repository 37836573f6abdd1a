//! Policy resolution and threshold classification.

use serde_json::Value;

use evd_schemas::{BreachStage, SignalLevel, SlaPolicy};

/// Merge a connector's `config.sla` over the default policy.
///
/// A merged policy that fails validation (mis-ordered thresholds, negative
/// values) falls back to the defaults rather than poisoning evaluation.
pub fn resolve_policy(defaults: &SlaPolicy, connector_config: &Value) -> SlaPolicy {
    let Some(raw) = connector_config.get("sla").and_then(Value::as_object) else {
        return defaults.clone();
    };

    let mut merged = match serde_json::to_value(defaults) {
        Ok(Value::Object(map)) => map,
        _ => return defaults.clone(),
    };
    for (key, value) in raw {
        merged.insert(key.clone(), value.clone());
    }

    match serde_json::from_value::<SlaPolicy>(Value::Object(merged)) {
        Ok(policy) if policy.validate().is_ok() => policy,
        _ => defaults.clone(),
    }
}

/// Classify one axis value against its ascending thresholds.
///
/// `None` means no breach. `escalated` implies CRITICAL severity.
pub fn severity_stage(
    value: i64,
    warning: i64,
    critical: i64,
    escalation: i64,
) -> Option<(SignalLevel, BreachStage)> {
    if value >= escalation {
        return Some((SignalLevel::Critical, BreachStage::Escalated));
    }
    if value >= critical {
        return Some((SignalLevel::Critical, BreachStage::Critical));
    }
    if value >= warning {
        return Some((SignalLevel::Warning, BreachStage::Warning));
    }
    None
}

/// Runbook pointer surfaced in audit payloads; `runbook_url` wins over
/// `runbook_path`, both optional.
pub fn resolve_runbook_url(connector_config: &Value) -> String {
    for key in ["runbook_url", "runbook_path"] {
        if let Some(raw) = connector_config.get(key).and_then(Value::as_str) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_stage_bands() {
        assert_eq!(severity_stage(0, 1, 3, 9), None);
        assert_eq!(severity_stage(1, 1, 3, 9), Some((SignalLevel::Warning, BreachStage::Warning)));
        assert_eq!(severity_stage(3, 1, 3, 9), Some((SignalLevel::Critical, BreachStage::Critical)));
        assert_eq!(severity_stage(9, 1, 3, 9), Some((SignalLevel::Critical, BreachStage::Escalated)));
        assert_eq!(severity_stage(100, 1, 3, 9), Some((SignalLevel::Critical, BreachStage::Escalated)));
    }

    #[test]
    fn config_overrides_merge_over_defaults() {
        let defaults = SlaPolicy::default();
        let policy = resolve_policy(&defaults, &json!({"sla": {"pending_warning": 1, "pending_critical": 2, "pending_escalation": 3}}));
        assert_eq!(policy.pending_warning, 1);
        assert_eq!(policy.pending_critical, 2);
        assert_eq!(policy.pending_escalation, 3);
        // Untouched axes keep their defaults.
        assert_eq!(policy.dead_warning, defaults.dead_warning);
    }

    #[test]
    fn mis_ordered_override_falls_back_to_defaults() {
        let defaults = SlaPolicy::default();
        let policy = resolve_policy(
            &defaults,
            &json!({"sla": {"freshness_warning_minutes": 720, "freshness_critical_minutes": 180}}),
        );
        assert_eq!(policy, defaults);
    }

    #[test]
    fn missing_sla_block_returns_defaults() {
        let defaults = SlaPolicy::default();
        assert_eq!(resolve_policy(&defaults, &json!({})), defaults);
    }

    #[test]
    fn runbook_url_wins_over_path() {
        let cfg = json!({"runbook_url": "https://wiki/runbook", "runbook_path": "/docs/rb.md"});
        assert_eq!(resolve_runbook_url(&cfg), "https://wiki/runbook");
        assert_eq!(resolve_runbook_url(&json!({"runbook_path": " /docs/rb.md "})), "/docs/rb.md");
        assert_eq!(resolve_runbook_url(&json!({})), "");
    }
}
