//! Alert-state transitions as pure functions.
//!
//! The monitor computes the next state and the emission decision here, then
//! persists the returned row in one store write. No clock reads, no I/O.

use chrono::{DateTime, Utc};

use evd_schemas::{BreachStage, SignalLevel, SlaAlertState, SlaBreach};

/// Result of observing one breach against the existing alert state.
#[derive(Debug, Clone)]
pub struct AlertTransition {
    pub state: SlaAlertState,
    pub should_emit: bool,
}

/// Fold one observed breach into the alert state.
///
/// A missing or previously-closed state opens fresh (`repeat_count = 1`,
/// escalation reset) and always emits. An open state accumulates
/// `repeat_count` and re-emits only when the stage or severity changed or
/// the cooldown elapsed.
pub fn apply_breach(
    existing: Option<&SlaAlertState>,
    breach: &SlaBreach,
    observed_at: DateTime<Utc>,
    cooldown_seconds: i64,
) -> AlertTransition {
    let dedupe_key = SlaAlertState::key_for(&breach.connector_name, breach.breach_type);

    let open_existing = existing.filter(|state| state.is_open);
    let Some(previous) = open_existing else {
        // Fresh or reopened alert.
        let state = SlaAlertState {
            dedupe_key,
            connector_name: breach.connector_name.clone(),
            source_name: breach.source_name.clone(),
            breach_type: breach.breach_type,
            stage: breach.stage,
            severity: breach.severity,
            first_seen_at: observed_at,
            last_seen_at: observed_at,
            last_emitted_at: Some(observed_at),
            last_recovered_at: existing.and_then(|s| s.last_recovered_at),
            last_escalated_at: None,
            repeat_count: 1,
            escalation_level: 0,
            escalation_reason: String::new(),
            is_open: true,
            message: breach.message.clone(),
        };
        return AlertTransition { state, should_emit: true };
    };

    let stage_changed = previous.stage != breach.stage || previous.severity != breach.severity;
    let cooldown = cooldown_seconds.max(0);
    let cooldown_passed = match previous.last_emitted_at {
        None => true,
        Some(last) => (observed_at - last).num_seconds() >= cooldown,
    };
    let should_emit = stage_changed || cooldown_passed;

    let state = SlaAlertState {
        dedupe_key,
        connector_name: breach.connector_name.clone(),
        source_name: breach.source_name.clone(),
        breach_type: breach.breach_type,
        stage: breach.stage,
        severity: breach.severity,
        first_seen_at: previous.first_seen_at,
        last_seen_at: observed_at,
        last_emitted_at: if should_emit { Some(observed_at) } else { previous.last_emitted_at },
        last_recovered_at: previous.last_recovered_at,
        last_escalated_at: previous.last_escalated_at,
        repeat_count: previous.repeat_count + 1,
        escalation_level: previous.escalation_level,
        escalation_reason: previous.escalation_reason.clone(),
        is_open: true,
        message: breach.message.clone(),
    };
    AlertTransition { state, should_emit }
}

/// The escalation level this state should be at, with its reason.
///
/// Levels: 3 when the breach itself reached the escalated stage, 2 for
/// repeated CRITICAL breaches, 1 for sustained breaches of any severity,
/// else 0. Persist only on a strict increase.
pub fn target_escalation_level(
    state: &SlaAlertState,
    warning_repeat_escalate: i64,
    critical_repeat_escalate: i64,
) -> (i64, String) {
    let warning_repeat = warning_repeat_escalate.max(1);
    let critical_repeat = critical_repeat_escalate.max(1);

    if state.stage == BreachStage::Escalated {
        return (3, "breach stage escalated by SLA threshold".to_string());
    }
    if state.severity == SignalLevel::Critical && state.repeat_count >= critical_repeat {
        return (2, format!("critical breach repeated >= {critical_repeat}"));
    }
    if state.repeat_count >= warning_repeat {
        return (1, format!("sustained breach repeated >= {warning_repeat}"));
    }
    (0, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use evd_schemas::BreachType;

    fn breach(stage: BreachStage, severity: SignalLevel) -> SlaBreach {
        SlaBreach {
            connector_name: "ann_main".to_string(),
            source_name: "ann_cn".to_string(),
            breach_type: BreachType::PendingBacklog,
            severity,
            stage,
            message: "Pending failure backlog=2 exceeds warning threshold.".to_string(),
            freshness_minutes: Some(5),
            pending_failures: 2,
            dead_failures: 0,
            latest_run_status: None,
            latest_run_at: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap()
    }

    #[test]
    fn first_observation_opens_and_emits() {
        let transition = apply_breach(None, &breach(BreachStage::Warning, SignalLevel::Warning), t0(), 600);
        assert!(transition.should_emit);
        assert!(transition.state.is_open);
        assert_eq!(transition.state.repeat_count, 1);
        assert_eq!(transition.state.escalation_level, 0);
        assert_eq!(transition.state.first_seen_at, t0());
        assert_eq!(transition.state.last_emitted_at, Some(t0()));
    }

    #[test]
    fn repeat_within_cooldown_is_suppressed() {
        let b = breach(BreachStage::Warning, SignalLevel::Warning);
        let first = apply_breach(None, &b, t0(), 600);
        let second = apply_breach(Some(&first.state), &b, t0() + Duration::seconds(30), 600);
        assert!(!second.should_emit);
        assert_eq!(second.state.repeat_count, 2);
        // last_emitted_at did not move.
        assert_eq!(second.state.last_emitted_at, Some(t0()));
        assert!(second.state.first_seen_at <= second.state.last_seen_at);
    }

    #[test]
    fn stage_change_emits_despite_cooldown() {
        let first = apply_breach(None, &breach(BreachStage::Warning, SignalLevel::Warning), t0(), 600);
        let escalated = breach(BreachStage::Critical, SignalLevel::Critical);
        let second = apply_breach(Some(&first.state), &escalated, t0() + Duration::seconds(30), 600);
        assert!(second.should_emit);
        assert_eq!(second.state.stage, BreachStage::Critical);
    }

    #[test]
    fn cooldown_elapse_emits_again() {
        let b = breach(BreachStage::Warning, SignalLevel::Warning);
        let first = apply_breach(None, &b, t0(), 600);
        let second = apply_breach(Some(&first.state), &b, t0() + Duration::seconds(601), 600);
        assert!(second.should_emit);
        assert_eq!(second.state.last_emitted_at, Some(t0() + Duration::seconds(601)));
    }

    #[test]
    fn reopened_state_resets_repeat_and_escalation() {
        let b = breach(BreachStage::Warning, SignalLevel::Warning);
        let mut closed = apply_breach(None, &b, t0(), 600).state;
        closed.is_open = false;
        closed.repeat_count = 7;
        closed.escalation_level = 2;
        let reopened = apply_breach(Some(&closed), &b, t0() + Duration::hours(2), 600);
        assert!(reopened.should_emit);
        assert_eq!(reopened.state.repeat_count, 1);
        assert_eq!(reopened.state.escalation_level, 0);
    }

    #[test]
    fn escalation_targets_follow_stage_severity_and_repeats() {
        let b = breach(BreachStage::Warning, SignalLevel::Warning);
        let mut state = apply_breach(None, &b, t0(), 0).state;
        assert_eq!(target_escalation_level(&state, 3, 2).0, 0);

        state.repeat_count = 3;
        assert_eq!(target_escalation_level(&state, 3, 2).0, 1);

        state.severity = SignalLevel::Critical;
        state.repeat_count = 2;
        assert_eq!(target_escalation_level(&state, 3, 2).0, 2);

        state.stage = BreachStage::Escalated;
        let (level, reason) = target_escalation_level(&state, 3, 2);
        assert_eq!(level, 3);
        assert_eq!(reason, "breach stage escalated by SLA threshold");
    }
}
