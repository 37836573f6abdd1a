//! Drift checks and the snapshot trend monitor.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde_json::json;
use sqlx::SqlitePool;

use evd_db as db;
use evd_schemas::{
    ContributionWindow, DriftAlert, DriftCheckRequest, DriftCheckResult, DriftMonitorPoint,
    DriftMonitorSummary, EventPolarity, SignalLevel, WindowMetrics,
};

use crate::adjudicate::feedback_summary;
use crate::compare::ContributionCompareRequest;
use crate::NlpGovernance;

pub(crate) fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

/// Baseline window: explicit bounds, or the window of the same span
/// immediately preceding the current one.
pub(crate) fn resolve_baseline(req: &DriftCheckRequest) -> (NaiveDate, NaiveDate) {
    if let (Some(start), Some(end)) = (req.baseline_start, req.baseline_end) {
        return (start, end);
    }
    let span_days = (req.current_end - req.current_start).num_days() + 1;
    let baseline_end = req.current_start - Duration::days(1);
    let baseline_start = baseline_end - Duration::days(span_days.max(1) - 1);
    (baseline_start, baseline_end)
}

/// Linear-interpolated quantile over a sorted slice; on exact positions the
/// lower index wins.
pub(crate) fn quantile(values_sorted: &[f64], q: f64) -> f64 {
    match values_sorted {
        [] => 0.0,
        [only] => *only,
        _ => {
            let q = q.clamp(0.0, 1.0);
            let pos = (values_sorted.len() - 1) as f64 * q;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            if lo == hi {
                values_sorted[lo]
            } else {
                let ratio = pos - lo as f64;
                values_sorted[lo] + (values_sorted[hi] - values_sorted[lo]) * ratio
            }
        }
    }
}

/// Aggregate NLP metrics over one window from the persisted events.
///
/// Hit rate counts rows that both matched at least one rule and resolved to
/// a non-generic event type. The ruleset version is the mode of the
/// `nlp_ruleset_version` metadata across rows (so historical windows stay
/// attributable to the ruleset that actually scored them), falling back to
/// the active version only when no row carries one.
pub(crate) async fn window_metrics(
    pool: &SqlitePool,
    source_name: Option<&str>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    fallback_ruleset_version: &str,
) -> Result<WindowMetrics> {
    let rows = db::load_event_rows_for_metrics(pool, source_name, start_date, end_date, 200_000).await?;
    let sample_size = rows.len() as i64;
    if sample_size == 0 {
        return Ok(WindowMetrics::empty(
            source_name.map(str::to_string),
            fallback_ruleset_version.to_string(),
        ));
    }

    let mut event_type_counter: BTreeMap<String, i64> = BTreeMap::new();
    let mut ruleset_counter: BTreeMap<String, i64> = BTreeMap::new();
    let mut scores: Vec<f64> = Vec::new();
    let mut hit_count = 0i64;
    let mut positive = 0i64;
    let mut negative = 0i64;
    let mut neutral = 0i64;

    for row in &rows {
        *event_type_counter.entry(row.event_type.clone()).or_insert(0) += 1;
        match row.polarity {
            EventPolarity::Positive => positive += 1,
            EventPolarity::Negative => negative += 1,
            EventPolarity::Neutral => neutral += 1,
        }
        if row.score.is_finite() {
            scores.push(row.score);
        }
        if let Some(version) = row.metadata.get("nlp_ruleset_version").and_then(|v| v.as_str()) {
            if !version.trim().is_empty() {
                *ruleset_counter.entry(version.trim().to_string()).or_insert(0) += 1;
            }
        }
        let matched = row
            .metadata
            .get("matched_rules")
            .and_then(|v| v.as_str())
            .map(|raw| raw.split(',').any(|x| !x.trim().is_empty()))
            .unwrap_or(false);
        if matched && row.event_type != "generic_announcement" {
            hit_count += 1;
        }
    }

    if scores.is_empty() {
        scores.push(0.0);
    }
    scores.sort_by(f64::total_cmp);

    let ruleset_version = ruleset_counter
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(version, _)| version.clone())
        .unwrap_or_else(|| fallback_ruleset_version.to_string());

    let mut top_event_types: Vec<(String, i64)> =
        event_type_counter.into_iter().collect();
    top_event_types.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_event_types.truncate(8);

    let denom = sample_size as f64;
    Ok(WindowMetrics {
        source_name: source_name.map(str::to_string),
        ruleset_version,
        sample_size,
        hit_count,
        hit_rate: round6(hit_count as f64 / denom),
        score_mean: round6(scores.iter().sum::<f64>() / scores.len() as f64),
        score_p10: round6(quantile(&scores, 0.1)),
        score_p50: round6(quantile(&scores, 0.5)),
        score_p90: round6(quantile(&scores, 0.9)),
        positive_ratio: round6(positive as f64 / denom),
        negative_ratio: round6(negative as f64 / denom),
        neutral_ratio: round6(neutral as f64 / denom),
        top_event_types,
    })
}

pub(crate) async fn drift_check(
    gov: &NlpGovernance,
    req: &DriftCheckRequest,
) -> Result<DriftCheckResult> {
    req.validate()?;
    let pool = gov.pool();
    let (baseline_start, baseline_end) = resolve_baseline(req);

    let fallback_version = db::get_active_ruleset(pool, false)
        .await?
        .map(|r| r.version)
        .unwrap_or_else(|| "builtin-v1".to_string());

    let current = window_metrics(
        pool,
        req.source_name.as_deref(),
        req.current_start,
        req.current_end,
        &fallback_version,
    )
    .await?;
    let baseline = window_metrics(
        pool,
        req.source_name.as_deref(),
        baseline_start,
        baseline_end,
        &fallback_version,
    )
    .await?;

    let ruleset_version = current.ruleset_version.clone();
    let hit_rate_delta = round6(current.hit_rate - baseline.hit_rate);
    let score_p50_delta = round6(current.score_p50 - baseline.score_p50);

    let mut alerts: Vec<DriftAlert> = Vec::new();
    let thresholds = &req.thresholds;

    if hit_rate_delta <= -thresholds.hit_rate_drop_critical {
        alerts.push(DriftAlert {
            severity: SignalLevel::Critical,
            metric: "hit_rate".to_string(),
            message: "NLP hit rate dropped beyond critical threshold.".to_string(),
            current: Some(current.hit_rate),
            baseline: Some(baseline.hit_rate),
            delta: Some(hit_rate_delta),
        });
    } else if hit_rate_delta <= -thresholds.hit_rate_drop_warning {
        alerts.push(DriftAlert {
            severity: SignalLevel::Warning,
            metric: "hit_rate".to_string(),
            message: "NLP hit rate dropped beyond warning threshold.".to_string(),
            current: Some(current.hit_rate),
            baseline: Some(baseline.hit_rate),
            delta: Some(hit_rate_delta),
        });
    }

    let score_shift = score_p50_delta.abs();
    if score_shift >= thresholds.score_p50_shift_critical {
        alerts.push(DriftAlert {
            severity: SignalLevel::Critical,
            metric: "score_p50_shift".to_string(),
            message: "NLP score p50 shifted beyond critical threshold.".to_string(),
            current: Some(current.score_p50),
            baseline: Some(baseline.score_p50),
            delta: Some(score_p50_delta),
        });
    } else if score_shift >= thresholds.score_p50_shift_warning {
        alerts.push(DriftAlert {
            severity: SignalLevel::Warning,
            metric: "score_p50_shift".to_string(),
            message: "NLP score p50 shifted beyond warning threshold.".to_string(),
            current: Some(current.score_p50),
            baseline: Some(baseline.score_p50),
            delta: Some(score_p50_delta),
        });
    }

    // Optional contribution compare through the external collaborator.
    let mut contribution_current = None;
    let mut contribution_baseline = None;
    let mut contribution_delta = None;
    if req.include_contribution {
        if let Some(comparator) = gov.comparator() {
            let run = async {
                let current_window = contribution_window(
                    comparator.as_ref(),
                    req,
                    req.current_start,
                    req.current_end,
                )
                .await?;
                let baseline_window = contribution_window(
                    comparator.as_ref(),
                    req,
                    baseline_start,
                    baseline_end,
                )
                .await?;
                Ok::<_, anyhow::Error>((current_window, baseline_window))
            }
            .await;
            match run {
                Ok((current_window, baseline_window)) => {
                    let delta = round6(
                        current_window.total_return_delta - baseline_window.total_return_delta,
                    );
                    if delta <= -thresholds.contribution_drop_critical {
                        alerts.push(DriftAlert {
                            severity: SignalLevel::Critical,
                            metric: "contribution_total_return_delta".to_string(),
                            message: "Event feature backtest contribution dropped beyond critical threshold."
                                .to_string(),
                            current: Some(current_window.total_return_delta),
                            baseline: Some(baseline_window.total_return_delta),
                            delta: Some(delta),
                        });
                    } else if delta <= -thresholds.contribution_drop_warning {
                        alerts.push(DriftAlert {
                            severity: SignalLevel::Warning,
                            metric: "contribution_total_return_delta".to_string(),
                            message: "Event feature backtest contribution dropped beyond warning threshold."
                                .to_string(),
                            current: Some(current_window.total_return_delta),
                            baseline: Some(baseline_window.total_return_delta),
                            delta: Some(delta),
                        });
                    }
                    contribution_current = Some(current_window);
                    contribution_baseline = Some(baseline_window);
                    contribution_delta = Some(delta);
                }
                Err(err) => {
                    alerts.push(DriftAlert {
                        severity: SignalLevel::Warning,
                        metric: "contribution_total_return_delta".to_string(),
                        message: format!("Contribution compare skipped: {err}"),
                        current: None,
                        baseline: None,
                        delta: None,
                    });
                }
            }
        }
    }

    // Optional labeled-feedback quality deltas.
    let mut feedback_current = None;
    let mut feedback_baseline = None;
    let mut feedback_polarity_accuracy_delta = None;
    let mut feedback_event_type_accuracy_delta = None;
    if req.include_feedback_quality {
        let current_summary = feedback_summary(
            pool,
            req.source_name.as_deref(),
            req.current_start,
            req.current_end,
        )
        .await?;
        let baseline_summary =
            feedback_summary(pool, req.source_name.as_deref(), baseline_start, baseline_end).await?;

        let enough = current_summary.sample_size >= req.feedback_min_samples
            && baseline_summary.sample_size >= req.feedback_min_samples;
        if enough {
            let polarity_delta =
                round6(current_summary.polarity_accuracy - baseline_summary.polarity_accuracy);
            let event_type_delta =
                round6(current_summary.event_type_accuracy - baseline_summary.event_type_accuracy);

            push_drop_alert(
                &mut alerts,
                "feedback_polarity_accuracy",
                "Labeled polarity accuracy",
                polarity_delta,
                current_summary.polarity_accuracy,
                baseline_summary.polarity_accuracy,
                thresholds.feedback_polarity_accuracy_drop_warning,
                thresholds.feedback_polarity_accuracy_drop_critical,
            );
            push_drop_alert(
                &mut alerts,
                "feedback_event_type_accuracy",
                "Labeled event-type accuracy",
                event_type_delta,
                current_summary.event_type_accuracy,
                baseline_summary.event_type_accuracy,
                thresholds.feedback_event_type_accuracy_drop_warning,
                thresholds.feedback_event_type_accuracy_drop_critical,
            );

            feedback_polarity_accuracy_delta = Some(polarity_delta);
            feedback_event_type_accuracy_delta = Some(event_type_delta);
        }
        feedback_current = Some(current_summary);
        feedback_baseline = Some(baseline_summary);
    }

    let mut result = DriftCheckResult {
        generated_at: Utc::now(),
        source_name: req.source_name.clone(),
        ruleset_version,
        current,
        baseline,
        hit_rate_delta,
        score_p50_delta,
        contribution_current,
        contribution_baseline,
        contribution_delta,
        feedback_current,
        feedback_baseline,
        feedback_polarity_accuracy_delta,
        feedback_event_type_accuracy_delta,
        alerts,
        snapshot_id: None,
    };

    if req.save_snapshot {
        let payload = serde_json::to_value(&result)?;
        let snapshot_id = db::insert_drift_snapshot(
            pool,
            req.source_name.as_deref(),
            &result.ruleset_version,
            req.current_start,
            req.current_end,
            baseline_start,
            baseline_end,
            &result.current,
            &result.baseline,
            hit_rate_delta,
            score_p50_delta,
            contribution_delta,
            feedback_polarity_accuracy_delta,
            feedback_event_type_accuracy_delta,
            &result.alerts,
            &payload,
        )
        .await?;
        result.snapshot_id = Some(snapshot_id);
    }

    if !result.alerts.is_empty() {
        gov.audit_event(
            "drift_check",
            if result.alerts.iter().any(|a| a.severity == SignalLevel::Critical) {
                "ERROR"
            } else {
                "OK"
            },
            json!({
                "source_name": result.source_name,
                "ruleset_version": result.ruleset_version,
                "hit_rate_delta": result.hit_rate_delta,
                "score_p50_delta": result.score_p50_delta,
                "alerts": result.alerts.len() as i64,
                "snapshot_id": result.snapshot_id,
            }),
        );
    }

    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn push_drop_alert(
    alerts: &mut Vec<DriftAlert>,
    metric: &str,
    label: &str,
    delta: f64,
    current: f64,
    baseline: f64,
    warning: f64,
    critical: f64,
) {
    if delta <= -critical {
        alerts.push(DriftAlert {
            severity: SignalLevel::Critical,
            metric: metric.to_string(),
            message: format!("{label} dropped beyond critical threshold."),
            current: Some(current),
            baseline: Some(baseline),
            delta: Some(delta),
        });
    } else if delta <= -warning {
        alerts.push(DriftAlert {
            severity: SignalLevel::Warning,
            metric: metric.to_string(),
            message: format!("{label} dropped beyond warning threshold."),
            current: Some(current),
            baseline: Some(baseline),
            delta: Some(delta),
        });
    }
}

async fn contribution_window(
    comparator: &dyn crate::ContributionComparator,
    req: &DriftCheckRequest,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<ContributionWindow> {
    let outcome = comparator
        .compare(&ContributionCompareRequest {
            symbol: req.contribution.symbol.clone(),
            strategy_name: req.contribution.strategy_name.clone(),
            start_date,
            end_date,
            event_lookback_days: req.contribution.event_lookback_days,
            event_decay_half_life_days: req.contribution.event_decay_half_life_days,
        })
        .await?;
    Ok(ContributionWindow {
        symbol: req.contribution.symbol.clone(),
        strategy_name: req.contribution.strategy_name.clone(),
        start_date,
        end_date,
        total_return_delta: outcome.total_return_delta,
        sharpe_delta: outcome.sharpe_delta,
        event_row_ratio: outcome.event_row_ratio,
        events_loaded: outcome.events_loaded,
    })
}

/// Classify the latest drift risk from the last `limit` snapshots.
///
/// CRITICAL when the latest snapshot carries critical alerts or at least
/// two snapshots in the window do; WARNING when the latest carries warnings
/// or at least three snapshots do; INFO otherwise.
pub(crate) async fn drift_monitor(
    pool: &SqlitePool,
    source_name: Option<&str>,
    limit: i64,
) -> Result<DriftMonitorSummary> {
    let snapshots = db::list_drift_snapshots(pool, source_name, limit.clamp(3, 365)).await?;
    if snapshots.is_empty() {
        return Ok(DriftMonitorSummary {
            generated_at: Utc::now(),
            source_name: source_name.map(str::to_string),
            window_size: 0,
            latest_snapshot_id: None,
            latest_ruleset_version: None,
            latest_risk_level: SignalLevel::Info,
            warning_alert_snapshots: 0,
            critical_alert_snapshots: 0,
            hit_rate_delta_trend: None,
            score_p50_delta_trend: None,
            contribution_delta_trend: None,
            feedback_polarity_accuracy_delta_trend: None,
            feedback_event_type_accuracy_delta_trend: None,
            points: Vec::new(),
        });
    }

    // Snapshot listing is latest-first; points run oldest -> latest.
    let mut points: Vec<DriftMonitorPoint> = Vec::new();
    let mut warning_snapshots = 0i64;
    let mut critical_snapshots = 0i64;
    for snapshot in snapshots.iter().rev() {
        let warning_alerts = snapshot
            .alerts
            .iter()
            .filter(|a| a.severity == SignalLevel::Warning)
            .count() as i64;
        let critical_alerts = snapshot
            .alerts
            .iter()
            .filter(|a| a.severity == SignalLevel::Critical)
            .count() as i64;
        if warning_alerts > 0 {
            warning_snapshots += 1;
        }
        if critical_alerts > 0 {
            critical_snapshots += 1;
        }
        points.push(DriftMonitorPoint {
            snapshot_id: snapshot.id,
            created_at: snapshot.created_at,
            ruleset_version: snapshot.ruleset_version.clone(),
            hit_rate_delta: snapshot.hit_rate_delta,
            score_p50_delta: snapshot.score_p50_delta,
            contribution_delta: snapshot.contribution_delta,
            feedback_polarity_accuracy_delta: snapshot.feedback_polarity_accuracy_delta,
            feedback_event_type_accuracy_delta: snapshot.feedback_event_type_accuracy_delta,
            warning_alerts,
            critical_alerts,
        });
    }

    let latest = points.last().expect("non-empty points").clone();
    let first = points.first().expect("non-empty points").clone();
    let latest_risk_level = if latest.critical_alerts > 0 || critical_snapshots >= 2 {
        SignalLevel::Critical
    } else if latest.warning_alerts > 0 || warning_snapshots >= 3 {
        SignalLevel::Warning
    } else {
        SignalLevel::Info
    };

    let optional_trend = |latest: Option<f64>, first: Option<f64>| match (latest, first) {
        (Some(l), Some(f)) => Some(round6(l - f)),
        _ => None,
    };

    Ok(DriftMonitorSummary {
        generated_at: Utc::now(),
        source_name: source_name.map(str::to_string),
        window_size: points.len() as i64,
        latest_snapshot_id: Some(latest.snapshot_id),
        latest_ruleset_version: Some(latest.ruleset_version.clone()),
        latest_risk_level,
        warning_alert_snapshots: warning_snapshots,
        critical_alert_snapshots: critical_snapshots,
        hit_rate_delta_trend: Some(round6(latest.hit_rate_delta - first.hit_rate_delta)),
        score_p50_delta_trend: Some(round6(latest.score_p50_delta - first.score_p50_delta)),
        contribution_delta_trend: optional_trend(latest.contribution_delta, first.contribution_delta),
        feedback_polarity_accuracy_delta_trend: optional_trend(
            latest.feedback_polarity_accuracy_delta,
            first.feedback_polarity_accuracy_delta,
        ),
        feedback_event_type_accuracy_delta_trend: optional_trend(
            latest.feedback_event_type_accuracy_delta,
            first.feedback_event_type_accuracy_delta,
        ),
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_interpolates_linearly() {
        let values = [0.1, 0.2, 0.3, 0.4];
        assert_eq!(quantile(&values, 0.0), 0.1);
        assert_eq!(quantile(&values, 1.0), 0.4);
        assert!((quantile(&values, 0.5) - 0.25).abs() < 1e-12);
        assert!((quantile(&values, 0.1) - 0.13).abs() < 1e-12);
        assert_eq!(quantile(&[], 0.5), 0.0);
        assert_eq!(quantile(&[0.7], 0.9), 0.7);
    }

    #[test]
    fn baseline_mirrors_current_span() {
        let req = DriftCheckRequest::new(
            NaiveDate::from_ymd_opt(2024, 5, 11).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        );
        let (start, end) = resolve_baseline(&req);
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 5, 10).unwrap());
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 5, 4).unwrap());
    }

    #[test]
    fn explicit_baseline_wins() {
        let mut req = DriftCheckRequest::new(
            NaiveDate::from_ymd_opt(2024, 5, 11).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        );
        req.baseline_start = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap().into();
        req.baseline_end = NaiveDate::from_ymd_opt(2024, 4, 7).unwrap().into();
        let (start, end) = resolve_baseline(&req);
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 4, 7).unwrap());
    }

    #[test]
    fn round6_is_stable() {
        assert_eq!(round6(0.1234567), 0.123457);
        assert_eq!(round6(-0.1234564), -0.123456);
    }
}
