//! Multi-labeler adjudication into consensus labels, plus labeled-feedback
//! quality summaries.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;

use evd_db as db;
use evd_schemas::{
    AdjudicationItem, AdjudicationRequest, AdjudicationResult, ConsensusRecord, EventPolarity,
    FeedbackSummary, LabelEntryRecord,
};

use crate::drift::round6;

const SCORE_DISPERSION_STD: f64 = 0.18;

/// Collapse multi-labeler entries into per-event consensus.
///
/// Events with fewer than `min_labelers` entries are skipped. Consensus is
/// the mode of event types and polarities; the score is the median labeled
/// score, falling back to the mean predicted score. Conflicts are recorded
/// but do not block a consensus row.
pub(crate) async fn adjudicate_labels(
    pool: &SqlitePool,
    req: &AdjudicationRequest,
) -> Result<AdjudicationResult> {
    req.validate()?;
    let rows = db::load_label_entries_for_scope(
        pool,
        req.source_name.as_deref(),
        &req.event_ids,
        req.start_date,
        req.end_date,
        500_000,
    )
    .await?;

    let mut grouped: BTreeMap<(String, String), Vec<&LabelEntryRecord>> = BTreeMap::new();
    for row in &rows {
        grouped
            .entry((row.source_name.clone(), row.event_id.clone()))
            .or_default()
            .push(row);
    }

    let total_events = grouped.len() as i64;
    let mut items: Vec<AdjudicationItem> = Vec::new();
    let mut adjudicated = 0i64;
    let mut conflicts = 0i64;
    let mut skipped = 0i64;

    for ((source_name, event_id), group) in &grouped {
        let label_count = group.len() as i64;
        if label_count < req.min_labelers {
            skipped += 1;
            continue;
        }

        let mut labelers: Vec<String> = group.iter().map(|x| x.labeler.clone()).collect();
        labelers.sort();
        labelers.dedup();

        let event_type_counter = count_by(group.iter().map(|x| x.label_event_type.clone()));
        let polarity_counter = count_by(group.iter().map(|x| x.label_polarity.as_str().to_string()));
        let event_top = top_two(&event_type_counter);
        let polarity_top = top_two(&polarity_counter);

        let consensus_event_type = event_top.first().map(|(name, _)| name.clone());
        let consensus_polarity = polarity_top
            .first()
            .and_then(|(name, _)| EventPolarity::parse(name).ok());

        let label_scores: Vec<f64> = group.iter().filter_map(|x| x.label_score).collect();
        let consensus_score = if !label_scores.is_empty() {
            Some(round6(median(&label_scores)))
        } else {
            let predicted: Vec<f64> = group.iter().map(|x| x.predicted_score).collect();
            if predicted.is_empty() {
                None
            } else {
                Some(round6(predicted.iter().sum::<f64>() / predicted.len() as f64))
            }
        };

        let type_conf = event_top.first().map(|(_, n)| *n as f64 / label_count as f64).unwrap_or(0.0);
        let polarity_conf =
            polarity_top.first().map(|(_, n)| *n as f64 / label_count as f64).unwrap_or(0.0);
        let consensus_confidence = round6((type_conf + polarity_conf) / 2.0);

        let mut conflict_reasons: Vec<String> = Vec::new();
        if event_type_counter.len() > 1 {
            conflict_reasons.push("event_type_disagreement".to_string());
        }
        if polarity_counter.len() > 1 {
            conflict_reasons.push("polarity_disagreement".to_string());
        }
        if event_top.len() > 1 && event_top[0].1 == event_top[1].1 {
            conflict_reasons.push("event_type_tie".to_string());
        }
        if polarity_top.len() > 1 && polarity_top[0].1 == polarity_top[1].1 {
            conflict_reasons.push("polarity_tie".to_string());
        }
        if req.require_unanimous && (event_type_counter.len() > 1 || polarity_counter.len() > 1) {
            conflict_reasons.push("require_unanimous_not_met".to_string());
        }
        if !label_scores.is_empty() {
            let mean = label_scores.iter().sum::<f64>() / label_scores.len() as f64;
            let var = label_scores.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / label_scores.len() as f64;
            if var.max(0.0).sqrt() >= SCORE_DISPERSION_STD {
                conflict_reasons.push("score_dispersion_high".to_string());
            }
        }

        let conflict = !conflict_reasons.is_empty();
        if conflict {
            conflicts += 1;
        }

        let first = group[0];
        let item = AdjudicationItem {
            source_name: source_name.clone(),
            event_id: event_id.clone(),
            symbol: first.symbol.clone(),
            publish_time: first.publish_time,
            label_count,
            labelers,
            consensus_event_type: consensus_event_type.clone(),
            consensus_polarity,
            consensus_score,
            consensus_confidence,
            conflict,
            conflict_reasons: conflict_reasons.clone(),
        };

        if req.save_consensus {
            if let (Some(event_type), Some(polarity)) = (&consensus_event_type, consensus_polarity) {
                db::upsert_consensus(
                    pool,
                    &ConsensusRecord {
                        id: 0,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                        source_name: source_name.clone(),
                        event_id: event_id.clone(),
                        symbol: item.symbol.clone(),
                        publish_time: item.publish_time,
                        consensus_event_type: event_type.clone(),
                        consensus_polarity: polarity,
                        consensus_score,
                        consensus_confidence,
                        label_count,
                        conflict,
                        conflict_reasons,
                        adjudicated_by: req.adjudicated_by.clone(),
                        label_version: req.label_version.clone(),
                    },
                )
                .await?;
            }
        }

        items.push(item);
        adjudicated += 1;
    }

    items.sort_by(|a, b| b.publish_time.cmp(&a.publish_time));
    Ok(AdjudicationResult {
        generated_at: Utc::now(),
        source_name: req.source_name.clone(),
        total_events,
        adjudicated,
        conflicts,
        skipped,
        items,
    })
}

/// Prediction-vs-label accuracy over one window.
pub(crate) async fn feedback_summary(
    pool: &SqlitePool,
    source_name: Option<&str>,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<FeedbackSummary> {
    let rows =
        db::list_feedback(pool, source_name, None, Some(start_date), Some(end_date), 5000).await?;
    if rows.is_empty() {
        return Ok(FeedbackSummary {
            source_name: source_name.map(str::to_string),
            start_date,
            end_date,
            sample_size: 0,
            polarity_accuracy: 0.0,
            event_type_accuracy: 0.0,
            score_mae: None,
            top_mismatches: Vec::new(),
        });
    }

    let sample_size = rows.len() as i64;
    let mut polarity_hit = 0i64;
    let mut event_type_hit = 0i64;
    let mut score_abs_errors: Vec<f64> = Vec::new();
    let mut mismatch_counter: BTreeMap<String, i64> = BTreeMap::new();

    for row in &rows {
        if row.predicted_polarity == row.label_polarity {
            polarity_hit += 1;
        }
        if row.predicted_event_type == row.label_event_type {
            event_type_hit += 1;
        } else {
            let key = format!("{}->{}", row.predicted_event_type, row.label_event_type);
            *mismatch_counter.entry(key).or_insert(0) += 1;
        }
        if let Some(label_score) = row.label_score {
            score_abs_errors.push((row.predicted_score - label_score).abs());
        }
    }

    let mut top_mismatches: Vec<(String, i64)> = mismatch_counter.into_iter().collect();
    top_mismatches.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_mismatches.truncate(8);

    Ok(FeedbackSummary {
        source_name: source_name.map(str::to_string),
        start_date,
        end_date,
        sample_size,
        polarity_accuracy: round6(polarity_hit as f64 / sample_size as f64),
        event_type_accuracy: round6(event_type_hit as f64 / sample_size as f64),
        score_mae: if score_abs_errors.is_empty() {
            None
        } else {
            Some(round6(score_abs_errors.iter().sum::<f64>() / score_abs_errors.len() as f64))
        },
        top_mismatches,
    })
}

fn count_by(values: impl Iterator<Item = String>) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for value in values {
        *out.entry(value).or_insert(0) += 1;
    }
    out
}

/// The two most frequent entries; count descending, name ascending on ties.
fn top_two(counter: &BTreeMap<String, i64>) -> Vec<(String, i64)> {
    let mut entries: Vec<(String, i64)> = counter.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(2);
    entries
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
