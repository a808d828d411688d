use chrono::{Duration, NaiveDateTime};

use crate::db::PolicyStore;
use crate::error::PipelineError;
use crate::models::{Escalation, PatientRecord, Rule};

/// Reference instant for time-windowed rules: the most recent record's
/// datetime. Anchoring at wall-clock now would make matches over identical
/// data decay between runs.
pub fn anchor_instant(records: &[PatientRecord]) -> Option<NaiveDateTime> {
    records.iter().map(|r| r.datetime).max()
}

fn window_cutoff(anchor: NaiveDateTime, time_window_h: f64) -> NaiveDateTime {
    anchor - Duration::milliseconds((time_window_h * 3_600_000.0) as i64)
}

/// Evaluate one rule against the record history. A rule matches when at
/// least one eligible record satisfies its condition; the observed value is
/// taken from the most recent satisfying record.
fn evaluate_rule(rule: &Rule, records: &[PatientRecord], anchor: NaiveDateTime) -> Option<Escalation> {
    let cutoff = if rule.time_window_h > 0.0 {
        Some(window_cutoff(anchor, rule.time_window_h))
    } else {
        None
    };

    let observed = records
        .iter()
        .rev()
        .filter(|record| cutoff.map_or(true, |cutoff| record.datetime >= cutoff))
        .find_map(|record| {
            let value = record.signal_value(&rule.signal)?;
            rule.operator.evaluate(&value, &rule.value).then_some(value)
        })?;

    Some(Escalation {
        rule_id: rule.rule_id.clone(),
        category: rule.category.clone(),
        priority: rule.priority,
        signal: rule.signal.clone(),
        observed_value: observed.to_string(),
        threshold: rule.value.clone(),
        unit: rule.unit.clone(),
        action: rule.action.clone(),
        message: rule.message.clone(),
        justified: false,
    })
}

/// Match the full rule set against structured record values. Matches sharing
/// a dedupe key collapse to the highest-priority one; output is ordered
/// priority descending, rule_id ascending. Zero matches is an empty vec.
pub fn match_rules(records: &[PatientRecord], rules: &[Rule]) -> Vec<Escalation> {
    let Some(anchor) = anchor_instant(records) else {
        return Vec::new();
    };

    let mut matched: Vec<(String, Escalation)> = rules
        .iter()
        .filter_map(|rule| {
            evaluate_rule(rule, records, anchor)
                .map(|escalation| (rule.dedupe_key.clone(), escalation))
        })
        .collect();

    matched.sort_by(|(_, a), (_, b)| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    let mut seen = std::collections::HashSet::new();
    matched
        .into_iter()
        .filter(|(dedupe_key, _)| seen.insert(dedupe_key.clone()))
        .map(|(_, escalation)| escalation)
        .collect()
}

/// Rule-matching stage: fetch the rule set and evaluate it against the
/// patient's records. Store failures propagate; an empty match is success.
/// The fetched rules are returned too, so consolidation can cross-check
/// candidates against the same set this stage saw.
pub async fn match_escalations(
    store: &dyn PolicyStore,
    records: &[PatientRecord],
) -> Result<(Vec<Rule>, Vec<Escalation>), PipelineError> {
    let rules = store.fetch_all_rules().await?;
    let matched = match_rules(records, &rules);
    tracing::debug!(
        rules = rules.len(),
        matched = matched.len(),
        "evaluated escalation rules"
    );
    Ok((rules, matched))
}
