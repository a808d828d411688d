use crate::error::PipelineError;
use crate::matching;
use crate::models::{
    Escalation, PatientRecord, Priority, Report, ReportSummary, Rule, SbarDocument,
};

/// Cross-check one candidate against the data the SBAR was derived from.
/// The rule must exist in the fetched rule set (nothing fabricated survives)
/// and must still match when independently re-evaluated against the records.
fn cross_check(
    candidate: &Escalation,
    records: &[PatientRecord],
    rules: &[Rule],
) -> Result<(), PipelineError> {
    let Some(rule) = rules.iter().find(|rule| rule.rule_id == candidate.rule_id) else {
        return Err(PipelineError::ValidationFailure {
            rule_id: candidate.rule_id.clone(),
            reason: "rule is not present in the policy store".to_string(),
        });
    };

    let reconfirmed = matching::match_rules(records, std::slice::from_ref(rule));
    if reconfirmed.is_empty() {
        return Err(PipelineError::ValidationFailure {
            rule_id: candidate.rule_id.clone(),
            reason: format!(
                "{} {} {} not supported by the patient records",
                rule.signal,
                rule.operator.as_str(),
                rule.value
            ),
        });
    }

    Ok(())
}

fn next_actions(escalations: &[Escalation]) -> Vec<String> {
    let mut actions = Vec::new();
    for escalation in escalations {
        if !actions.contains(&escalation.action) {
            actions.push(escalation.action.clone());
        }
    }
    actions
}

fn empty_sbar() -> SbarDocument {
    SbarDocument {
        situation: String::new(),
        background: String::new(),
        assessment: String::new(),
        recommendation: String::new(),
    }
}

/// Emit a valid report even when earlier stages produced nothing usable.
pub fn degraded_report(patient_id: &str, sbar: Option<SbarDocument>, reason: &str) -> Report {
    Report {
        patient_id: patient_id.to_string(),
        sbar: sbar.unwrap_or_else(empty_sbar),
        escalations: Vec::new(),
        summary: ReportSummary {
            total_escalations: 0,
            priority_level: Priority::Low,
            requires_immediate_attention: false,
            next_actions: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            error: Some(reason.to_string()),
        },
    }
}

/// Consolidation stage: validate each candidate against the cumulative
/// context, drop the unsupported ones (never downgrade), and compute the
/// overall assessment. Candidates are assumed already ordered by matching.
/// `degradation` carries an upstream failure note into `summary.error` so a
/// partial run never reads as a bare empty success.
pub fn consolidate(
    patient_id: &str,
    sbar: Option<SbarDocument>,
    records: &[PatientRecord],
    rules: &[Rule],
    candidates: Vec<Escalation>,
    degradation: Option<String>,
) -> Report {
    let Some(sbar) = sbar.filter(SbarDocument::is_well_formed) else {
        let reason =
            degradation.unwrap_or_else(|| "SBAR data missing or malformed".to_string());
        return degraded_report(patient_id, None, &reason);
    };

    let mut escalations = Vec::new();
    for mut candidate in candidates {
        match cross_check(&candidate, records, rules) {
            Ok(()) => {
                candidate.justified = true;
                escalations.push(candidate);
            }
            Err(error) => {
                tracing::debug!(%error, "dropping unjustified escalation");
            }
        }
    }

    let priority_level = escalations
        .iter()
        .map(|e| e.priority)
        .max()
        .unwrap_or(Priority::Low);

    Report {
        patient_id: patient_id.to_string(),
        summary: ReportSummary {
            total_escalations: escalations.len(),
            priority_level,
            requires_immediate_attention: priority_level >= Priority::High,
            next_actions: next_actions(&escalations),
            timestamp: chrono::Utc::now().to_rfc3339(),
            error: degradation,
        },
        sbar,
        escalations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::models::Operator;

    fn record(hr: f64) -> PatientRecord {
        PatientRecord {
            patient_id: "ER101".to_string(),
            datetime: NaiveDate::from_ymd_opt(2025, 3, 4)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            condition: "Sepsis".to_string(),
            vitals_bp: None,
            vitals_hr: Some(hr),
            vitals_rr: None,
            vitals_temp: None,
            vitals_spo2: None,
            medications: None,
        }
    }

    fn hr_rule(rule_id: &str, priority: Priority, threshold: &str) -> Rule {
        Rule {
            rule_id: rule_id.to_string(),
            category: "vitals".to_string(),
            priority,
            signal: "vitals_HR".to_string(),
            operator: Operator::Gt,
            value: threshold.to_string(),
            unit: Some("bpm".to_string()),
            time_window_h: 0.0,
            action: format!("act on {rule_id}"),
            message: "heart rate high".to_string(),
            dedupe_key: "tachycardia".to_string(),
        }
    }

    fn candidate_for(rule: &Rule, observed: &str) -> Escalation {
        Escalation {
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
        }
    }

    fn sbar() -> SbarDocument {
        SbarDocument {
            situation: "Admitted with sepsis.".to_string(),
            background: "No prior history.".to_string(),
            assessment: "HR 130, tachycardic.".to_string(),
            recommendation: "Monitor closely.".to_string(),
        }
    }

    #[test]
    fn supported_candidate_is_justified() {
        let records = vec![record(130.0)];
        let rules = vec![hr_rule("HR_HIGH", Priority::High, "120")];
        let candidates = vec![candidate_for(&rules[0], "130")];

        let report = consolidate("ER101", Some(sbar()), &records, &rules, candidates, None);

        assert_eq!(report.escalations.len(), 1);
        assert!(report.escalations[0].justified);
        assert_eq!(report.summary.total_escalations, 1);
        assert_eq!(report.summary.priority_level, Priority::High);
        assert!(report.summary.requires_immediate_attention);
        assert_eq!(report.summary.next_actions, vec!["act on HR_HIGH".to_string()]);
        assert!(report.summary.error.is_none());
    }

    #[test]
    fn fabricated_rule_is_dropped() {
        let records = vec![record(130.0)];
        let rules = vec![hr_rule("HR_HIGH", Priority::High, "120")];
        let ghost = hr_rule("HR_INVENTED", Priority::Critical, "50");
        let candidates = vec![candidate_for(&ghost, "130")];

        let report = consolidate("ER101", Some(sbar()), &records, &rules, candidates, None);

        assert!(report.escalations.is_empty());
        assert_eq!(report.summary.priority_level, Priority::Low);
        assert!(!report.summary.requires_immediate_attention);
    }

    #[test]
    fn unsupported_candidate_is_dropped_not_downgraded() {
        // Candidate claims a threshold breach the records do not show.
        let records = vec![record(90.0)];
        let rules = vec![hr_rule("HR_HIGH", Priority::High, "120")];
        let candidates = vec![candidate_for(&rules[0], "130")];

        let report = consolidate("ER101", Some(sbar()), &records, &rules, candidates, None);

        assert!(report.escalations.is_empty());
        assert_eq!(report.summary.total_escalations, 0);
        assert_eq!(report.summary.priority_level, Priority::Low);
    }

    #[test]
    fn no_survivors_defaults_to_low() {
        let records = vec![record(80.0)];
        let report = consolidate("ER101", Some(sbar()), &records, &[], vec![], None);

        assert_eq!(report.summary.priority_level, Priority::Low);
        assert!(!report.summary.requires_immediate_attention);
        assert!(report.summary.next_actions.is_empty());
    }

    #[test]
    fn next_actions_deduplicate_in_insertion_order() {
        let records = vec![record(130.0)];
        let mut shared_action = hr_rule("HR_HIGH", Priority::High, "120");
        shared_action.dedupe_key = "a".to_string();
        let mut other = hr_rule("HR_ALSO", Priority::Medium, "100");
        other.action = shared_action.action.clone();
        other.dedupe_key = "b".to_string();
        let mut third = hr_rule("HR_MORE", Priority::Medium, "110");
        third.dedupe_key = "c".to_string();
        let rules = vec![shared_action.clone(), other.clone(), third.clone()];

        let candidates = vec![
            candidate_for(&shared_action, "130"),
            candidate_for(&other, "130"),
            candidate_for(&third, "130"),
        ];
        let report = consolidate("ER101", Some(sbar()), &records, &rules, candidates, None);

        assert_eq!(
            report.summary.next_actions,
            vec!["act on HR_HIGH".to_string(), "act on HR_MORE".to_string()]
        );
    }

    #[test]
    fn missing_sbar_degrades_with_error_marker() {
        let report = consolidate("ER102", None, &[], &[], vec![], None);

        assert_eq!(report.patient_id, "ER102");
        assert!(report.escalations.is_empty());
        assert_eq!(report.summary.total_escalations, 0);
        assert_eq!(report.summary.priority_level, Priority::Low);
        assert!(report.summary.error.is_some());
    }

    #[test]
    fn malformed_sbar_degrades_even_with_candidates() {
        let records = vec![record(130.0)];
        let rules = vec![hr_rule("HR_HIGH", Priority::High, "120")];
        let candidates = vec![candidate_for(&rules[0], "130")];
        let blank = SbarDocument {
            situation: String::new(),
            background: "b".to_string(),
            assessment: "a".to_string(),
            recommendation: "r".to_string(),
        };

        let report = consolidate("ER101", Some(blank), &records, &rules, candidates, None);

        assert!(report.escalations.is_empty());
        assert!(report.summary.error.is_some());
    }

    #[test]
    fn upstream_degradation_is_annotated_alongside_sbar() {
        let report = consolidate(
            "ER101",
            Some(sbar()),
            &[record(80.0)],
            &[],
            vec![],
            Some("store unavailable: connection refused".to_string()),
        );

        assert!(report.sbar.is_well_formed());
        assert!(report.escalations.is_empty());
        assert_eq!(
            report.summary.error.as_deref(),
            Some("store unavailable: connection refused")
        );
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let report = consolidate("ER101", Some(sbar()), &[record(80.0)], &[], vec![], None);
        assert!(chrono::DateTime::parse_from_rfc3339(&report.summary.timestamp).is_ok());
    }
}
