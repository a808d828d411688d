use uuid::Uuid;

use crate::consolidate;
use crate::db::{PolicyStore, RecordStore};
use crate::error::PipelineError;
use crate::llm::Generator;
use crate::matching;
use crate::models::{Escalation, PatientRecord, Report, Rule, SbarDocument};
use crate::summarize;

/// Coordinator states. Transitions are strictly sequential; `Failed` is
/// absorbing and only reachable from a summarization generation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Summarizing,
    Matching,
    Consolidating,
    Done,
    Failed,
}

/// Cumulative context threaded through the stages. Later stages see the
/// full output of earlier ones so consolidation can cross-check.
#[derive(Default)]
struct PipelineContext {
    records: Vec<PatientRecord>,
    rules: Vec<Rule>,
    sbar: Option<SbarDocument>,
    candidates: Vec<Escalation>,
    degradation: Option<String>,
}

pub struct Pipeline<'a> {
    records: &'a dyn RecordStore,
    policies: &'a dyn PolicyStore,
    generator: &'a dyn Generator,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        records: &'a dyn RecordStore,
        policies: &'a dyn PolicyStore,
        generator: &'a dyn Generator,
    ) -> Self {
        Self {
            records,
            policies,
            generator,
        }
    }

    /// Run the three stages for one patient. Returns a well-formed report,
    /// possibly degraded with an error annotation, or `GenerationFailure`
    /// when no SBAR could be produced at all.
    pub async fn run_pipeline(&self, patient_id: &str) -> Result<Report, PipelineError> {
        let run_id = Uuid::new_v4();
        let mut ctx = PipelineContext::default();
        let mut stage = Stage::Summarizing;
        let mut outcome: Option<Result<Report, PipelineError>> = None;

        while outcome.is_none() {
            stage = match stage {
                Stage::Summarizing => {
                    match summarize::summarize(self.records, self.generator, patient_id).await {
                        Ok((records, sbar)) => {
                            ctx.records = records;
                            ctx.sbar = Some(sbar);
                            Stage::Matching
                        }
                        Err(error) if error.is_degradable() => {
                            tracing::warn!(%run_id, patient_id, %error, "summarization degraded");
                            ctx.degradation = Some(error.to_string());
                            Stage::Consolidating
                        }
                        Err(error) => {
                            tracing::error!(%run_id, patient_id, %error, "summarization failed");
                            outcome = Some(Err(error));
                            Stage::Failed
                        }
                    }
                }
                Stage::Matching => match matching::match_escalations(self.policies, &ctx.records)
                    .await
                {
                    Ok((rules, candidates)) => {
                        ctx.rules = rules;
                        ctx.candidates = candidates;
                        Stage::Consolidating
                    }
                    Err(error) if error.is_degradable() => {
                        tracing::warn!(%run_id, patient_id, %error, "rule matching degraded");
                        ctx.degradation = Some(error.to_string());
                        Stage::Consolidating
                    }
                    Err(error) => {
                        tracing::error!(%run_id, patient_id, %error, "rule matching failed");
                        outcome = Some(Err(error));
                        Stage::Failed
                    }
                },
                Stage::Consolidating => {
                    let report = consolidate::consolidate(
                        patient_id,
                        ctx.sbar.take(),
                        &ctx.records,
                        &ctx.rules,
                        std::mem::take(&mut ctx.candidates),
                        ctx.degradation.take(),
                    );
                    tracing::info!(
                        %run_id,
                        patient_id,
                        escalations = report.summary.total_escalations,
                        priority = report.summary.priority_level.as_str(),
                        "pipeline run complete"
                    );
                    outcome = Some(Ok(report));
                    Stage::Done
                }
                Stage::Done | Stage::Failed => stage,
            };
        }

        outcome.unwrap_or_else(|| {
            Err(PipelineError::GenerationFailure(
                "pipeline ended without producing output".to_string(),
            ))
        })
    }
}
