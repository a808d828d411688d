use thiserror::Error;

/// Errors a pipeline stage can raise. Only `GenerationFailure` during
/// summarization is fatal to a run; everything else degrades into a
/// report with an explicit error annotation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no records found for patient {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store reachable but returned zero rows for patient {0}")]
    NoData(String),

    #[error("generation failed: {0}")]
    GenerationFailure(String),

    /// Raised per-candidate inside consolidation when an escalation fails
    /// its cross-check. Never surfaced to callers.
    #[error("escalation {rule_id} not supported by patient data: {reason}")]
    ValidationFailure { rule_id: String, reason: String },
}

impl PipelineError {
    /// Whether the coordinator should still hand the run to consolidation
    /// for a degraded report instead of failing outright.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            PipelineError::NotFound(_)
                | PipelineError::Unavailable(_)
                | PipelineError::NoData(_)
        )
    }
}
