use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One observation row from the medical records store. Immutable once read.
#[derive(Debug, Clone)]
pub struct PatientRecord {
    pub patient_id: String,
    pub datetime: NaiveDateTime,
    pub condition: String,
    pub vitals_bp: Option<String>,
    pub vitals_hr: Option<f64>,
    pub vitals_rr: Option<f64>,
    pub vitals_temp: Option<f64>,
    pub vitals_spo2: Option<f64>,
    pub medications: Option<String>,
}

/// A value a rule's signal resolves to on a given record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(t) => write!(f, "{t}"),
        }
    }
}

impl PatientRecord {
    /// Resolve a rule signal name against this record's fields.
    /// Returns `None` when the field is absent or not recorded for this row.
    pub fn signal_value(&self, signal: &str) -> Option<FieldValue> {
        match signal {
            "vitals_HR" => self.vitals_hr.map(FieldValue::Number),
            "vitals_RR" => self.vitals_rr.map(FieldValue::Number),
            "vitals_Temp" => self.vitals_temp.map(FieldValue::Number),
            "vitals_SpO2" => self.vitals_spo2.map(FieldValue::Number),
            "vitals_BP" => self.vitals_bp.clone().map(FieldValue::Text),
            "condition" => Some(FieldValue::Text(self.condition.clone())),
            "medications" => self.medications.clone().map(FieldValue::Text),
            _ => None,
        }
    }
}

/// Escalation priority. Ordering is clinical severity: Low < Medium < High < Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Parse the free-text priority column ("High", "CRITICAL", ...).
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Critical => "Critical",
        }
    }
}

/// Comparison kind a rule applies to its signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Operator {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            ">" => Some(Operator::Gt),
            "<" => Some(Operator::Lt),
            ">=" => Some(Operator::Ge),
            "<=" => Some(Operator::Le),
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }

    /// Evaluate `observed <op> threshold`. Numeric comparison when both sides
    /// are numeric; equality operators fall back to case-insensitive text
    /// comparison; ordering operators never match non-numeric values.
    pub fn evaluate(&self, observed: &FieldValue, threshold: &str) -> bool {
        let threshold_num: Option<f64> = threshold.trim().parse().ok();
        let observed_num = match observed {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(t) => t.trim().parse().ok(),
        };

        if let (Some(lhs), Some(rhs)) = (observed_num, threshold_num) {
            return match self {
                Operator::Gt => lhs > rhs,
                Operator::Lt => lhs < rhs,
                Operator::Ge => lhs >= rhs,
                Operator::Le => lhs <= rhs,
                Operator::Eq => lhs == rhs,
                Operator::Ne => lhs != rhs,
            };
        }

        let lhs = observed.to_string();
        let equal = lhs.trim().eq_ignore_ascii_case(threshold.trim());
        match self {
            Operator::Eq => equal,
            Operator::Ne => !equal,
            _ => false,
        }
    }
}

/// One escalation policy from the clinical rules store. Loaded in bulk, never mutated.
#[derive(Debug, Clone)]
pub struct Rule {
    pub rule_id: String,
    pub category: String,
    pub priority: Priority,
    pub signal: String,
    pub operator: Operator,
    pub value: String,
    pub unit: Option<String>,
    /// 0 means the rule is not time-bounded.
    pub time_window_h: f64,
    pub action: String,
    pub message: String,
    pub dedupe_key: String,
}

/// Structured SBAR handover note, one per pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbarDocument {
    pub situation: String,
    pub background: String,
    pub assessment: String,
    pub recommendation: String,
}

impl SbarDocument {
    pub fn is_well_formed(&self) -> bool {
        !self.situation.trim().is_empty()
            && !self.background.trim().is_empty()
            && !self.assessment.trim().is_empty()
            && !self.recommendation.trim().is_empty()
    }
}

/// A matched rule, with enough copied-through fields to display on its own.
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub rule_id: String,
    pub category: String,
    pub priority: Priority,
    pub signal: String,
    pub observed_value: String,
    pub threshold: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub action: String,
    pub message: String,
    pub justified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_escalations: usize,
    pub priority_level: Priority,
    pub requires_immediate_attention: bool,
    pub next_actions: Vec<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal artifact of a pipeline run. Field names are the wire contract.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub patient_id: String,
    pub sbar: SbarDocument,
    pub escalations: Vec<Escalation>,
    pub summary: ReportSummary,
}
