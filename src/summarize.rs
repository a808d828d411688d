use serde::Serialize;

use crate::db::RecordStore;
use crate::error::PipelineError;
use crate::llm::Generator;
use crate::models::{PatientRecord, SbarDocument};

/// Fixed instructions handed to the generator. The reply must be a JSON
/// object with exactly the four SBAR keys, synthesized only from the
/// structured facts provided as context.
const SBAR_INSTRUCTIONS: &str = "You are an expert clinical assistant writing an SBAR handover note. \
Using ONLY the facts in the provided JSON context, write a clear and concise note:\n\
- situation: brief current issue and reason for admission\n\
- background: relevant history and medications\n\
- assessment: current condition, vitals, key findings\n\
- recommendation: next steps and follow-up actions\n\
Respond with a single JSON object with exactly the keys \
\"situation\", \"background\", \"assessment\", \"recommendation\", each a non-empty string. \
Do not add facts that are not present in the context. No extra commentary.";

/// The facts eligible as input to each SBAR section. Selection is fixed so
/// the same record set always yields the same generator context.
#[derive(Debug, Serialize)]
pub struct SectionInputs {
    pub situation: SituationInputs,
    pub background: BackgroundInputs,
    pub assessment: AssessmentInputs,
    pub recommendation: RecommendationInputs,
}

/// Most recent condition and when it was observed.
#[derive(Debug, Serialize)]
pub struct SituationInputs {
    pub patient_id: String,
    pub current_condition: String,
    pub observed_at: String,
}

/// Full-history context, earliest first.
#[derive(Debug, Serialize)]
pub struct BackgroundInputs {
    pub condition_history: Vec<String>,
    pub medications: Vec<String>,
    pub first_observed_at: String,
}

/// Most recent record's vitals and condition.
#[derive(Debug, Serialize)]
pub struct AssessmentInputs {
    pub condition: String,
    pub vitals: Vec<VitalReading>,
}

/// Latest vitals plus active medications, for follow-up framing.
#[derive(Debug, Serialize)]
pub struct RecommendationInputs {
    pub condition: String,
    pub vitals: Vec<VitalReading>,
    pub active_medications: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VitalReading {
    pub name: String,
    pub value: String,
}

fn latest_vitals(record: &PatientRecord) -> Vec<VitalReading> {
    let mut vitals = Vec::new();
    if let Some(bp) = &record.vitals_bp {
        vitals.push(VitalReading {
            name: "vitals_BP".to_string(),
            value: bp.clone(),
        });
    }
    for (name, value) in [
        ("vitals_HR", record.vitals_hr),
        ("vitals_RR", record.vitals_rr),
        ("vitals_Temp", record.vitals_temp),
        ("vitals_SpO2", record.vitals_spo2),
    ] {
        if let Some(value) = value {
            vitals.push(VitalReading {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }
    vitals
}

fn distinct_in_order(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

/// Partition the ordered record history into per-section inputs.
/// Records must be non-empty and ordered by datetime ascending.
pub fn select_inputs(records: &[PatientRecord]) -> SectionInputs {
    let earliest = &records[0];
    let latest = &records[records.len() - 1];

    let medications = distinct_in_order(
        records
            .iter()
            .filter_map(|r| r.medications.clone())
            .flat_map(|m| {
                m.split(';')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
            }),
    );

    SectionInputs {
        situation: SituationInputs {
            patient_id: latest.patient_id.clone(),
            current_condition: latest.condition.clone(),
            observed_at: latest.datetime.to_string(),
        },
        background: BackgroundInputs {
            condition_history: distinct_in_order(records.iter().map(|r| r.condition.clone())),
            medications: medications.clone(),
            first_observed_at: earliest.datetime.to_string(),
        },
        assessment: AssessmentInputs {
            condition: latest.condition.clone(),
            vitals: latest_vitals(latest),
        },
        recommendation: RecommendationInputs {
            condition: latest.condition.clone(),
            vitals: latest_vitals(latest),
            active_medications: medications,
        },
    }
}

/// Some models wrap JSON replies in markdown fences or prose. Take the
/// outermost object when a direct parse fails.
fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end > start {
        Some(&reply[start..=end])
    } else {
        None
    }
}

fn parse_sbar(reply: &str) -> Result<SbarDocument, PipelineError> {
    let document: SbarDocument = serde_json::from_str(reply.trim())
        .or_else(|first_err| {
            extract_json_object(reply)
                .ok_or(first_err)
                .and_then(serde_json::from_str)
        })
        .map_err(|e| PipelineError::GenerationFailure(format!("malformed SBAR reply: {e}")))?;

    if !document.is_well_formed() {
        return Err(PipelineError::GenerationFailure(
            "SBAR reply is missing one or more sections".to_string(),
        ));
    }
    Ok(document)
}

/// Summarization stage: fetch the patient's history and synthesize an SBAR
/// note from it. Read-only. Returns the records alongside the document so
/// later stages evaluate against the same data the note was derived from.
pub async fn summarize(
    store: &dyn RecordStore,
    generator: &dyn Generator,
    patient_id: &str,
) -> Result<(Vec<PatientRecord>, SbarDocument), PipelineError> {
    if patient_id.trim().is_empty() {
        return Err(PipelineError::NotFound(patient_id.to_string()));
    }

    let records = match store.fetch_records(patient_id).await {
        Ok(records) if records.is_empty() => {
            return Err(PipelineError::NoData(patient_id.to_string()))
        }
        Ok(records) => records,
        Err(PipelineError::NotFound(_)) => {
            return Err(PipelineError::NoData(patient_id.to_string()))
        }
        Err(other) => return Err(other),
    };

    let inputs = select_inputs(&records);
    let context = serde_json::to_value(&inputs)
        .map_err(|e| PipelineError::GenerationFailure(e.to_string()))?;

    tracing::debug!(patient_id, records = records.len(), "synthesizing SBAR note");
    let reply = generator.generate(SBAR_INSTRUCTIONS, &context).await?;
    let sbar = parse_sbar(&reply)?;

    Ok((records, sbar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::llm::MockGenerator;

    struct FixedStore {
        records: Vec<PatientRecord>,
    }

    #[async_trait]
    impl RecordStore for FixedStore {
        async fn fetch_records(
            &self,
            patient_id: &str,
        ) -> Result<Vec<PatientRecord>, PipelineError> {
            if self.records.is_empty() {
                return Err(PipelineError::NotFound(patient_id.to_string()));
            }
            Ok(self.records.clone())
        }
    }

    fn record(hour: u32, condition: &str, hr: f64, medications: Option<&str>) -> PatientRecord {
        PatientRecord {
            patient_id: "ER101".to_string(),
            datetime: NaiveDate::from_ymd_opt(2025, 3, 4)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            condition: condition.to_string(),
            vitals_bp: Some("90/60".to_string()),
            vitals_hr: Some(hr),
            vitals_rr: Some(22.0),
            vitals_temp: Some(38.4),
            vitals_spo2: Some(94.0),
            medications: medications.map(|m| m.to_string()),
        }
    }

    fn valid_sbar_json() -> &'static str {
        r#"{"situation":"Admitted with sepsis.","background":"History of sepsis, on ceftriaxone.","assessment":"HR 130, febrile.","recommendation":"Continue antibiotics, monitor vitals."}"#
    }

    #[test]
    fn inputs_take_latest_condition_and_vitals() {
        let records = vec![
            record(8, "Pneumonia", 110.0, Some("Ceftriaxone")),
            record(12, "Sepsis", 130.0, Some("Ceftriaxone; Norepinephrine")),
        ];
        let inputs = select_inputs(&records);

        assert_eq!(inputs.situation.current_condition, "Sepsis");
        assert_eq!(
            inputs.background.condition_history,
            vec!["Pneumonia".to_string(), "Sepsis".to_string()]
        );
        assert_eq!(
            inputs.background.medications,
            vec!["Ceftriaxone".to_string(), "Norepinephrine".to_string()]
        );
        let hr = inputs
            .assessment
            .vitals
            .iter()
            .find(|v| v.name == "vitals_HR")
            .unwrap();
        assert_eq!(hr.value, "130");
    }

    #[test]
    fn input_selection_is_deterministic() {
        let records = vec![
            record(8, "Pneumonia", 110.0, Some("Ceftriaxone")),
            record(12, "Sepsis", 130.0, None),
        ];
        let a = serde_json::to_value(select_inputs(&records)).unwrap();
        let b = serde_json::to_value(select_inputs(&records)).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn produces_four_section_document() {
        let store = FixedStore {
            records: vec![record(8, "Sepsis", 130.0, Some("Ceftriaxone"))],
        };
        let generator = MockGenerator::new(valid_sbar_json());

        let (records, sbar) = summarize(&store, &generator, "ER101").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(sbar.is_well_formed());
    }

    #[tokio::test]
    async fn fenced_reply_is_accepted() {
        let store = FixedStore {
            records: vec![record(8, "Sepsis", 130.0, None)],
        };
        let fenced = format!("```json\n{}\n```", valid_sbar_json());
        let generator = MockGenerator::new(&fenced);

        let (_, sbar) = summarize(&store, &generator, "ER101").await.unwrap();
        assert_eq!(sbar.situation, "Admitted with sepsis.");
    }

    #[tokio::test]
    async fn empty_history_is_no_data() {
        let store = FixedStore { records: vec![] };
        let generator = MockGenerator::new(valid_sbar_json());

        let err = summarize(&store, &generator, "ER102").await.unwrap_err();
        assert!(matches!(err, PipelineError::NoData(_)));
    }

    #[tokio::test]
    async fn malformed_reply_is_generation_failure() {
        let store = FixedStore {
            records: vec![record(8, "Sepsis", 130.0, None)],
        };
        let generator = MockGenerator::new("The patient seems fine to me.");

        let err = summarize(&store, &generator, "ER101").await.unwrap_err();
        assert!(matches!(err, PipelineError::GenerationFailure(_)));
    }

    #[tokio::test]
    async fn missing_section_is_generation_failure() {
        let store = FixedStore {
            records: vec![record(8, "Sepsis", 130.0, None)],
        };
        let generator = MockGenerator::new(
            r#"{"situation":"s","background":"b","assessment":"a","recommendation":""}"#,
        );

        let err = summarize(&store, &generator, "ER101").await.unwrap_err();
        assert!(matches!(err, PipelineError::GenerationFailure(_)));
    }
}
