use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{Row, SqlitePool};

use crate::error::PipelineError;
use crate::models::{Operator, PatientRecord, Priority, Rule};

/// Queryable source of patient observation records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch all records for one patient, ordered by datetime ascending.
    /// Fails with `NotFound` when the patient has zero records.
    async fn fetch_records(&self, patient_id: &str) -> Result<Vec<PatientRecord>, PipelineError>;
}

/// Queryable source of escalation rules.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch the full rule set. Fails with `Unavailable` when the store
    /// cannot be reached. The pipeline never uses a rule this did not return.
    async fn fetch_all_rules(&self) -> Result<Vec<Rule>, PipelineError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Store reads are pure, so one retry after a short pause is safe.
async fn with_retry<T, F, Fut>(op: F) -> Result<T, PipelineError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, PipelineError>>,
{
    match op().await {
        Err(PipelineError::Unavailable(first)) => {
            tracing::warn!(error = %first, "store read failed, retrying once");
            tokio::time::sleep(Duration::from_millis(200)).await;
            op().await
        }
        other => other,
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn fetch_records(&self, patient_id: &str) -> Result<Vec<PatientRecord>, PipelineError> {
        let rows = with_retry(|| async {
            sqlx::query(
                "SELECT patient_id, datetime, condition, vitals_BP, vitals_HR, \
                 vitals_RR, vitals_Temp, vitals_SpO2, medications \
                 FROM medical_records WHERE patient_id = ? ORDER BY datetime",
            )
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Unavailable(e.to_string()))
        })
        .await?;

        if rows.is_empty() {
            return Err(PipelineError::NotFound(patient_id.to_string()));
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(PatientRecord {
                patient_id: row.get("patient_id"),
                datetime: row.get::<NaiveDateTime, _>("datetime"),
                condition: row.get("condition"),
                vitals_bp: row.get("vitals_BP"),
                vitals_hr: row.get("vitals_HR"),
                vitals_rr: row.get("vitals_RR"),
                vitals_temp: row.get("vitals_Temp"),
                vitals_spo2: row.get("vitals_SpO2"),
                medications: row.get("medications"),
            });
        }

        Ok(records)
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn fetch_all_rules(&self) -> Result<Vec<Rule>, PipelineError> {
        let rows = with_retry(|| async {
            sqlx::query(
                "SELECT rule_id, category, priority, signal, operator, value, \
                 unit, time_window_h, action, message, dedupe_key \
                 FROM clinical_rules",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Unavailable(e.to_string()))
        })
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule_id: String = row.get("rule_id");
            let priority_text: String = row.get("priority");
            let operator_text: String = row.get("operator");

            let (Some(priority), Some(operator)) = (
                Priority::parse(&priority_text),
                Operator::parse(&operator_text),
            ) else {
                tracing::warn!(%rule_id, "skipping rule with unparseable priority or operator");
                continue;
            };

            rules.push(Rule {
                rule_id,
                category: row.get("category"),
                priority,
                signal: row.get("signal"),
                operator,
                value: row.get("value"),
                unit: row.get("unit"),
                time_window_h: row.get::<Option<f64>, _>("time_window_h").unwrap_or(0.0),
                action: row.get("action"),
                message: row.get("message"),
                dedupe_key: row.get("dedupe_key"),
            });
        }

        Ok(rules)
    }
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS medical_records (
            patient_id TEXT NOT NULL,
            datetime DATETIME NOT NULL,
            condition TEXT NOT NULL,
            vitals_BP TEXT,
            vitals_HR REAL,
            vitals_RR REAL,
            vitals_Temp REAL,
            vitals_SpO2 REAL,
            medications TEXT,
            UNIQUE (patient_id, datetime)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clinical_rules (
            rule_id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            priority TEXT NOT NULL,
            signal TEXT NOT NULL,
            operator TEXT NOT NULL,
            value TEXT NOT NULL,
            unit TEXT,
            time_window_h REAL NOT NULL DEFAULT 0,
            action TEXT NOT NULL,
            message TEXT NOT NULL,
            dedupe_key TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_patient_id ON medical_records(patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_datetime ON medical_records(datetime)",
        "CREATE INDEX IF NOT EXISTS idx_condition ON medical_records(condition)",
        "CREATE INDEX IF NOT EXISTS idx_rule_id ON clinical_rules(rule_id)",
        "CREATE INDEX IF NOT EXISTS idx_category ON clinical_rules(category)",
        "CREATE INDEX IF NOT EXISTS idx_priority ON clinical_rules(priority)",
        "CREATE INDEX IF NOT EXISTS idx_signal ON clinical_rules(signal)",
        "CREATE INDEX IF NOT EXISTS idx_dedupe_key ON clinical_rules(dedupe_key)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

pub async fn seed(pool: &SqlitePool) -> anyhow::Result<()> {
    let records = vec![
        (
            "ER101",
            "2025-03-04 08:00:00",
            "Sepsis",
            Some("92/60"),
            Some(118.0),
            Some(22.0),
            Some(38.4),
            Some(94.0),
            Some("Ceftriaxone"),
        ),
        (
            "ER101",
            "2025-03-04 12:00:00",
            "Sepsis",
            Some("90/58"),
            Some(130.0),
            Some(24.0),
            Some(38.9),
            Some(93.0),
            Some("Ceftriaxone; Norepinephrine"),
        ),
        (
            "ER103",
            "2025-03-04 09:15:00",
            "Asthma exacerbation",
            Some("124/80"),
            Some(96.0),
            Some(20.0),
            Some(37.1),
            Some(95.0),
            Some("Albuterol"),
        ),
    ];

    for (patient_id, datetime, condition, bp, hr, rr, temp, spo2, medications) in records {
        let datetime = parse_record_datetime(datetime)?;
        sqlx::query(
            r#"
            INSERT INTO medical_records
            (patient_id, datetime, condition, vitals_BP, vitals_HR, vitals_RR,
             vitals_Temp, vitals_SpO2, medications)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (patient_id, datetime) DO NOTHING
            "#,
        )
        .bind(patient_id)
        .bind(datetime)
        .bind(condition)
        .bind(bp)
        .bind(hr)
        .bind(rr)
        .bind(temp)
        .bind(spo2)
        .bind(medications)
        .execute(pool)
        .await?;
    }

    let rules = vec![
        (
            "HR_HIGH",
            "vitals",
            "High",
            "vitals_HR",
            ">",
            "120",
            Some("bpm"),
            0.0,
            "Notify physician and start continuous cardiac monitoring",
            "Heart rate above 120 bpm",
            "tachycardia",
        ),
        (
            "HR_ELEVATED",
            "vitals",
            "Medium",
            "vitals_HR",
            ">",
            "100",
            Some("bpm"),
            0.0,
            "Recheck heart rate within 30 minutes",
            "Heart rate above 100 bpm",
            "tachycardia",
        ),
        (
            "SPO2_LOW",
            "vitals",
            "Critical",
            "vitals_SpO2",
            "<",
            "90",
            Some("%"),
            4.0,
            "Administer oxygen and escalate to rapid response",
            "Oxygen saturation below 90% in the last 4 hours",
            "hypoxia",
        ),
        (
            "TEMP_FEVER",
            "vitals",
            "Medium",
            "vitals_Temp",
            ">=",
            "38.5",
            Some("C"),
            0.0,
            "Draw blood cultures and give antipyretics",
            "Temperature at or above 38.5 C",
            "fever",
        ),
    ];

    for (rule_id, category, priority, signal, operator, value, unit, window, action, message, dedupe_key) in
        rules
    {
        sqlx::query(
            r#"
            INSERT INTO clinical_rules
            (rule_id, category, priority, signal, operator, value, unit,
             time_window_h, action, message, dedupe_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (rule_id) DO UPDATE SET
                category = excluded.category,
                priority = excluded.priority,
                signal = excluded.signal,
                operator = excluded.operator,
                value = excluded.value,
                unit = excluded.unit,
                time_window_h = excluded.time_window_h,
                action = excluded.action,
                message = excluded.message,
                dedupe_key = excluded.dedupe_key
            "#,
        )
        .bind(rule_id)
        .bind(category)
        .bind(priority)
        .bind(signal)
        .bind(operator)
        .bind(value)
        .bind(unit)
        .bind(window)
        .bind(action)
        .bind(message)
        .bind(dedupe_key)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn import_records(pool: &SqlitePool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        patient_id: String,
        datetime: String,
        condition: String,
        #[serde(rename = "vitals_BP")]
        vitals_bp: Option<String>,
        #[serde(rename = "vitals_HR")]
        vitals_hr: Option<f64>,
        #[serde(rename = "vitals_RR")]
        vitals_rr: Option<f64>,
        #[serde(rename = "vitals_Temp")]
        vitals_temp: Option<f64>,
        #[serde(rename = "vitals_SpO2")]
        vitals_spo2: Option<f64>,
        medications: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let datetime = parse_record_datetime(&row.datetime)
            .with_context(|| format!("bad datetime for patient {}", row.patient_id))?;

        let result = sqlx::query(
            r#"
            INSERT INTO medical_records
            (patient_id, datetime, condition, vitals_BP, vitals_HR, vitals_RR,
             vitals_Temp, vitals_SpO2, medications)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (patient_id, datetime) DO NOTHING
            "#,
        )
        .bind(&row.patient_id)
        .bind(datetime)
        .bind(&row.condition)
        .bind(&row.vitals_bp)
        .bind(row.vitals_hr)
        .bind(row.vitals_rr)
        .bind(row.vitals_temp)
        .bind(row.vitals_spo2)
        .bind(&row.medications)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn import_rules(pool: &SqlitePool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        rule_id: String,
        category: String,
        priority: String,
        signal: String,
        operator: String,
        value: String,
        unit: Option<String>,
        time_window_h: Option<f64>,
        action: String,
        message: String,
        dedupe_key: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        Priority::parse(&row.priority)
            .with_context(|| format!("rule {}: unknown priority '{}'", row.rule_id, row.priority))?;
        Operator::parse(&row.operator)
            .with_context(|| format!("rule {}: unknown operator '{}'", row.rule_id, row.operator))?;
        let window = row.time_window_h.unwrap_or(0.0);
        anyhow::ensure!(
            window >= 0.0,
            "rule {}: negative time_window_h",
            row.rule_id
        );

        let result = sqlx::query(
            r#"
            INSERT INTO clinical_rules
            (rule_id, category, priority, signal, operator, value, unit,
             time_window_h, action, message, dedupe_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (rule_id) DO UPDATE SET
                category = excluded.category,
                priority = excluded.priority,
                signal = excluded.signal,
                operator = excluded.operator,
                value = excluded.value,
                unit = excluded.unit,
                time_window_h = excluded.time_window_h,
                action = excluded.action,
                message = excluded.message,
                dedupe_key = excluded.dedupe_key
            "#,
        )
        .bind(&row.rule_id)
        .bind(&row.category)
        .bind(&row.priority)
        .bind(&row.signal)
        .bind(&row.operator)
        .bind(&row.value)
        .bind(&row.unit)
        .bind(window)
        .bind(&row.action)
        .bind(&row.message)
        .bind(&row.dedupe_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn parse_record_datetime(text: &str) -> anyhow::Result<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text.trim(), format) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d") {
        if let Some(parsed) = date.and_hms_opt(0, 0, 0) {
            return Ok(parsed);
        }
    }
    anyhow::bail!("unrecognized datetime '{text}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> (SqlitePool, SqliteStore) {
        // One connection: each new in-memory connection is a separate database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool).await.unwrap();
        (pool.clone(), SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn init_db_is_idempotent() {
        let (pool, _) = memory_store().await;
        init_db(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_records_orders_by_datetime() {
        let (pool, store) = memory_store().await;
        seed(&pool).await.unwrap();

        let records = store.fetch_records("ER101").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].datetime < records[1].datetime);
        assert_eq!(records[1].vitals_hr, Some(130.0));
    }

    #[tokio::test]
    async fn fetch_records_unknown_patient_is_not_found() {
        let (pool, store) = memory_store().await;
        seed(&pool).await.unwrap();

        let err = store.fetch_records("ER999").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn fetch_all_rules_returns_seeded_set() {
        let (pool, store) = memory_store().await;
        seed(&pool).await.unwrap();

        let rules = store.fetch_all_rules().await.unwrap();
        assert_eq!(rules.len(), 4);
        let hr_high = rules.iter().find(|r| r.rule_id == "HR_HIGH").unwrap();
        assert_eq!(hr_high.priority, Priority::High);
        assert_eq!(hr_high.operator, Operator::Gt);
        assert_eq!(hr_high.dedupe_key, "tachycardia");
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let (pool, store) = memory_store().await;
        seed(&pool).await.unwrap();
        seed(&pool).await.unwrap();

        assert_eq!(store.fetch_records("ER101").await.unwrap().len(), 2);
        assert_eq!(store.fetch_all_rules().await.unwrap().len(), 4);
    }

    #[test]
    fn record_datetime_accepts_common_formats() {
        assert!(parse_record_datetime("2025-03-04 08:00:00").is_ok());
        assert!(parse_record_datetime("2025-03-04T08:00:00").is_ok());
        assert!(parse_record_datetime("2025-03-04").is_ok());
        assert!(parse_record_datetime("last tuesday").is_err());
    }
}
