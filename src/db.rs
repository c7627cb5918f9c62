use anyhow::{ensure, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CohortId, StudentId, StudentRecord, TermResult};
use crate::store::{parse_roster, parse_row, InMemoryStore, RawTermRow, RecordStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub import_id: Uuid,
    pub imported_at: DateTime<Utc>,
    pub students: usize,
    pub rows: usize,
}

const SEED_PROGRAMS: [&str; 3] = ["pi", "cs", "ec"];
const SEED_COHORTS: [(u16, u32); 4] = [(2021, 7), (2022, 5), (2023, 3), (2024, 1)];
const SEED_STUDENTS_PER_PROGRAM: u32 = 4;

pub fn seed_records() -> Vec<(StudentId, Vec<TermResult>)> {
    let round2 = |value: f64| (value * 100.0).round() / 100.0;
    let mut records = Vec::new();

    for (year, completed_terms) in SEED_COHORTS {
        for (program_index, program) in SEED_PROGRAMS.iter().enumerate() {
            for seq in 1..=SEED_STUDENTS_PER_PROGRAM {
                let raw = format!("{year}ug{program}{seq:03}");
                let Ok(id) = raw.parse::<StudentId>() else {
                    continue;
                };

                let mut total = 0.0;
                let results = (1..=completed_terms)
                    .map(|term| {
                        let spread = (seq * 7 + program_index as u32 * 3 + term * 5) % 35;
                        let period = round2(6.0 + f64::from(spread) / 10.0);
                        total += period;
                        TermResult {
                            term,
                            period_average: period,
                            cumulative_average: round2(total / f64::from(term)),
                        }
                    })
                    .collect();
                records.push((id, results));
            }
        }
    }

    records
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<ImportSummary> {
    let records = seed_records();
    let rows: Vec<(StudentId, TermResult)> = records
        .iter()
        .flat_map(|(id, results)| results.iter().map(move |result| (id.clone(), *result)))
        .collect();

    let summary = store_batch(pool, &rows).await?;
    info!(import_id = %summary.import_id, students = summary.students, rows = summary.rows, "seed data loaded");
    Ok(summary)
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CsvTermRow {
    pub student_id: String,
    pub term: i32,
    pub period_average: Option<f64>,
    pub cumulative_average: Option<f64>,
}

impl From<CsvTermRow> for RawTermRow {
    fn from(row: CsvTermRow) -> Self {
        RawTermRow {
            student_id: row.student_id,
            term: Some(i64::from(row.term)),
            period_average: row.period_average,
            cumulative_average: row.cumulative_average,
        }
    }
}

pub fn read_csv(csv_path: &std::path::Path) -> anyhow::Result<Vec<CsvTermRow>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;

    reader
        .deserialize::<CsvTermRow>()
        .enumerate()
        .map(|(index, result)| result.with_context(|| format!("line {}: unreadable row", index + 2)))
        .collect()
}

pub fn load_offline(csv_path: &std::path::Path) -> anyhow::Result<InMemoryStore> {
    let rows = read_csv(csv_path)?;
    let store = InMemoryStore::from_rows(rows.into_iter().map(RawTermRow::from))
        .with_context(|| format!("invalid records in {}", csv_path.display()))?;
    Ok(store)
}

pub fn validate_rows(rows: Vec<CsvTermRow>) -> anyhow::Result<Vec<(StudentId, TermResult)>> {
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| -> anyhow::Result<(StudentId, TermResult)> {
            let line = index + 2;
            let id: StudentId = row
                .student_id
                .parse()
                .with_context(|| format!("line {line}: bad student id"))?;
            let result = parse_row(&RawTermRow::from(row)).with_context(|| format!("line {line}"))?;
            Ok((id, result))
        })
        .collect()
}

/// Loads a CSV export into Postgres. Later rows replace earlier ones for the
/// same student and term; a bad row aborts the whole batch.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<ImportSummary> {
    let rows = validate_rows(read_csv(csv_path)?)
        .with_context(|| format!("invalid records in {}", csv_path.display()))?;
    ensure!(!rows.is_empty(), "{} has no term rows", csv_path.display());

    let summary = store_batch(pool, &rows).await?;
    info!(import_id = %summary.import_id, students = summary.students, rows = summary.rows, "csv import complete");
    Ok(summary)
}

async fn store_batch(pool: &PgPool, rows: &[(StudentId, TermResult)]) -> anyhow::Result<ImportSummary> {
    let import_id = Uuid::new_v4();
    let mut students = std::collections::BTreeSet::new();
    let mut affected = 0usize;

    let mut tx = pool.begin().await?;
    for (id, result) in rows {
        if students.insert(id.as_str()) {
            ensure_student(&mut *tx, id).await?;
        }
        affected += upsert_result(&mut *tx, import_id, id, result).await? as usize;
    }
    tx.commit().await?;

    Ok(ImportSummary {
        import_id,
        imported_at: Utc::now(),
        students: students.len(),
        rows: affected,
    })
}

async fn ensure_student(conn: &mut PgConnection, id: &StudentId) -> Result<(), sqlx::Error> {
    let cohort = id.cohort().to_string();

    sqlx::query("INSERT INTO cohort_forecast.cohorts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(&cohort)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO cohort_forecast.students (id, cohort)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE SET cohort = EXCLUDED.cohort
        "#,
    )
    .bind(id.as_str())
    .bind(&cohort)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn upsert_result(
    conn: &mut PgConnection,
    import_id: Uuid,
    id: &StudentId,
    result: &TermResult,
) -> Result<u64, sqlx::Error> {
    let outcome = sqlx::query(
        r#"
        INSERT INTO cohort_forecast.term_results
        (student_id, term, period_average, cumulative_average, import_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (student_id, term) DO UPDATE
        SET period_average = EXCLUDED.period_average,
            cumulative_average = EXCLUDED.cumulative_average,
            import_id = EXCLUDED.import_id,
            imported_at = now()
        "#,
    )
    .bind(id.as_str())
    .bind(result.term as i32)
    .bind(result.period_average)
    .bind(result.cumulative_average)
    .bind(import_id)
    .execute(&mut *conn)
    .await?;

    Ok(outcome.rows_affected())
}

fn raw_row(row: &PgRow) -> Result<RawTermRow, sqlx::Error> {
    Ok(RawTermRow {
        student_id: row.try_get("student_id")?,
        term: row.try_get::<Option<i32>, _>("term")?.map(i64::from),
        period_average: row.try_get("period_average")?,
        cumulative_average: row.try_get("cumulative_average")?,
    })
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn term_rows(
        &self,
        cohort: CohortId,
        student_id: Option<&str>,
    ) -> Result<Vec<RawTermRow>, sqlx::Error> {
        let mut query = String::from(
            "SELECT r.student_id, r.term, r.period_average, r.cumulative_average \
             FROM cohort_forecast.term_results r \
             JOIN cohort_forecast.students s ON s.id = r.student_id \
             WHERE s.cohort = $1",
        );
        if student_id.is_some() {
            query.push_str(" AND s.id = $2");
        }
        query.push_str(" ORDER BY r.student_id, r.term");

        let mut rows = sqlx::query(&query).bind(cohort.to_string());
        if let Some(value) = student_id {
            rows = rows.bind(value);
        }

        rows.fetch_all(&self.pool).await?.iter().map(raw_row).collect()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn list_cohorts(&self) -> Result<Vec<CohortId>, StoreError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM cohort_forecast.cohorts ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        ids.iter()
            .map(|id| id.parse::<CohortId>().map_err(StoreError::from))
            .collect()
    }

    async fn cohort_exists(&self, cohort: CohortId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM cohort_forecast.cohorts WHERE id = $1)",
        )
        .bind(cohort.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn fetch_all(&self, cohort: CohortId) -> Result<Vec<StudentRecord>, StoreError> {
        let roster: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM cohort_forecast.students WHERE cohort = $1 ORDER BY id",
        )
        .bind(cohort.to_string())
        .fetch_all(&self.pool)
        .await?;
        let rows = self.term_rows(cohort, None).await?;
        debug!(%cohort, students = roster.len(), rows = rows.len(), "fetched cohort");

        Ok(parse_roster(roster, rows)?)
    }

    async fn fetch_one(
        &self,
        cohort: CohortId,
        student_id: &str,
    ) -> Result<Option<StudentRecord>, StoreError> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT id FROM cohort_forecast.students WHERE cohort = $1 AND id = $2",
        )
        .bind(cohort.to_string())
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(id) = found else {
            return Ok(None);
        };
        let rows = self.term_rows(cohort, Some(&id)).await?;
        Ok(parse_roster([id], rows)?.into_iter().next())
    }
}
