use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{RecordParseError, StoreError};
use crate::models::{CohortId, StudentId, StudentRecord, TermResult};

pub const MAX_TERM: u32 = 24;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_cohorts(&self) -> Result<Vec<CohortId>, StoreError>;
    async fn cohort_exists(&self, cohort: CohortId) -> Result<bool, StoreError>;
    async fn fetch_all(&self, cohort: CohortId) -> Result<Vec<StudentRecord>, StoreError>;
    async fn fetch_one(
        &self,
        cohort: CohortId,
        student_id: &str,
    ) -> Result<Option<StudentRecord>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawTermRow {
    pub student_id: String,
    pub term: Option<i64>,
    pub period_average: Option<f64>,
    pub cumulative_average: Option<f64>,
}

/// Zero averages are accepted as "no data"; negative or non-finite values are not.
pub fn parse_records(
    rows: impl IntoIterator<Item = RawTermRow>,
) -> Result<Vec<StudentRecord>, RecordParseError> {
    parse_roster(std::iter::empty(), rows)
}

pub fn parse_roster(
    roster: impl IntoIterator<Item = String>,
    rows: impl IntoIterator<Item = RawTermRow>,
) -> Result<Vec<StudentRecord>, RecordParseError> {
    let mut grouped: BTreeMap<String, Vec<TermResult>> =
        roster.into_iter().map(|id| (id, Vec::new())).collect();

    for row in rows {
        let result = parse_row(&row)?;
        grouped.entry(row.student_id).or_default().push(result);
    }

    Ok(grouped
        .into_iter()
        .map(|(id, results)| StudentRecord::new(id, results))
        .collect())
}

pub(crate) fn parse_row(row: &RawTermRow) -> Result<TermResult, RecordParseError> {
    let missing = |field: &'static str| RecordParseError::MissingField {
        student_id: row.student_id.clone(),
        field,
    };

    let raw_term = row.term.ok_or_else(|| missing("term"))?;
    let term = u32::try_from(raw_term)
        .ok()
        .filter(|term| (1..=MAX_TERM).contains(term))
        .ok_or_else(|| RecordParseError::InvalidTerm {
            student_id: row.student_id.clone(),
            term: raw_term,
        })?;

    let check = |field: &'static str, value: Option<f64>| -> Result<f64, RecordParseError> {
        let value = value.ok_or_else(|| missing(field))?;
        if !value.is_finite() || value < 0.0 {
            return Err(RecordParseError::InvalidAverage {
                student_id: row.student_id.clone(),
                term,
                field,
                value,
            });
        }
        Ok(value)
    };

    Ok(TermResult {
        term,
        period_average: check("period_average", row.period_average)?,
        cumulative_average: check("cumulative_average", row.cumulative_average)?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    cohorts: BTreeMap<CohortId, Vec<StudentRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_cohort(&mut self, cohort: CohortId, students: Vec<StudentRecord>) {
        self.cohorts.insert(cohort, students);
    }

    pub fn with_cohort(mut self, cohort: CohortId, students: Vec<StudentRecord>) -> Self {
        self.insert_cohort(cohort, students);
        self
    }

    pub fn from_rows(rows: impl IntoIterator<Item = RawTermRow>) -> Result<Self, RecordParseError> {
        let mut by_cohort: BTreeMap<CohortId, Vec<RawTermRow>> = BTreeMap::new();
        for row in rows {
            let id: StudentId = row.student_id.parse()?;
            by_cohort.entry(id.cohort()).or_default().push(row);
        }

        let mut store = Self::new();
        for (cohort, rows) in by_cohort {
            store.insert_cohort(cohort, parse_records(rows)?);
        }
        Ok(store)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn list_cohorts(&self) -> Result<Vec<CohortId>, StoreError> {
        Ok(self.cohorts.keys().copied().collect())
    }

    async fn cohort_exists(&self, cohort: CohortId) -> Result<bool, StoreError> {
        Ok(self.cohorts.contains_key(&cohort))
    }

    async fn fetch_all(&self, cohort: CohortId) -> Result<Vec<StudentRecord>, StoreError> {
        Ok(self.cohorts.get(&cohort).cloned().unwrap_or_default())
    }

    async fn fetch_one(
        &self,
        cohort: CohortId,
        student_id: &str,
    ) -> Result<Option<StudentRecord>, StoreError> {
        Ok(self
            .cohorts
            .get(&cohort)
            .and_then(|students| students.iter().find(|s| s.id == student_id))
            .cloned())
    }
}
