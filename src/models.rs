use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::RecordParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CohortId(u16);

impl CohortId {
    pub fn new(year: u16) -> Self {
        Self(year)
    }

    pub fn previous(self) -> Option<CohortId> {
        self.0.checked_sub(1).map(CohortId)
    }
}

impl fmt::Display for CohortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for CohortId {
    type Err = RecordParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() != 4 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecordParseError::MalformedCohortId {
                id: value.to_string(),
            });
        }
        trimmed
            .parse::<u16>()
            .map(CohortId)
            .map_err(|_| RecordParseError::MalformedCohortId {
                id: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentId {
    raw: String,
    cohort: CohortId,
    degree: String,
    program: String,
}

impl StudentId {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn cohort(&self) -> CohortId {
        self.cohort
    }

    pub fn program_prefix(&self) -> String {
        format!("{}{}{}", self.cohort, self.degree, self.program)
    }

    pub fn shares_program(&self, other: &str) -> bool {
        let prefix = self.program_prefix();
        other
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(&prefix))
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for StudentId {
    type Err = RecordParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim();
        let malformed = || RecordParseError::MalformedStudentId {
            id: value.to_string(),
        };

        if !raw.is_ascii() || raw.len() < 9 {
            return Err(malformed());
        }

        let (year, rest) = raw.split_at(4);
        let (degree, rest) = rest.split_at(2);
        let (program, sequence) = rest.split_at(2);

        let letters = |s: &str| s.bytes().all(|b| b.is_ascii_alphabetic());
        if !letters(degree) || !letters(program) || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        let cohort = year.parse::<CohortId>().map_err(|_| malformed())?;

        Ok(Self {
            raw: raw.to_string(),
            cohort,
            degree: degree.to_ascii_lowercase(),
            program: program.to_ascii_lowercase(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermResult {
    pub term: u32,
    pub period_average: f64,
    pub cumulative_average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    term_results: Vec<TermResult>,
}

impl StudentRecord {
    /// Builds a record keyed by term; when a term repeats, the last occurrence wins.
    pub fn new(id: impl Into<String>, results: impl IntoIterator<Item = TermResult>) -> Self {
        let by_term: BTreeMap<u32, TermResult> = results
            .into_iter()
            .map(|result| (result.term, result))
            .collect();

        Self {
            id: id.into(),
            term_results: by_term.into_values().collect(),
        }
    }

    pub fn term_results(&self) -> &[TermResult] {
        &self.term_results
    }

    pub fn result_at(&self, term: u32) -> Option<&TermResult> {
        self.term_results
            .binary_search_by_key(&term, |result| result.term)
            .ok()
            .map(|index| &self.term_results[index])
    }

    pub fn final_result(&self) -> Option<&TermResult> {
        self.term_results.last()
    }

    pub fn completed_terms(&self) -> Vec<u32> {
        self.term_results.iter().map(|result| result.term).collect()
    }

    pub fn has_results(&self) -> bool {
        !self.term_results.is_empty()
    }
}

pub type AcademicProfile = BTreeMap<u32, f64>;

#[derive(Debug, Clone, Copy)]
pub struct SimilarityScore<'a> {
    pub student: &'a StudentRecord,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResult {
    pub final_term: u32,
    pub predicted_cumulative_average: f64,
    pub confidence: f64,
    pub per_term_projections: BTreeMap<u32, f64>,
    pub cumulative_path: BTreeMap<u32, f64>,
    pub best_case: f64,
    pub worst_case: f64,
    pub max_attainable_term_average: Option<f64>,
    pub max_observed_term: u32,
    pub target_reached: bool,
    pub verdict: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outlook {
    #[serde(rename_all = "camelCase")]
    TargetAlreadyMet { current_cumulative_average: f64 },
    Projected(ProjectionResult),
}

impl Outlook {
    pub fn confidence(&self) -> f64 {
        match self {
            Outlook::TargetAlreadyMet { .. } => 1.0,
            Outlook::Projected(projection) => projection.confidence,
        }
    }

    pub fn predicted_cumulative_average(&self) -> f64 {
        match self {
            Outlook::TargetAlreadyMet {
                current_cumulative_average,
            } => *current_cumulative_average,
            Outlook::Projected(projection) => projection.predicted_cumulative_average,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandingResult {
    pub rank: usize,
    pub cohort_size: usize,
    pub percentile: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Difficulty {
    Easy,
    Moderate,
    Hard,
}

impl Difficulty {
    pub fn label(self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Moderate => "Moderate",
            Difficulty::Hard => "Hard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBucket {
    pub label: String,
    pub lower: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermDifficulty {
    pub term: u32,
    pub avg_period_average: f64,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermTrend {
    pub term: u32,
    pub avg_period_average: f64,
    pub avg_cumulative_average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortAggregate {
    pub population_size: usize,
    pub distribution: Vec<DistributionBucket>,
    pub difficulty_by_term: Vec<TermDifficulty>,
    pub term_trends: Vec<TermTrend>,
    pub class_average_final_cumulative: f64,
    pub class_average_final_period: f64,
    pub highest_final: f64,
    pub standing: Option<StandingResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramAggregate {
    pub program_prefix: String,
    pub aggregate: CohortAggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub cohort: CohortId,
    pub cohort_wide: CohortAggregate,
    pub program: Option<ProgramAggregate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub student_id: String,
    pub cohort: CohortId,
    pub current_term: u32,
    pub current_cumulative_average: f64,
    pub target_cumulative_average: f64,
    pub history: Vec<TermResult>,
    pub comparison_pool_size: usize,
    pub similar_pool_size: usize,
    pub outlook: Outlook,
    pub program_standing: Option<StandingResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(term: u32, period: f64, cumulative: f64) -> TermResult {
        TermResult {
            term,
            period_average: period,
            cumulative_average: cumulative,
        }
    }

    #[test]
    fn student_id_splits_into_parts() {
        let id: StudentId = "2022UGPI012".parse().unwrap();
        assert_eq!(id.cohort(), CohortId::new(2022));
        assert_eq!(id.program_prefix(), "2022ugpi");
        assert!(id.shares_program("2022ugpi100"));
        assert!(!id.shares_program("2022ugcs100"));
        assert!(!id.shares_program("2021ugpi012"));
    }

    #[test]
    fn rejects_malformed_student_ids() {
        for raw in ["", "2022", "2022ugpi", "20x2ugpi012", "2022u1pi012", "2022ugpi01a", "2022ügpi012"] {
            assert!(raw.parse::<StudentId>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn cohort_id_round_trips_display() {
        let cohort: CohortId = "2023".parse().unwrap();
        assert_eq!(cohort.to_string(), "2023");
        assert_eq!(cohort.previous(), Some(CohortId::new(2022)));
        assert!("23".parse::<CohortId>().is_err());
    }

    #[test]
    fn record_sorts_and_keeps_last_duplicate() {
        let record = StudentRecord::new(
            "2022ugpi001",
            vec![result(2, 7.0, 7.2), result(1, 7.4, 7.4), result(2, 8.0, 7.7)],
        );

        assert_eq!(record.completed_terms(), vec![1, 2]);
        assert_eq!(record.result_at(2).map(|r| r.period_average), Some(8.0));
        assert_eq!(record.final_result().map(|r| r.cumulative_average), Some(7.7));
        assert!(record.result_at(3).is_none());
    }
}
