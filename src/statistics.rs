use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::StatisticsConfig;
use crate::models::{
    CohortAggregate, Difficulty, DistributionBucket, StandingResult, StudentId, StudentRecord,
    TermDifficulty, TermTrend,
};

#[derive(Debug, Clone)]
pub enum PopulationScope {
    Whole,
    Program(StudentId),
}

impl PopulationScope {
    pub fn includes(&self, student: &StudentRecord) -> bool {
        match self {
            PopulationScope::Whole => true,
            PopulationScope::Program(id) => id.shares_program(&student.id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    config: StatisticsConfig,
}

impl Aggregator {
    pub fn new(config: StatisticsConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, average: f64) -> Difficulty {
        if average >= self.config.easy_threshold {
            Difficulty::Easy
        } else if average >= self.config.moderate_threshold {
            Difficulty::Moderate
        } else {
            Difficulty::Hard
        }
    }

    pub fn aggregate(
        &self,
        population: &[StudentRecord],
        scope: &PopulationScope,
        focus_id: Option<&str>,
    ) -> CohortAggregate {
        let scoped: Vec<&StudentRecord> = population
            .iter()
            .filter(|student| scope.includes(student))
            .collect();

        let ranked = ranked_by_final(&scoped);
        let final_cumulatives: Vec<f64> = ranked.iter().map(|(_, cumulative)| *cumulative).collect();
        let final_periods: Vec<f64> = ranked
            .iter()
            .filter_map(|(student, _)| student.final_result())
            .map(|result| result.period_average)
            .filter(|period| is_observation(*period))
            .collect();

        CohortAggregate {
            population_size: scoped.len(),
            distribution: self.distribution(&scoped),
            difficulty_by_term: self.difficulty_by_term(&scoped),
            term_trends: term_trends(&scoped),
            class_average_final_cumulative: mean(&final_cumulatives),
            class_average_final_period: mean(&final_periods),
            highest_final: final_cumulatives.first().copied().unwrap_or(0.0),
            standing: focus_id.and_then(|id| standing_of(&ranked, id)),
        }
    }

    pub fn distribution(&self, students: &[&StudentRecord]) -> Vec<DistributionBucket> {
        let width = self.config.bucket_width;
        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();

        for result in students.iter().flat_map(|s| s.term_results()) {
            if is_observation(result.period_average) {
                let index = (result.period_average / width).floor() as i64;
                *counts.entry(index).or_insert(0) += 1;
            }
        }

        counts
            .into_iter()
            .map(|(index, count)| {
                let lower = index as f64 * width;
                DistributionBucket {
                    label: format!("{:.1}-{:.1}", lower, lower + width),
                    lower,
                    count,
                }
            })
            .collect()
    }

    pub fn difficulty_by_term(&self, students: &[&StudentRecord]) -> Vec<TermDifficulty> {
        per_term_values(students, |result| result.period_average)
            .into_iter()
            .map(|(term, values)| {
                let average = mean(&values);
                TermDifficulty {
                    term,
                    avg_period_average: average,
                    difficulty: self.classify(average),
                }
            })
            .collect()
    }
}

fn is_observation(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn per_term_values(
    students: &[&StudentRecord],
    field: impl Fn(&crate::models::TermResult) -> f64,
) -> BTreeMap<u32, Vec<f64>> {
    let mut by_term: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for result in students.iter().flat_map(|s| s.term_results()) {
        let value = field(result);
        if is_observation(value) {
            by_term.entry(result.term).or_default().push(value);
        }
    }
    by_term
}

fn term_trends(students: &[&StudentRecord]) -> Vec<TermTrend> {
    let periods = per_term_values(students, |result| result.period_average);
    let cumulatives = per_term_values(students, |result| result.cumulative_average);

    let mut terms: Vec<u32> = periods.keys().chain(cumulatives.keys()).copied().collect();
    terms.sort_unstable();
    terms.dedup();

    terms
        .into_iter()
        .map(|term| TermTrend {
            term,
            avg_period_average: periods.get(&term).map_or(0.0, |v| mean(v)),
            avg_cumulative_average: cumulatives.get(&term).map_or(0.0, |v| mean(v)),
        })
        .collect()
}

fn ranked_by_final<'a>(students: &[&'a StudentRecord]) -> Vec<(&'a StudentRecord, f64)> {
    let mut ranked: Vec<(&StudentRecord, f64)> = students
        .iter()
        .filter_map(|student| {
            student
                .final_result()
                .map(|result| (*student, result.cumulative_average))
        })
        .filter(|(_, cumulative)| is_observation(*cumulative))
        .collect();

    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    ranked
}

/// Percentile is the share of the ranked students the focus student outperforms or ties.
/// A student outside the ranked set has no standing.
fn standing_of(ranked: &[(&StudentRecord, f64)], focus_id: &str) -> Option<StandingResult> {
    let cohort_size = ranked.len();
    let rank = ranked
        .iter()
        .position(|(student, _)| student.id == focus_id)?
        + 1;
    let percentile = (cohort_size - rank + 1) as f64 / cohort_size as f64 * 100.0;

    Some(StandingResult {
        rank,
        cohort_size,
        percentile: (percentile * 100.0).round() / 100.0,
    })
}
