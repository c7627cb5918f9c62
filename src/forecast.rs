use std::collections::BTreeMap;

use tracing::debug;

use crate::config::ForecastConfig;
use crate::models::{ProjectionResult, SimilarityScore, StudentRecord};

#[derive(Debug, Clone, Copy)]
pub struct ForecastInput<'a> {
    pub current_cumulative_average: f64,
    pub target_cumulative_average: f64,
    pub current_term: u32,
    pub max_observed_term: u32,
    pub completed_terms: &'a [u32],
}

#[derive(Debug, Clone, Default)]
pub struct Forecaster {
    config: ForecastConfig,
}

impl Forecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    pub fn weigh<'a>(
        &self,
        pool: &[&'a StudentRecord],
        current_term: u32,
        current_cumulative_average: f64,
    ) -> Vec<SimilarityScore<'a>> {
        pool.iter()
            .filter_map(|&student| {
                let (total, count) = student
                    .term_results()
                    .iter()
                    .take_while(|result| result.term <= current_term)
                    .fold((0.0, 0u32), |(total, count), result| {
                        let gap = (result.cumulative_average - current_cumulative_average).abs();
                        let closeness = 1.0 - (gap / self.config.closeness_span).min(1.0);
                        (total + closeness, count + 1)
                    });

                (count > 0).then(|| SimilarityScore {
                    student,
                    weight: total / f64::from(count),
                })
            })
            .collect()
    }

    pub fn project_term_averages(
        &self,
        scores: &[SimilarityScore<'_>],
        current_term: u32,
    ) -> BTreeMap<u32, f64> {
        let mut sums: BTreeMap<u32, (f64, f64)> = BTreeMap::new();

        for score in scores {
            for result in score.student.term_results() {
                if result.term > current_term && result.term <= self.config.horizon {
                    let entry = sums.entry(result.term).or_insert((0.0, 0.0));
                    entry.0 += result.period_average * score.weight;
                    entry.1 += score.weight;
                }
            }
        }

        sums.into_iter()
            .map(|(term, (weighted_sum, total_weight))| {
                let average = if total_weight > 0.0 {
                    weighted_sum / total_weight
                } else {
                    self.config.fallback_term_average
                };
                (term, average)
            })
            .collect()
    }

    /// Projection for `term`, else the preceding term's, else the baseline.
    /// Non-positive projections count as missing.
    pub fn projection_for(&self, projections: &BTreeMap<u32, f64>, term: u32) -> f64 {
        let usable = |t: u32| projections.get(&t).copied().filter(|value| *value > 0.0);
        usable(term)
            .or_else(|| term.checked_sub(1).and_then(usable))
            .unwrap_or(self.config.fallback_term_average)
    }

    pub fn forecast(&self, pool: &[&StudentRecord], input: ForecastInput<'_>) -> ProjectionResult {
        let scores = self.weigh(
            pool,
            input.current_term,
            input.current_cumulative_average,
        );
        let projections = self.project_term_averages(&scores, input.current_term);
        debug!(
            pool = pool.len(),
            weighted = scores.len(),
            projected_terms = projections.len(),
            "built per-term projections"
        );

        let target = input.target_cumulative_average;
        let mut term = input.current_term.saturating_add(1);
        let mut cumulative = input.current_cumulative_average;
        let mut confidence = 1.0;
        let mut per_term_projections = BTreeMap::new();
        let mut cumulative_path = BTreeMap::new();
        let mut last_projected = None;

        while cumulative < target && term <= self.config.horizon {
            if input.completed_terms.contains(&term) {
                term += 1;
                continue;
            }

            let projected = self.projection_for(&projections, term);
            cumulative = (cumulative * f64::from(term - 1) + projected) / f64::from(term);
            per_term_projections.insert(term, projected);
            cumulative_path.insert(term, cumulative);
            last_projected = Some(term);
            debug!(term, projected, cumulative, "projected term");

            if cumulative >= target {
                break;
            }

            term += 1;
            confidence *= self.config.decay_factor;
        }

        let target_reached = cumulative >= target;
        let final_term = last_projected.unwrap_or(input.current_term);
        let max_attainable_term_average = per_term_projections.values().copied().reduce(f64::max);
        let verdict = if target_reached {
            format!("Predicted to reach {target:.2} by term {final_term}")
        } else {
            format!(
                "Based on closely matching students, achieving {target:.2} is unlikely. Best estimate: {cumulative:.2}"
            )
        };

        ProjectionResult {
            final_term,
            predicted_cumulative_average: cumulative,
            confidence,
            per_term_projections,
            cumulative_path,
            best_case: cumulative + self.config.case_band,
            worst_case: cumulative - self.config.case_band,
            max_attainable_term_average,
            max_observed_term: input.max_observed_term,
            target_reached,
            verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TermResult;
    use proptest::prelude::*;

    fn senior(id: &str, cumulative: f64, through_term: u32, later: &[(u32, f64)]) -> StudentRecord {
        let early = (1..=through_term).map(|term| TermResult {
            term,
            period_average: cumulative,
            cumulative_average: cumulative,
        });
        let late = later.iter().map(|(term, period)| TermResult {
            term: *term,
            period_average: *period,
            cumulative_average: cumulative,
        });
        StudentRecord::new(id, early.chain(late))
    }

    fn input(current: f64, target: f64, current_term: u32, completed: &[u32]) -> ForecastInput<'_> {
        ForecastInput {
            current_cumulative_average: current,
            target_cumulative_average: target,
            current_term,
            max_observed_term: 7,
            completed_terms: completed,
        }
    }

    #[test]
    fn closeness_scales_with_gap() {
        let forecaster = Forecaster::default();
        let near = senior("near", 8.0, 2, &[]);
        let half = senior("half", 7.0, 2, &[]);
        let far = senior("far", 4.0, 2, &[]);
        let pool = vec![&near, &half, &far];

        let scores = forecaster.weigh(&pool, 2, 8.0);
        let weights: Vec<f64> = scores.iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn candidates_without_comparable_terms_are_dropped() {
        let forecaster = Forecaster::default();
        let late_only = StudentRecord::new(
            "late",
            vec![TermResult {
                term: 6,
                period_average: 8.0,
                cumulative_average: 8.0,
            }],
        );
        let scores = forecaster.weigh(&[&late_only], 4, 7.0);
        assert!(scores.is_empty());
    }

    #[test]
    fn uniform_candidates_project_their_own_average() {
        let forecaster = Forecaster::default();
        let a = senior("a", 7.0, 4, &[(5, 8.0)]);
        let b = senior("b", 7.0, 4, &[(5, 8.0)]);
        let scores = forecaster.weigh(&[&a, &b], 4, 7.0);
        assert!(scores.iter().all(|s| s.weight == 1.0));

        let projections = forecaster.project_term_averages(&scores, 4);
        assert_eq!(projections.get(&5), Some(&8.0));
    }

    #[test]
    fn projection_is_weight_weighted() {
        let forecaster = Forecaster::default();
        let close = senior("close", 7.0, 2, &[(3, 8.0)]);
        let halfway = senior("halfway", 6.0, 2, &[(3, 6.0)]);
        let scores = forecaster.weigh(&[&close, &halfway], 2, 7.0);

        let projections = forecaster.project_term_averages(&scores, 2);
        let expected = (8.0 * 1.0 + 6.0 * 0.5) / 1.5;
        assert!((projections[&3] - expected).abs() < 0.001);
    }

    #[test]
    fn missing_term_falls_back_to_previous_then_baseline() {
        let forecaster = Forecaster::default();
        let projections = BTreeMap::from([(5, 8.2)]);
        assert_eq!(forecaster.projection_for(&projections, 5), 8.2);
        assert_eq!(forecaster.projection_for(&projections, 6), 8.2);
        assert_eq!(forecaster.projection_for(&projections, 7), 6.5);
        assert_eq!(forecaster.projection_for(&BTreeMap::new(), 1), 6.5);
    }

    #[test]
    fn no_term_six_data_reuses_term_five() {
        let forecaster = Forecaster::default();
        let a = senior("a", 6.0, 4, &[(5, 7.5), (7, 9.0)]);
        let result = forecaster.forecast(&[&a], input(6.0, 9.9, 4, &[1, 2, 3, 4]));

        assert_eq!(result.per_term_projections.get(&5), Some(&7.5));
        assert_eq!(result.per_term_projections.get(&6), Some(&7.5));
        assert_eq!(result.per_term_projections.get(&7), Some(&9.0));
    }

    #[test]
    fn reaching_target_in_one_step_keeps_full_confidence() {
        let forecaster = Forecaster::default();
        let a = senior("a", 7.0, 4, &[(5, 8.0)]);
        let result = forecaster.forecast(&[&a], input(7.0, 7.1, 4, &[1, 2, 3, 4]));

        assert!(result.target_reached);
        assert_eq!(result.final_term, 5);
        assert_eq!(result.confidence, 1.0);
        assert!((result.predicted_cumulative_average - 7.2).abs() < 1e-9);
        assert_eq!(result.max_attainable_term_average, Some(8.0));
        assert!(result.verdict.contains("by term 5"));
    }

    #[test]
    fn unreachable_target_reports_best_estimate() {
        let forecaster = Forecaster::default();
        let a = senior("a", 6.0, 4, &[(5, 7.0), (6, 7.0), (7, 7.0)]);
        let result = forecaster.forecast(&[&a], input(6.0, 9.5, 4, &[1, 2, 3, 4]));

        assert!(!result.target_reached);
        assert_eq!(result.final_term, 7);
        assert_eq!(result.per_term_projections.len(), 3);
        assert!((result.confidence - 0.94f64.powi(3)).abs() < 1e-12);
        let expected = (6.0 * 4.0 + 7.0 * 3.0) / 7.0;
        assert!((result.predicted_cumulative_average - expected).abs() < 1e-9);
        assert!((result.best_case - (expected + 0.3)).abs() < 1e-9);
        assert!((result.worst_case - (expected - 0.3)).abs() < 1e-9);
        assert!(result.verdict.contains("unlikely"));
        assert!(result.verdict.contains(&format!("{expected:.2}")));
    }

    #[test]
    fn completed_terms_are_skipped_without_decay() {
        let forecaster = Forecaster::default();
        let a = senior("a", 6.0, 4, &[(5, 7.0), (6, 9.0)]);
        let result = forecaster.forecast(&[&a], input(6.0, 6.4, 4, &[1, 2, 3, 4, 5]));

        assert!(!result.per_term_projections.contains_key(&5));
        assert_eq!(result.per_term_projections.get(&6), Some(&9.0));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.final_term, 6);
    }

    #[test]
    fn nothing_left_to_project_at_horizon() {
        let forecaster = Forecaster::default();
        let result = forecaster.forecast(&[], input(6.0, 8.0, 7, &[1, 2, 3, 4, 5, 6, 7]));

        assert!(result.per_term_projections.is_empty());
        assert_eq!(result.max_attainable_term_average, None);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.final_term, 7);
        assert_eq!(result.predicted_cumulative_average, 6.0);
    }

    #[test]
    fn far_term_numbers_only_visit_recorded_terms() {
        let forecaster = Forecaster::default();
        let seniors: Vec<StudentRecord> = (0..10)
            .map(|i| senior(&format!("2021ugpi{i:03}"), 8.0, 2, &[(5, 8.5)]))
            .collect();
        let pool: Vec<&StudentRecord> = seniors.iter().collect();

        let scores = forecaster.weigh(&pool, u32::MAX, 8.0);
        assert_eq!(scores.len(), 10);
        assert!(scores.iter().all(|score| score.weight == 1.0));

        let result = forecaster.forecast(&pool, input(7.0, 9.0, u32::MAX, &[1, 2]));
        assert!(result.per_term_projections.is_empty());
        assert_eq!(result.final_term, u32::MAX);
        assert!(!result.target_reached);
    }

    #[test]
    fn empty_pool_uses_baseline() {
        let forecaster = Forecaster::default();
        let result = forecaster.forecast(&[], input(6.0, 6.2, 5, &[1, 2, 3, 4, 5]));
        assert_eq!(result.per_term_projections.get(&6), Some(&6.5));
    }

    #[test]
    fn config_overrides_constants() {
        let forecaster = Forecaster::new(ForecastConfig {
            decay_factor: 0.5,
            fallback_term_average: 9.0,
            horizon: 6,
            ..ForecastConfig::default()
        });
        let result = forecaster.forecast(&[], input(5.0, 9.9, 4, &[]));

        assert_eq!(result.per_term_projections.keys().copied().collect::<Vec<_>>(), vec![5, 6]);
        assert!(result.per_term_projections.values().all(|v| *v == 9.0));
        assert_eq!(result.confidence, 0.25);
    }

    proptest! {
        #[test]
        fn confidence_stays_in_unit_interval(
            seniors in prop::collection::vec((4.0f64..10.0, 4.0f64..10.0), 0..8),
            current in 4.0f64..9.0,
            gain in 0.01f64..3.0,
            current_term in 1u32..7,
        ) {
            let forecaster = Forecaster::default();
            let records: Vec<StudentRecord> = seniors
                .iter()
                .enumerate()
                .map(|(i, (cumulative, period))| {
                    let late: Vec<(u32, f64)> = (current_term + 1..=7).map(|t| (t, *period)).collect();
                    senior(&format!("s{i}"), *cumulative, current_term, &late)
                })
                .collect();
            let pool: Vec<&StudentRecord> = records.iter().collect();
            let completed: Vec<u32> = (1..=current_term).collect();

            let result = forecaster.forecast(&pool, input(current, current + gain, current_term, &completed));
            prop_assert!(result.confidence > 0.0 && result.confidence <= 1.0);

            let projected = result.per_term_projections.len() as i32;
            let decays = if result.target_reached { projected - 1 } else { projected };
            prop_assert!((result.confidence - 0.94f64.powi(decays.max(0))).abs() < 1e-12);
        }

        #[test]
        fn cumulative_never_drops_when_projections_exceed_it(
            offsets in prop::collection::vec(-1.5f64..1.5, 1..8),
            current in 4.0f64..7.0,
            lift in 0.5f64..3.0,
            current_term in 1u32..6,
        ) {
            let forecaster = Forecaster::default();
            let period = current + lift;
            let records: Vec<StudentRecord> = offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| {
                    let late: Vec<(u32, f64)> = (current_term + 1..=7).map(|t| (t, period)).collect();
                    senior(&format!("s{i}"), current + offset, current_term, &late)
                })
                .collect();
            let pool: Vec<&StudentRecord> = records.iter().collect();
            let completed: Vec<u32> = (1..=current_term).collect();

            let result = forecaster.forecast(&pool, input(current, 10.0, current_term, &completed));
            let mut previous = current;
            for value in result.cumulative_path.values() {
                prop_assert!(*value >= previous - 1e-9);
                previous = *value;
            }
        }
    }
}
