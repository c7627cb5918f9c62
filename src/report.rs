use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{ClassStatistics, CohortAggregate, Outlook, Prediction, StandingResult};

fn write_standing(output: &mut String, label: &str, standing: Option<&StandingResult>) {
    match standing {
        Some(standing) => {
            let _ = writeln!(
                output,
                "- {label}: rank {} of {} ({:.2} percentile)",
                standing.rank, standing.cohort_size, standing.percentile
            );
        }
        None => {
            let _ = writeln!(output, "- {label}: not ranked (no positive cumulative average)");
        }
    }
}

pub fn build_prediction_report(prediction: &Prediction, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Cumulative Average Forecast");
    let _ = writeln!(
        output,
        "Generated for {} (cohort {}) at {}",
        prediction.student_id,
        prediction.cohort,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Current Standing");
    let _ = writeln!(
        output,
        "- Current cumulative average: {:.2} after term {}",
        prediction.current_cumulative_average, prediction.current_term
    );
    let _ = writeln!(
        output,
        "- Target cumulative average: {:.2}",
        prediction.target_cumulative_average
    );
    write_standing(
        &mut output,
        "Program standing",
        prediction.program_standing.as_ref(),
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Term History");
    if prediction.history.is_empty() {
        let _ = writeln!(output, "No completed terms recorded.");
    } else {
        for result in &prediction.history {
            let _ = writeln!(
                output,
                "- Term {}: period {:.2}, cumulative {:.2}",
                result.term, result.period_average, result.cumulative_average
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Outlook");
    match &prediction.outlook {
        Outlook::TargetAlreadyMet {
            current_cumulative_average,
        } => {
            let _ = writeln!(
                output,
                "Target already met at {current_cumulative_average:.2} (confidence 100.00%)."
            );
        }
        Outlook::Projected(projection) => {
            let _ = writeln!(output, "{}", projection.verdict);
            let _ = writeln!(output);
            let _ = writeln!(
                output,
                "- Predicted cumulative average: {:.2} (best {:.2}, worst {:.2})",
                projection.predicted_cumulative_average, projection.best_case, projection.worst_case
            );
            let _ = writeln!(output, "- Confidence: {:.2}%", projection.confidence * 100.0);
            if let Some(max) = projection.max_attainable_term_average {
                let _ = writeln!(output, "- Highest projected term average: {max:.2}");
            }
            let _ = writeln!(
                output,
                "- Compared against {} similar of {} senior students (data through term {})",
                prediction.similar_pool_size,
                prediction.comparison_pool_size,
                projection.max_observed_term
            );
            for (term, average) in &projection.per_term_projections {
                let cumulative = projection.cumulative_path.get(term).copied().unwrap_or(0.0);
                let _ = writeln!(
                    output,
                    "- Term {term}: projected period {average:.2}, cumulative {cumulative:.2}"
                );
            }
        }
    }

    output
}

fn write_aggregate(output: &mut String, aggregate: &CohortAggregate) {
    let _ = writeln!(output, "- Students: {}", aggregate.population_size);
    let _ = writeln!(
        output,
        "- Class average (final): cumulative {:.2}, period {:.2}",
        aggregate.class_average_final_cumulative, aggregate.class_average_final_period
    );
    let _ = writeln!(output, "- Highest final cumulative: {:.2}", aggregate.highest_final);
    if aggregate.standing.is_some() {
        write_standing(output, "Standing", aggregate.standing.as_ref());
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "### Term Difficulty");
    if aggregate.difficulty_by_term.is_empty() {
        let _ = writeln!(output, "No term results recorded.");
    }
    for entry in &aggregate.difficulty_by_term {
        let _ = writeln!(
            output,
            "- Term {}: {} (avg period {:.2})",
            entry.term,
            entry.difficulty.label(),
            entry.avg_period_average
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "### Period Average Distribution");
    if aggregate.distribution.is_empty() {
        let _ = writeln!(output, "No period averages recorded.");
    }
    for bucket in &aggregate.distribution {
        let _ = writeln!(output, "- {}: {}", bucket.label, bucket.count);
    }
}

pub fn build_statistics_report(statistics: &ClassStatistics, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Cohort Statistics");
    let _ = writeln!(
        output,
        "Generated for cohort {} at {}",
        statistics.cohort,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Whole Cohort");
    write_aggregate(&mut output, &statistics.cohort_wide);

    if let Some(program) = &statistics.program {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Program {}", program.program_prefix);
        write_aggregate(&mut output, &program.aggregate);
    }

    output
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;
    use crate::models::{CohortId, Difficulty, DistributionBucket, ProjectionResult, TermDifficulty, TermResult};

    fn generated() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap()
    }

    fn prediction(outlook: Outlook) -> Prediction {
        Prediction {
            student_id: "2022ugpi001".to_string(),
            cohort: CohortId::new(2022),
            current_term: 4,
            current_cumulative_average: 7.0,
            target_cumulative_average: 7.5,
            history: vec![TermResult {
                term: 1,
                period_average: 7.0,
                cumulative_average: 7.0,
            }],
            comparison_pool_size: 12,
            similar_pool_size: 3,
            outlook,
            program_standing: Some(StandingResult {
                rank: 2,
                cohort_size: 3,
                percentile: 66.67,
            }),
        }
    }

    #[test]
    fn prediction_report_lists_projection() {
        let projection = ProjectionResult {
            final_term: 6,
            predicted_cumulative_average: 7.52,
            confidence: 0.94,
            per_term_projections: BTreeMap::from([(5, 8.0), (6, 8.1)]),
            cumulative_path: BTreeMap::from([(5, 7.2), (6, 7.52)]),
            best_case: 7.82,
            worst_case: 7.22,
            max_attainable_term_average: Some(8.1),
            max_observed_term: 7,
            target_reached: true,
            verdict: "Predicted to reach 7.50 by term 6".to_string(),
        };
        let report = build_prediction_report(&prediction(Outlook::Projected(projection)), generated());

        assert!(report.contains("Generated for 2022ugpi001 (cohort 2022) at 2026-03-02 09:30 UTC"));
        assert!(report.contains("Predicted to reach 7.50 by term 6"));
        assert!(report.contains("- Confidence: 94.00%"));
        assert!(report.contains("- Term 6: projected period 8.10, cumulative 7.52"));
        assert!(report.contains("rank 2 of 3 (66.67 percentile)"));
    }

    #[test]
    fn prediction_report_for_met_target() {
        let report = build_prediction_report(
            &prediction(Outlook::TargetAlreadyMet {
                current_cumulative_average: 7.0,
            }),
            generated(),
        );
        assert!(report.contains("Target already met at 7.00 (confidence 100.00%)."));
    }

    #[test]
    fn statistics_report_includes_program_section() {
        let aggregate = CohortAggregate {
            population_size: 2,
            distribution: vec![DistributionBucket {
                label: "7.0-7.5".to_string(),
                lower: 7.0,
                count: 2,
            }],
            difficulty_by_term: vec![TermDifficulty {
                term: 1,
                avg_period_average: 7.2,
                difficulty: Difficulty::Moderate,
            }],
            term_trends: Vec::new(),
            class_average_final_cumulative: 7.2,
            class_average_final_period: 7.2,
            highest_final: 7.4,
            standing: None,
        };
        let statistics = ClassStatistics {
            cohort: CohortId::new(2022),
            cohort_wide: aggregate.clone(),
            program: Some(crate::models::ProgramAggregate {
                program_prefix: "2022ugpi".to_string(),
                aggregate,
            }),
        };

        let report = build_statistics_report(&statistics, generated());
        assert!(report.contains("## Program 2022ugpi"));
        assert!(report.contains("- Term 1: Moderate (avg period 7.20)"));
        assert!(report.contains("- 7.0-7.5: 2"));
    }
}
