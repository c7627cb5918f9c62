use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{ForecastError, ForecastResult};
use crate::forecast::{ForecastInput, Forecaster};
use crate::models::{
    ClassStatistics, CohortId, Outlook, Prediction, ProgramAggregate, StandingResult, StudentId,
    StudentRecord,
};
use crate::similarity;
use crate::statistics::{Aggregator, PopulationScope};
use crate::store::RecordStore;

pub struct ForecastService<S> {
    store: S,
    config: AppConfig,
    forecaster: Forecaster,
    aggregator: Aggregator,
}

impl<S: RecordStore> ForecastService<S> {
    pub fn new(store: S, config: AppConfig) -> Self {
        let forecaster = Forecaster::new(config.forecast.clone());
        let aggregator = Aggregator::new(config.statistics.clone());
        Self {
            store,
            config,
            forecaster,
            aggregator,
        }
    }

    pub async fn cohorts(&self) -> ForecastResult<Vec<CohortId>> {
        Ok(self.store.list_cohorts().await?)
    }

    pub async fn predict(&self, student_id: &str, target: f64) -> ForecastResult<Prediction> {
        let id = parse_student_id(student_id)?;
        self.check_target(target)?;

        let cohort = id.cohort();
        if !self.store.cohort_exists(cohort).await? {
            return Err(ForecastError::NotFound(format!("cohort {cohort} does not exist")));
        }
        let student = self
            .store
            .fetch_one(cohort, id.as_str())
            .await?
            .ok_or_else(|| {
                ForecastError::NotFound(format!("student {id} not found in cohort {cohort}"))
            })?;

        let (current_term, current_cumulative_average) = match student.final_result() {
            Some(result) => (result.term, result.cumulative_average),
            None => (self.config.assumed_progress(cohort), 0.0),
        };
        let program_standing = self.program_standing(&id, &student).await?;

        let mut prediction = Prediction {
            student_id: student.id.clone(),
            cohort,
            current_term,
            current_cumulative_average,
            target_cumulative_average: target,
            history: student.term_results().to_vec(),
            comparison_pool_size: 0,
            similar_pool_size: 0,
            outlook: Outlook::TargetAlreadyMet {
                current_cumulative_average,
            },
            program_standing,
        };

        if current_cumulative_average >= target {
            info!(student = %id, current_cumulative_average, target, "target already met");
            return Ok(prediction);
        }

        let seniors = self.predecessor_records(cohort).await?;
        let max_observed_term = seniors
            .iter()
            .filter_map(|senior| senior.final_result())
            .map(|result| result.term)
            .fold(current_term.min(self.config.forecast.horizon), u32::max);

        let profile = similarity::profile_of(&student, current_term);
        let similar = similarity::select_similar(
            &seniors,
            &profile,
            self.config.forecast.similarity_tolerance,
        );
        prediction.comparison_pool_size = seniors.len();
        prediction.similar_pool_size = similar.len();

        let pool: Vec<&StudentRecord> = if similar.is_empty() {
            warn!(student = %id, seniors = seniors.len(), "no similar seniors, using every senior");
            seniors.iter().collect()
        } else {
            similar
        };

        let completed_terms = student.completed_terms();
        let projection = self.forecaster.forecast(
            &pool,
            ForecastInput {
                current_cumulative_average,
                target_cumulative_average: target,
                current_term,
                max_observed_term,
                completed_terms: &completed_terms,
            },
        );
        info!(
            student = %id,
            predicted = projection.predicted_cumulative_average,
            confidence = projection.confidence,
            reached = projection.target_reached,
            "forecast complete"
        );

        prediction.outlook = Outlook::Projected(projection);
        Ok(prediction)
    }

    pub async fn class_statistics(
        &self,
        cohort: &str,
        student_id: Option<&str>,
    ) -> ForecastResult<ClassStatistics> {
        let cohort: CohortId = cohort
            .parse()
            .map_err(|e: crate::error::RecordParseError| ForecastError::InvalidInput(e.to_string()))?;
        let focus = student_id.map(parse_student_id).transpose()?;
        if let Some(id) = &focus {
            if id.cohort() != cohort {
                return Err(ForecastError::InvalidInput(format!(
                    "student {id} does not belong to cohort {cohort}"
                )));
            }
        }

        if !self.store.cohort_exists(cohort).await? {
            return Err(ForecastError::NotFound(format!("cohort {cohort} does not exist")));
        }
        let population = self.store.fetch_all(cohort).await?;
        if population.is_empty() {
            return Err(ForecastError::NotFound(format!("cohort {cohort} has no students")));
        }

        let statistics = match focus {
            None => ClassStatistics {
                cohort,
                cohort_wide: self
                    .aggregator
                    .aggregate(&population, &PopulationScope::Whole, None),
                program: None,
            },
            Some(id) => {
                if !population.iter().any(|student| student.id == id.as_str()) {
                    return Err(ForecastError::NotFound(format!(
                        "student {id} not found in cohort {cohort}"
                    )));
                }
                let cohort_wide =
                    self.aggregator
                        .aggregate(&population, &PopulationScope::Whole, Some(id.as_str()));
                let program_prefix = id.program_prefix();
                let program = self.aggregator.aggregate(
                    &population,
                    &PopulationScope::Program(id.clone()),
                    Some(id.as_str()),
                );
                ClassStatistics {
                    cohort,
                    cohort_wide,
                    program: Some(ProgramAggregate {
                        program_prefix,
                        aggregate: program,
                    }),
                }
            }
        };

        info!(
            %cohort,
            students = statistics.cohort_wide.population_size,
            "class statistics complete"
        );
        Ok(statistics)
    }

    fn check_target(&self, target: f64) -> ForecastResult<()> {
        let max = self.config.forecast.grade_scale_max;
        if !target.is_finite() || target <= 0.0 || target > max {
            return Err(ForecastError::InvalidInput(format!(
                "target average must be in (0, {max}], got {target}"
            )));
        }
        Ok(())
    }

    async fn program_standing(
        &self,
        id: &StudentId,
        student: &StudentRecord,
    ) -> ForecastResult<Option<StandingResult>> {
        let classmates = self.store.fetch_all(id.cohort()).await?;
        Ok(self
            .aggregator
            .aggregate(
                &classmates,
                &PopulationScope::Program(id.clone()),
                Some(student.id.as_str()),
            )
            .standing)
    }

    async fn predecessor_records(&self, cohort: CohortId) -> ForecastResult<Vec<StudentRecord>> {
        let earliest = self.config.earliest_cohort();
        let mut seniors = Vec::new();
        let mut cohorts_found = 0usize;
        let mut candidate = cohort.previous();

        while let Some(senior_cohort) = candidate.filter(|c| *c >= earliest) {
            if self.store.cohort_exists(senior_cohort).await? {
                cohorts_found += 1;
                let records = self.store.fetch_all(senior_cohort).await?;
                let before = seniors.len();
                seniors.extend(records.into_iter().filter(StudentRecord::has_results));
                debug!(cohort = %senior_cohort, students = seniors.len() - before, "loaded senior cohort");
            } else {
                debug!(cohort = %senior_cohort, "senior cohort missing, skipping");
            }
            candidate = senior_cohort.previous();
        }

        if cohorts_found == 0 {
            return Err(ForecastError::NoComparableData(format!(
                "no cohort between {earliest} and {cohort} to compare against"
            )));
        }
        if seniors.is_empty() {
            return Err(ForecastError::NoComparableData(format!(
                "cohorts before {cohort} have no recorded terms"
            )));
        }
        Ok(seniors)
    }
}

fn parse_student_id(raw: &str) -> ForecastResult<StudentId> {
    if raw.trim().is_empty() {
        return Err(ForecastError::InvalidInput("student id is required".to_string()));
    }
    raw.parse()
        .map_err(|e: crate::error::RecordParseError| ForecastError::InvalidInput(e.to_string()))
}
