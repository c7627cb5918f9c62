use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use crate::models::CohortId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub similarity_tolerance: f64,
    pub decay_factor: f64,
    pub fallback_term_average: f64,
    pub case_band: f64,
    pub horizon: u32,
    pub closeness_span: f64,
    pub grade_scale_max: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            similarity_tolerance: 0.3,
            decay_factor: 0.94,
            fallback_term_average: 6.5,
            case_band: 0.3,
            horizon: 7,
            closeness_span: 2.0,
            grade_scale_max: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub easy_threshold: f64,
    pub moderate_threshold: f64,
    pub bucket_width: f64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            easy_threshold: 8.0,
            moderate_threshold: 7.0,
            bucket_width: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub earliest_cohort: u16,
    pub cohort_progress: BTreeMap<String, u32>,
    pub forecast: ForecastConfig,
    pub statistics: StatisticsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let cohort_progress = [("2021", 7), ("2022", 5), ("2023", 3), ("2024", 1)]
            .into_iter()
            .map(|(cohort, term)| (cohort.to_string(), term))
            .collect();

        Self {
            earliest_cohort: 2021,
            cohort_progress,
            forecast: ForecastConfig::default(),
            statistics: StatisticsConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let forecast = &self.forecast;
        ensure!(
            forecast.decay_factor > 0.0 && forecast.decay_factor <= 1.0,
            "forecast.decay_factor must be in (0, 1], got {}",
            forecast.decay_factor
        );
        ensure!(forecast.horizon > 0, "forecast.horizon must be at least 1");
        ensure!(
            forecast.similarity_tolerance >= 0.0,
            "forecast.similarity_tolerance must not be negative"
        );
        ensure!(
            forecast.closeness_span > 0.0,
            "forecast.closeness_span must be positive"
        );
        ensure!(
            forecast.grade_scale_max > 0.0,
            "forecast.grade_scale_max must be positive"
        );

        for (cohort, progress) in &self.cohort_progress {
            ensure!(
                (1..=forecast.horizon).contains(progress),
                "cohort_progress.{cohort} must be between 1 and forecast.horizon ({}), got {progress}",
                forecast.horizon
            );
        }

        let statistics = &self.statistics;
        ensure!(
            statistics.easy_threshold >= statistics.moderate_threshold,
            "statistics.easy_threshold must not be below statistics.moderate_threshold"
        );
        ensure!(
            statistics.bucket_width > 0.0,
            "statistics.bucket_width must be positive"
        );
        Ok(())
    }

    pub fn earliest_cohort(&self) -> CohortId {
        CohortId::new(self.earliest_cohort)
    }

    pub fn assumed_progress(&self, cohort: CohortId) -> u32 {
        self.cohort_progress
            .get(&cohort.to_string())
            .copied()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.forecast.horizon, 7);
        assert_eq!(config.assumed_progress(CohortId::new(2022)), 5);
        assert_eq!(config.assumed_progress(CohortId::new(2030)), 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"forecast": {"decay_factor": 0.9}}"#).unwrap();
        assert_eq!(config.forecast.decay_factor, 0.9);
        assert_eq!(config.forecast.fallback_term_average, 6.5);
        assert_eq!(config.earliest_cohort, 2021);
    }

    #[test]
    fn rejects_out_of_range_decay() {
        let mut config = AppConfig::default();
        config.forecast.decay_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_progress_beyond_horizon() {
        let mut config = AppConfig::default();
        config.cohort_progress.insert("2025".to_string(), 100_000_000);
        assert!(config.validate().is_err());

        config.cohort_progress.insert("2025".to_string(), 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = AppConfig::default();
        config.statistics.easy_threshold = 6.0;
        assert!(config.validate().is_err());
    }
}
