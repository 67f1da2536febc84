use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::UserGroup;
use crate::error::ConfigError;
use crate::priority::{validate_alpha, validate_weight};

/// Scheduler configuration.
///
/// Deserializable so an external loader can produce it; durations are
/// expressed in seconds. Missing fields take the production defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fairness exponent. 0 = FIFO, 1 = proportional, larger values sharpen
    /// the effect of urgency and group weight.
    pub alpha: f64,
    /// Multiplier per group. Groups not listed use weight 1.0.
    pub group_weights: BTreeMap<UserGroup, f64>,
    /// Starvation bound and cap for wait estimates.
    #[serde(with = "duration_secs")]
    pub max_wait_time: Duration,
    pub aging: AgingConfig,
    /// Processing interval assumed for estimates before any allocation.
    #[serde(with = "duration_secs")]
    pub initial_processing_estimate: Duration,
    pub metrics: MetricsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            alpha: 2.0,
            group_weights: default_group_weights(),
            max_wait_time: Duration::from_secs(24 * 60 * 60),
            aging: AgingConfig::default(),
            initial_processing_estimate: Duration::from_secs(60 * 60),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Age term applied to long-waiting tickets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingConfig {
    /// Fraction of `max_wait_time` after which the age term applies.
    pub threshold: f64,
    /// Score added per full `max_wait_time` of waiting.
    pub factor: f64,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            factor: 1.0,
        }
    }
}

/// Sample windows kept by the metrics collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Most recent wait times kept across all groups.
    pub global_window: usize,
    /// Most recent wait times kept per group.
    pub group_window: usize,
    /// Most recent processing intervals kept.
    pub interval_window: usize,
    /// Intervals used for the allocation rate.
    pub rate_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            global_window: 1000,
            group_window: 100,
            interval_window: 1000,
            rate_window: 100,
        }
    }
}

pub fn default_group_weights() -> BTreeMap<UserGroup, f64> {
    UserGroup::ALL
        .into_iter()
        .map(|group| (group, group.default_weight()))
        .collect()
}

impl SchedulerConfig {
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_group_weight(mut self, group: UserGroup, weight: f64) -> Self {
        self.group_weights.insert(group, weight);
        self
    }

    pub fn with_group_weights(mut self, weights: BTreeMap<UserGroup, f64>) -> Self {
        self.group_weights = weights;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_aging(mut self, threshold: f64, factor: f64) -> Self {
        self.aging = AgingConfig { threshold, factor };
        self
    }

    pub fn with_initial_processing_estimate(mut self, estimate: Duration) -> Self {
        self.initial_processing_estimate = estimate;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_alpha(self.alpha)?;
        for (group, weight) in &self.group_weights {
            validate_weight(*group, *weight)?;
        }
        if self.max_wait_time.is_zero() {
            return Err(ConfigError::ZeroMaxWait);
        }
        let threshold = self.aging.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidAgingThreshold(threshold));
        }
        let factor = self.aging.factor;
        if !factor.is_finite() || factor < 0.0 {
            return Err(ConfigError::InvalidAgingFactor(factor));
        }
        let windows = [
            ("global", self.metrics.global_window),
            ("group", self.metrics.group_window),
            ("interval", self.metrics.interval_window),
            ("rate", self.metrics.rate_window),
        ];
        if let Some((name, _)) = windows.into_iter().find(|(_, size)| *size == 0) {
            return Err(ConfigError::EmptyWindow(name));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.alpha, 2.0);
        assert_eq!(config.group_weights[&UserGroup::Refugee], 1.5);
        assert_eq!(config.group_weights[&UserGroup::HighIncome], 0.7);
        assert_eq!(config.group_weights.len(), UserGroup::ALL.len());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{
                "alpha": 1.5,
                "group_weights": { "student": 2.0 },
                "max_wait_time": 0.25,
                "aging": { "factor": 4.0 }
            }"#,
        )
        .expect("config parses");

        assert_eq!(config.alpha, 1.5);
        assert_eq!(config.group_weights.len(), 1);
        assert_eq!(config.group_weights[&UserGroup::Student], 2.0);
        assert_eq!(config.max_wait_time, Duration::from_millis(250));
        assert_eq!(config.aging.threshold, 0.5);
        assert_eq!(config.aging.factor, 4.0);
        assert_eq!(config.metrics, MetricsConfig::default());
        config.validate().expect("parsed config validates");
    }

    #[test]
    fn rejects_negative_duration() {
        let parsed = serde_json::from_str::<SchedulerConfig>(r#"{ "max_wait_time": -1.0 }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn validation_errors() {
        let base = SchedulerConfig::default();
        assert_eq!(
            base.clone().with_alpha(-1.0).validate(),
            Err(ConfigError::InvalidAlpha(-1.0))
        );
        assert!(matches!(
            base.clone().with_group_weight(UserGroup::Senior, 0.0).validate(),
            Err(ConfigError::InvalidGroupWeight { .. })
        ));
        assert_eq!(
            base.clone().with_max_wait_time(Duration::ZERO).validate(),
            Err(ConfigError::ZeroMaxWait)
        );
        assert_eq!(
            base.clone().with_aging(1.5, 1.0).validate(),
            Err(ConfigError::InvalidAgingThreshold(1.5))
        );
        assert_eq!(
            base.clone().with_aging(0.5, -2.0).validate(),
            Err(ConfigError::InvalidAgingFactor(-2.0))
        );
        let metrics = MetricsConfig {
            group_window: 0,
            ..MetricsConfig::default()
        };
        assert_eq!(
            base.with_metrics(metrics).validate(),
            Err(ConfigError::EmptyWindow("group"))
        );
    }
}
