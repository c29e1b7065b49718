//! Aggregators used for chrono (elapsed time) observations

use serde::{Deserialize, Serialize};

/// Which aggregator a new chrono should be backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorKind {
    /// Keep the latest observation only
    Value,
    /// Keep the whole history
    TimeSeries,
    /// Running statistics; the first `skip_obs` observations are dropped
    /// (warm-up iterations are usually not representative).
    Stat {
        /// Number of leading observations to ignore
        skip_obs: u32,
    },
}

impl Default for AggregatorKind {
    fn default() -> Self {
        Self::Stat { skip_obs: 1 }
    }
}

/// Running mean / sd / min / max without keeping the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatAggregator {
    skip_obs: u32,
    dropped: u32,
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl StatAggregator {
    /// Create an aggregator dropping the first `skip_obs` observations
    #[must_use]
    pub fn new(skip_obs: u32) -> Self {
        Self {
            skip_obs,
            ..Self::default()
        }
    }

    /// Record one observation
    pub fn append(&mut self, value: f64) {
        if self.dropped < self.skip_obs {
            self.dropped += 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Number of observations seen, including dropped warm-up ones
    #[must_use]
    pub fn observations(&self) -> u64 {
        self.count + u64::from(self.dropped)
    }

    /// Number of observations aggregated
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Sum of the aggregated observations
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.sum
    }

    /// Mean, `None` before the first aggregated observation
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population standard deviation
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sd(&self) -> Option<f64> {
        let avg = self.avg()?;
        let var = (self.sum_sq / self.count as f64 - avg * avg).max(0.0);
        Some(var.sqrt())
    }

    /// Smallest observation
    #[must_use]
    pub const fn min(&self) -> Option<f64> {
        self.min
    }

    /// Largest observation
    #[must_use]
    pub const fn max(&self) -> Option<f64> {
        self.max
    }
}

/// Container for chrono observations, persisted with a `kind` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregator {
    /// Latest value only
    Value {
        /// Last observation
        value: Option<f64>,
    },
    /// Full history
    TimeSeries {
        /// Every observation in order
        values: Vec<f64>,
    },
    /// Running statistics
    Stat(StatAggregator),
}

impl Aggregator {
    /// Build an empty aggregator of the given kind
    #[must_use]
    pub fn new(kind: AggregatorKind) -> Self {
        match kind {
            AggregatorKind::Value => Self::Value { value: None },
            AggregatorKind::TimeSeries => Self::TimeSeries { values: Vec::new() },
            AggregatorKind::Stat { skip_obs } => Self::Stat(StatAggregator::new(skip_obs)),
        }
    }

    /// Record one observation
    pub fn append(&mut self, observation: f64) {
        match self {
            Self::Value { value } => *value = Some(observation),
            Self::TimeSeries { values } => values.push(observation),
            Self::Stat(stat) => stat.append(observation),
        }
    }

    /// Last observed value (mean for running statistics)
    #[must_use]
    pub fn val(&self) -> Option<f64> {
        match self {
            Self::Value { value } => *value,
            Self::TimeSeries { values } => values.last().copied(),
            Self::Stat(stat) => stat.avg(),
        }
    }

    /// Number of observations recorded
    #[must_use]
    pub fn observations(&self) -> u64 {
        match self {
            Self::Value { value } => u64::from(value.is_some()),
            Self::TimeSeries { values } => values.len() as u64,
            Self::Stat(stat) => stat.observations(),
        }
    }

    /// Reconcile with the on-disk version of the same chrono.
    ///
    /// Running statistics cannot be combined after the fact, so the side
    /// that has seen more observations wins and a statistic never regresses.
    /// Other kinds take the on-disk (newer) version.
    #[must_use]
    pub fn merged(self, newer: Self) -> Self {
        match (&self, &newer) {
            (Self::Stat(mine), Self::Stat(theirs)) if mine.observations() > theirs.observations() => self,
            _ => newer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_skips_warmup() {
        let mut stat = StatAggregator::new(2);
        for v in [100.0, 100.0, 1.0, 3.0] {
            stat.append(v);
        }
        assert_eq!(stat.count(), 2);
        assert_eq!(stat.observations(), 4);
        assert!((stat.total() - 4.0).abs() < f64::EPSILON);
        assert!((stat.avg().unwrap() - 2.0).abs() < f64::EPSILON);
        assert!((stat.sd().unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(stat.min(), Some(1.0));
        assert_eq!(stat.max(), Some(3.0));
    }

    #[test]
    fn test_aggregator_kinds() {
        let mut value = Aggregator::new(AggregatorKind::Value);
        value.append(1.0);
        value.append(2.0);
        assert_eq!(value.val(), Some(2.0));

        let mut ts = Aggregator::new(AggregatorKind::TimeSeries);
        ts.append(1.0);
        ts.append(2.0);
        assert_eq!(ts.observations(), 2);
    }

    #[test]
    fn test_stat_merge_never_regresses() {
        let mut mine = Aggregator::new(AggregatorKind::Stat { skip_obs: 0 });
        mine.append(1.0);
        mine.append(2.0);
        let mut theirs = Aggregator::new(AggregatorKind::Stat { skip_obs: 0 });
        theirs.append(5.0);

        let merged = mine.clone().merged(theirs.clone());
        assert_eq!(merged, mine);

        let merged = theirs.merged(mine.clone());
        assert_eq!(merged, mine);
    }

    #[test]
    fn test_serde_tagged() {
        let agg = Aggregator::TimeSeries {
            values: vec![0.5, 0.25],
        };
        let json = serde_json::to_value(&agg).unwrap();
        assert_eq!(json["kind"], "time_series");
        let back: Aggregator = serde_json::from_value(json).unwrap();
        assert_eq!(back, agg);
    }
}
