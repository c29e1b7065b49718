//! Metric containers: flat sequences or step-indexed series

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// One named metric of a trial.
///
/// Persisted as a JSON array (`Sequence`) or as an object keyed by step
/// (`Steps`), so the on-disk shape stays readable by other tools.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricSeries {
    /// Step -> value mapping, ordered by step
    Steps(BTreeMap<i64, Value>),
    /// Flat sequence of observations
    Sequence(Vec<Value>),
}

impl MetricSeries {
    /// Empty series shaped for the given step argument
    #[must_use]
    pub fn for_step(step: Option<i64>) -> Self {
        match step {
            Some(_) => Self::Steps(BTreeMap::new()),
            None => Self::Sequence(Vec::new()),
        }
    }

    /// Record one observation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a stepped value is logged into a flat
    /// sequence or the other way around.
    pub fn record(&mut self, step: Option<i64>, value: Value) -> Result<()> {
        match (self, step) {
            (Self::Steps(steps), Some(step)) => {
                steps.insert(step, value);
                Ok(())
            }
            (Self::Sequence(values), None) => {
                values.push(value);
                Ok(())
            }
            (Self::Steps(_), None) => Err(Error::InvalidInput(
                "metric is step-indexed, a step is required".to_string(),
            )),
            (Self::Sequence(_), Some(step)) => Err(Error::InvalidInput(format!(
                "metric is a flat sequence, cannot record step {step}"
            ))),
        }
    }

    /// Number of observations
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Steps(steps) => steps.len(),
            Self::Sequence(values) => values.len(),
        }
    }

    /// True when nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent observation (highest step for step series)
    #[must_use]
    pub fn last(&self) -> Option<&Value> {
        match self {
            Self::Steps(steps) => steps.values().next_back(),
            Self::Sequence(values) => values.last(),
        }
    }

    /// Reconcile with the on-disk (newer) version of the same metric.
    ///
    /// Step series are unioned with the newer side winning on equal steps,
    /// so points logged by either process survive. Sequences keep the
    /// longer history. Mismatched shapes take the newer side.
    #[must_use]
    pub fn merged(self, newer: Self) -> Self {
        match (self, newer) {
            (Self::Steps(mut mine), Self::Steps(theirs)) => {
                mine.extend(theirs);
                Self::Steps(mine)
            }
            (Self::Sequence(mine), Self::Sequence(theirs)) => {
                if mine.len() > theirs.len() {
                    Self::Sequence(mine)
                } else {
                    Self::Sequence(theirs)
                }
            }
            (_, newer) => newer,
        }
    }
}

// Untagged enums buffer their input, which loses the string -> integer
// conversion of JSON object keys; decode through `Value` instead.
impl<'de> Deserialize<'de> for MetricSeries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Array(values) => Ok(Self::Sequence(values)),
            Value::Object(map) => map
                .into_iter()
                .map(|(step, value)| {
                    step.parse::<i64>()
                        .map(|step| (step, value))
                        .map_err(|_| D::Error::custom(format!("invalid metric step `{step}`")))
                })
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                .map(Self::Steps),
            other => Err(D::Error::custom(format!(
                "metric must be an array or a step map, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_steps_ordered() {
        let mut series = MetricSeries::for_step(Some(0));
        series.record(Some(2), json!(0.2)).unwrap();
        series.record(Some(1), json!(0.1)).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.last(), Some(&json!(0.2)));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut series = MetricSeries::for_step(None);
        series.record(None, json!(1)).unwrap();
        assert!(series.record(Some(3), json!(1)).is_err());
    }

    #[test]
    fn test_step_merge_is_union() {
        let mine = MetricSeries::Steps([(1, json!(1)), (2, json!(2))].into_iter().collect());
        let theirs = MetricSeries::Steps([(2, json!(20)), (3, json!(3))].into_iter().collect());
        let MetricSeries::Steps(merged) = mine.merged(theirs) else {
            panic!("expected step series");
        };
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&2], json!(20));
    }

    #[test]
    fn test_untagged_serde_shapes() {
        let seq: MetricSeries = serde_json::from_value(json!([1, 2, 3])).unwrap();
        assert!(matches!(seq, MetricSeries::Sequence(ref v) if v.len() == 3));

        let steps: MetricSeries = serde_json::from_value(json!({"0": 0.5, "10": 0.25})).unwrap();
        let MetricSeries::Steps(map) = steps else {
            panic!("expected step series");
        };
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![0, 10]);
    }
}
