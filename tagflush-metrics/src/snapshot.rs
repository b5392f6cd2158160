use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tagflush_log::LogError;

/// Type used for counter values and per-second rates.
pub type CounterType = f64;

/// Type used for gauge values.
pub type GaugeType = f64;

/// Type used for the number of unique members of a set.
pub type SetType = f64;

/// Type used for individual timer samples.
pub type TimerType = f64;

/// A precomputed timer aggregate, such as `mean_90` or `upper`.
///
/// Statistics can be nested, for instance per-percentile or histogram bins. Every level of
/// nesting adds one segment to the name of the resulting data point.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TimerStatistic {
    /// A single statistic value.
    Value(f64),
    /// Statistics keyed by a sub-name, for example `{"bin_100": 3, "bin_inf": 1}`.
    Nested(BTreeMap<String, TimerStatistic>),
}

/// Aggregated metrics handed to a backend on every flush.
///
/// The host runtime produces a fresh snapshot for every flush interval, the backends only read it.
/// Categories missing from the serialized form are empty. Entries with a value of the wrong type,
/// such as `null` gauges, are logged and dropped without affecting other entries. Keys are raw
/// metric keys, see
/// [`ParsedKey`](crate::ParsedKey) and [`graphite_name`](crate::graphite_name).
///
/// ```json
/// {
///   "counters": {"api.requests.host=web1": 42},
///   "counter_rates": {"api.requests.host=web1": 4.2},
///   "gauges": {"queue.depth": 7},
///   "sets": {"users.unique": 3},
///   "timers": {"api.latency": [12, 15, 40]},
///   "timer_data": {"api.latency": {"mean": 22.3, "upper": 40}},
///   "pctThreshold": [90]
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RawMetricsSnapshot {
    /// Accumulated counter values.
    #[serde(deserialize_with = "lenient_entries")]
    pub counters: BTreeMap<String, CounterType>,
    /// Last reported gauge values.
    #[serde(deserialize_with = "lenient_entries")]
    pub gauges: BTreeMap<String, GaugeType>,
    /// Number of unique members per set.
    #[serde(deserialize_with = "lenient_entries")]
    pub sets: BTreeMap<String, SetType>,
    /// Per-second rates of the counters, computed by the host.
    #[serde(deserialize_with = "lenient_entries")]
    pub counter_rates: BTreeMap<String, CounterType>,
    /// Raw samples per timer, in the order they were reported.
    #[serde(deserialize_with = "lenient_entries")]
    pub timers: BTreeMap<String, Vec<TimerType>>,
    /// Precomputed statistics per timer.
    #[serde(deserialize_with = "lenient_entries")]
    pub timer_data: BTreeMap<String, BTreeMap<String, TimerStatistic>>,
    /// Percentile thresholds the timer statistics were computed for.
    #[serde(rename = "pctThreshold", skip_serializing_if = "Option::is_none")]
    pub pct_threshold: Option<serde_json::Value>,
    /// Further fields of the host, passed through untouched.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl RawMetricsSnapshot {
    /// Returns the total number of raw keys across all categories.
    pub fn len(&self) -> usize {
        self.counters.len()
            + self.gauges.len()
            + self.sets.len()
            + self.counter_rates.len()
            + self.timers.len()
            + self.timer_data.len()
    }

    /// Returns `true` if no category contains any key.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deserializes a category, dropping entries whose value cannot be deserialized.
fn lenient_entries<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut entries = BTreeMap::new();

    for (key, value) in raw {
        match serde_json::from_value(value) {
            Ok(value) => {
                entries.insert(key, value);
            }
            Err(error) => {
                tagflush_log::error!(
                    "dropping entry {key:?} with invalid value: {}",
                    LogError(&error)
                );
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "gauges": {"queue.depth": 7},
            "timer_data": {
                "api.latency": {
                    "mean": 22.5,
                    "histogram": {"bin_50": 2, "bin_inf": 1}
                }
            },
            "pctThreshold": [90],
            "statsd_metrics": {"processing_time": 1}
        }"#;

        let snapshot: RawMetricsSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.counters.is_empty());
        assert_eq!(snapshot.gauges["queue.depth"], 7.0);
        assert_eq!(snapshot.pct_threshold, Some(serde_json::json!([90])));
        assert!(snapshot.other.contains_key("statsd_metrics"));

        let stats = &snapshot.timer_data["api.latency"];
        assert_eq!(stats["mean"], TimerStatistic::Value(22.5));
        assert!(matches!(&stats["histogram"], TimerStatistic::Nested(bins) if bins.len() == 2));
    }

    #[test]
    fn test_invalid_entries_dropped() {
        tagflush_log::init_test!();

        let json = r#"{
            "gauges": {"a": null, "b": 1},
            "timers": {"t": [1, "x"], "u": [2]},
            "timer_data": {"t": {"mean": "fast"}, "u": {"mean": 2}}
        }"#;

        let snapshot: RawMetricsSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.gauges["b"], 1.0);
        assert_eq!(snapshot.timers["u"], [2.0]);
        assert!(snapshot.timer_data.contains_key("u"));
    }

    #[test]
    fn test_empty() {
        let snapshot: RawMetricsSnapshot = serde_json::from_str("{}").unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(serde_json::to_string(&snapshot).unwrap(), "{\"counters\":{},\"gauges\":{},\"sets\":{},\"counter_rates\":{},\"timers\":{},\"timer_data\":{}}");
    }
}
