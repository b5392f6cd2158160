use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tagflush_log::LogError;

use crate::key::{KeyFormat, ParsedKey};
use crate::snapshot::{CounterType, RawMetricsSnapshot, TimerStatistic, TimerType};

/// Name of the dimension carrying the [`Category`] of a data point.
pub const TYPE_DIMENSION: &str = "type";

/// The kind of an aggregated metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Accumulated counts, emitted as a rate and optionally a count.
    Counter,
    /// Absolute values.
    Gauge,
    /// Numbers of unique members.
    Set,
    /// Per-second rates of counters.
    Rate,
    /// Raw timer samples.
    Timer,
    /// Statistics precomputed from timer samples.
    TimerStatistic,
}

impl Category {
    /// All categories in flush order.
    pub const ALL: [Self; 6] = [
        Self::Counter,
        Self::Set,
        Self::Gauge,
        Self::Rate,
        Self::Timer,
        Self::TimerStatistic,
    ];

    /// Returns the value of the [`TYPE_DIMENSION`] for this category.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Set => "set",
            Self::Rate => "rate",
            Self::Timer => "timer",
            Self::TimerStatistic => "timerdata",
        }
    }

    /// Returns the name of this category in a [`RawMetricsSnapshot`].
    pub fn snapshot_field(&self) -> &'static str {
        match self {
            Self::Counter => "counters",
            Self::Gauge => "gauges",
            Self::Set => "sets",
            Self::Rate => "counter_rates",
            Self::Timer => "timers",
            Self::TimerStatistic => "timer_data",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.snapshot_field())
    }
}

/// A single tagged value sent to the backend.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DataPoint {
    /// Fully qualified metric name.
    pub metric: String,
    /// The value.
    pub value: f64,
    /// Tags of the data point, always including [`TYPE_DIMENSION`].
    pub dimensions: BTreeMap<String, String>,
}

/// The raw entries of one category of a [`RawMetricsSnapshot`].
#[derive(Clone, Copy, Debug)]
pub enum CategoryMetrics<'a> {
    /// Counters along with the rates computed by the host.
    Counters {
        /// Accumulated counts.
        counts: &'a BTreeMap<String, CounterType>,
        /// Per-second rates by the same keys.
        rates: &'a BTreeMap<String, CounterType>,
    },
    /// Gauge values.
    Gauges(&'a BTreeMap<String, f64>),
    /// Set cardinalities.
    Sets(&'a BTreeMap<String, f64>),
    /// Counter rates.
    Rates(&'a BTreeMap<String, CounterType>),
    /// Timer samples.
    Timers(&'a BTreeMap<String, Vec<TimerType>>),
    /// Timer statistics.
    TimerStatistics(&'a BTreeMap<String, BTreeMap<String, TimerStatistic>>),
}

impl<'a> CategoryMetrics<'a> {
    /// Selects the entries of a category from the snapshot.
    pub fn from_snapshot(snapshot: &'a RawMetricsSnapshot, category: Category) -> Self {
        match category {
            Category::Counter => Self::Counters {
                counts: &snapshot.counters,
                rates: &snapshot.counter_rates,
            },
            Category::Gauge => Self::Gauges(&snapshot.gauges),
            Category::Set => Self::Sets(&snapshot.sets),
            Category::Rate => Self::Rates(&snapshot.counter_rates),
            Category::Timer => Self::Timers(&snapshot.timers),
            Category::TimerStatistic => Self::TimerStatistics(&snapshot.timer_data),
        }
    }

    /// Returns the category of these entries.
    pub fn category(&self) -> Category {
        match self {
            Self::Counters { .. } => Category::Counter,
            Self::Gauges(_) => Category::Gauge,
            Self::Sets(_) => Category::Set,
            Self::Rates(_) => Category::Rate,
            Self::Timers(_) => Category::Timer,
            Self::TimerStatistics(_) => Category::TimerStatistic,
        }
    }

    /// Returns the number of raw keys.
    pub fn len(&self) -> usize {
        match self {
            Self::Counters { counts, .. } => counts.len(),
            Self::Gauges(entries) | Self::Sets(entries) | Self::Rates(entries) => entries.len(),
            Self::Timers(entries) => entries.len(),
            Self::TimerStatistics(entries) => entries.len(),
        }
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Name segments inserted between the global prefix and the metric name, per category.
///
/// A namespace of `None` inserts nothing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Namespaces {
    /// Namespace of counters. Defaults to `counters`.
    pub counter: Option<String>,
    /// Namespace of gauges.
    pub gauge: Option<String>,
    /// Namespace of sets.
    pub set: Option<String>,
    /// Namespace of counter rates.
    pub rate: Option<String>,
    /// Namespace of timers.
    pub timer: Option<String>,
    /// Namespace of timer statistics.
    pub timer_statistic: Option<String>,
}

impl Namespaces {
    /// Namespaces that insert nothing for any category.
    pub fn none() -> Self {
        Self {
            counter: None,
            gauge: None,
            set: None,
            rate: None,
            timer: None,
            timer_statistic: None,
        }
    }

    /// Returns the namespace of the given category.
    pub fn get(&self, category: Category) -> Option<&str> {
        let namespace = match category {
            Category::Counter => &self.counter,
            Category::Gauge => &self.gauge,
            Category::Set => &self.set,
            Category::Rate => &self.rate,
            Category::Timer => &self.timer,
            Category::TimerStatistic => &self.timer_statistic,
        };

        namespace.as_deref()
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self {
            counter: Some("counters".to_owned()),
            ..Self::none()
        }
    }
}

/// Parameters used by the [`Shaper`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ShapeConfig {
    /// Name segments prepended to every metric.
    pub global_prefix: String,

    /// Name segments inserted after the global prefix, per category.
    pub namespaces: Namespaces,

    /// Emit the raw count of counters as `<name>.count` next to `<name>.rate`.
    ///
    /// Defaults to `true`.
    pub flush_counts: bool,

    /// The flush interval of the host in seconds.
    ///
    /// Used to compute counter rates the host did not provide. Defaults to `10` seconds.
    pub flush_interval: u64,

    /// The encoding of raw metric keys.
    pub key_format: KeyFormat,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            global_prefix: String::new(),
            namespaces: Namespaces::default(),
            flush_counts: true,
            flush_interval: 10,
            key_format: KeyFormat::default(),
        }
    }
}

/// Turns the raw entries of a snapshot category into data points.
///
/// Every raw key is parsed into a metric name and tags (see [`ParsedKey`]), and a
/// [`TYPE_DIMENSION`] with the [category](Category::type_tag) is added:
///
///  - Gauges, sets and rates yield one data point per key.
///  - Counters yield `<name>.rate` and, if enabled, `<name>.count`.
///  - Timers yield one data point per sample.
///  - Timer statistics yield one data point per statistic, named `<name>.<statistic>`.
///
/// Keys that fail to parse are logged and skipped without affecting the other keys.
#[derive(Clone, Debug, Default)]
pub struct Shaper {
    config: ShapeConfig,
}

impl Shaper {
    /// Creates a new shaper.
    pub fn new(config: ShapeConfig) -> Self {
        Self { config }
    }

    /// Shapes all entries of a category into data points.
    ///
    /// Data points are ordered by raw key.
    pub fn shape(&self, metrics: CategoryMetrics<'_>) -> Vec<DataPoint> {
        let category = metrics.category();
        let mut points = Vec::with_capacity(metrics.len());

        match metrics {
            CategoryMetrics::Counters { counts, rates } => {
                for (raw_key, &count) in counts {
                    let Some(key) = self.parse_key(category, raw_key) else {
                        continue;
                    };

                    let rate = rates
                        .get(raw_key)
                        .copied()
                        .unwrap_or_else(|| self.fallback_rate(count));

                    let name = self.metric_name(category, &key.metric_name);
                    let dimensions = dimensions(key.tags, category);

                    if self.config.flush_counts {
                        points.push(DataPoint {
                            metric: format!("{name}.count"),
                            value: count,
                            dimensions: dimensions.clone(),
                        });
                    }

                    points.push(DataPoint {
                        metric: format!("{name}.rate"),
                        value: rate,
                        dimensions,
                    });
                }
            }
            CategoryMetrics::Gauges(entries)
            | CategoryMetrics::Sets(entries)
            | CategoryMetrics::Rates(entries) => {
                for (raw_key, &value) in entries {
                    let Some(key) = self.parse_key(category, raw_key) else {
                        continue;
                    };

                    points.push(DataPoint {
                        metric: self.metric_name(category, &key.metric_name),
                        value,
                        dimensions: dimensions(key.tags, category),
                    });
                }
            }
            CategoryMetrics::Timers(entries) => {
                for (raw_key, samples) in entries {
                    let Some(key) = self.parse_key(category, raw_key) else {
                        continue;
                    };

                    let name = self.metric_name(category, &key.metric_name);
                    let dimensions = dimensions(key.tags, category);

                    points.extend(samples.iter().map(|&value| DataPoint {
                        metric: name.clone(),
                        value,
                        dimensions: dimensions.clone(),
                    }));
                }
            }
            CategoryMetrics::TimerStatistics(entries) => {
                for (raw_key, statistics) in entries {
                    let Some(key) = self.parse_key(category, raw_key) else {
                        continue;
                    };

                    let name = self.metric_name(category, &key.metric_name);
                    let dimensions = dimensions(key.tags, category);
                    push_statistics(&mut points, &name, statistics, &dimensions);
                }
            }
        }

        tagflush_log::debug!(
            "shaped {} {category} into {} datapoints",
            metrics.len(),
            points.len()
        );

        points
    }

    /// Shapes all categories of a snapshot, in the order of [`Category::ALL`].
    pub fn shape_snapshot(&self, snapshot: &RawMetricsSnapshot) -> Vec<DataPoint> {
        Category::ALL
            .into_iter()
            .map(|category| CategoryMetrics::from_snapshot(snapshot, category))
            .filter(|metrics| !metrics.is_empty())
            .flat_map(|metrics| self.shape(metrics))
            .collect()
    }

    fn parse_key(&self, category: Category, raw_key: &str) -> Option<ParsedKey> {
        match ParsedKey::parse(raw_key, self.config.key_format) {
            Ok(key) => Some(key),
            Err(error) => {
                tagflush_log::error!(
                    "dropping {} entry with malformed key {raw_key:?}: {}",
                    category.type_tag(),
                    LogError(&error)
                );
                None
            }
        }
    }

    fn metric_name(&self, category: Category, metric_name: &str) -> String {
        let prefix = Some(self.config.global_prefix.as_str());
        let namespace = self.config.namespaces.get(category);

        [prefix, namespace, Some(metric_name)]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn fallback_rate(&self, count: CounterType) -> CounterType {
        match self.config.flush_interval {
            0 => count,
            secs => count / secs as f64,
        }
    }
}

fn dimensions(mut tags: BTreeMap<String, String>, category: Category) -> BTreeMap<String, String> {
    tags.insert(TYPE_DIMENSION.to_owned(), category.type_tag().to_owned());
    tags
}

fn push_statistics(
    points: &mut Vec<DataPoint>,
    name: &str,
    statistics: &BTreeMap<String, TimerStatistic>,
    dimensions: &BTreeMap<String, String>,
) {
    for (statistic, value) in statistics {
        let metric = format!("{name}.{statistic}");
        match value {
            TimerStatistic::Value(value) => points.push(DataPoint {
                metric,
                value: *value,
                dimensions: dimensions.clone(),
            }),
            TimerStatistic::Nested(nested) => push_statistics(points, &metric, nested, dimensions),
        }
    }
}
