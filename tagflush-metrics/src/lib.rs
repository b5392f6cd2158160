//! Metric keys and data points of the tagflush backends.
//!
//! The statsd host hands a [`RawMetricsSnapshot`] to the backends on every flush. Its keys carry
//! more than a metric name: dimensions are encoded either inline as `name=value` segments or as a
//! JSON list of `[name, value]` tuples.
//!
//! # Key Formats
//!
//! Delimited keys are split on `.`. Segments containing a `=` become tags, all others form the
//! metric name:
//!
//! ```
//! use tagflush_metrics::{KeyFormat, ParsedKey};
//!
//! let key = ParsedKey::parse("api.requests.host=web1.total", KeyFormat::Delimited).unwrap();
//! assert_eq!(key.metric_name, "api.requests.total");
//! assert_eq!(key.tags["host"], "web1");
//! ```
//!
//! JSON-tuple keys carry the name in a reserved `metric_name` entry. An optional `graphite_keys`
//! entry lists the tags to project, separated by `;`:
//!
//! ```
//! use tagflush_metrics::{KeyFormat, ParsedKey};
//!
//! let raw = r#"[["graphite_keys", "host"], ["host", "web1"], ["metric_name", "latency"]]"#;
//! let key = ParsedKey::parse(raw, KeyFormat::MultiKey).unwrap();
//! assert_eq!(key.metric_name, "latency");
//! assert_eq!(key.tags["host"], "web1");
//! ```
//!
//! # Shaping
//!
//! The [`Shaper`] turns every category of a snapshot into flat [`DataPoint`]s. The multi-dimensional
//! Graphite backend instead rewrites the keys of the snapshot in place, see [`remap_snapshot`].
#![warn(missing_docs)]

mod key;
mod remap;
mod shape;
mod snapshot;

pub use self::key::*;
pub use self::remap::*;
pub use self::shape::*;
pub use self::snapshot::*;
