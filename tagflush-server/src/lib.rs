//! Backends receiving the metric snapshots of a statsd host.
//!
//! The host hands a [`RawMetricsSnapshot`](tagflush_metrics::RawMetricsSnapshot) to a [`Backend`]
//! once per flush interval. Two backends are available:
//!
//!  - [`SignalFxBackend`] shapes all metrics into tagged data points and posts them to the
//!    SignalFx datapoint API through a [`Transport`].
//!  - [`GraphiteBackend`] rewrites the keys into multi-dimensional Graphite names and forwards the
//!    snapshot to a [`SnapshotSink`].
//!
//! Use [`create_backend`] to construct the backend selected in the configuration.
#![warn(missing_docs)]

mod backend;
mod graphite;
mod http;
mod service;
mod signalfx;
mod transport;

pub use crate::backend::*;
pub use crate::graphite::*;
pub use crate::http::*;
pub use crate::service::*;
pub use crate::signalfx::*;
pub use crate::transport::*;
