use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tagflush_common::UnixTimestamp;
use tagflush_metrics::{RawMetricsSnapshot, ShapeConfig, Shaper};

use crate::backend::{Backend, FlushError, FlushSummary};
use crate::transport::Transport;

/// Sends all metrics of a snapshot as tagged data points to SignalFx.
///
/// Every flush shapes the categories in the order of
/// [`Category::ALL`](tagflush_metrics::Category::ALL), concatenates the data points and hands them
/// to the [`Transport`] in a single call.
pub struct SignalFxBackend {
    shaper: Shaper,
    transport: Box<dyn Transport>,
    flushing: AtomicBool,
}

impl SignalFxBackend {
    /// Creates a new backend sending through the given transport.
    pub fn new(config: ShapeConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            shaper: Shaper::new(config),
            transport,
            flushing: AtomicBool::new(false),
        }
    }

    fn flush_points(
        &self,
        timestamp: UnixTimestamp,
        snapshot: &RawMetricsSnapshot,
    ) -> FlushSummary {
        tagflush_log::debug!("starting flush {timestamp}");

        let points = self.shaper.shape_snapshot(snapshot);
        let datapoints = points.len();
        if points.is_empty() {
            tagflush_log::debug!("skipping flush {timestamp} without datapoints");
        } else {
            self.transport.send(timestamp, points);
        }

        FlushSummary {
            timestamp,
            datapoints,
        }
    }
}

/// Marks a flush as in progress until dropped, also when the flush unwinds.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flushing: &'a AtomicBool) -> Option<Self> {
        match flushing.swap(true, Ordering::AcqRel) {
            true => None,
            false => Some(Self(flushing)),
        }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Backend for SignalFxBackend {
    fn name(&self) -> &'static str {
        "signalfx"
    }

    fn flush(
        &self,
        timestamp: UnixTimestamp,
        snapshot: &RawMetricsSnapshot,
    ) -> Result<FlushSummary, FlushError> {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            tagflush_log::error!("rejecting flush {timestamp}, previous flush still in progress");
            return Err(FlushError::AlreadyFlushing);
        };

        Ok(self.flush_points(timestamp, snapshot))
    }

    fn shutdown(&self, timeout: Duration) {
        self.transport.shutdown(timeout);
    }
}

impl std::fmt::Debug for SignalFxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalFxBackend")
            .field("shaper", &self.shaper)
            .field("flushing", &self.flushing)
            .finish_non_exhaustive()
    }
}
