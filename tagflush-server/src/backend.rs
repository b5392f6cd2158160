use std::time::Duration;

use serde::Serialize;
use tagflush_common::UnixTimestamp;
use tagflush_metrics::RawMetricsSnapshot;

/// Message reported by backends that do not track any status.
pub const STATUS_NOT_IMPLEMENTED: &str = "not yet implemented";

/// An error returned by [`Backend::flush`].
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// A flush was requested while the previous one has not completed.
    #[error("flush requested while another flush is in progress")]
    AlreadyFlushing,
    /// The snapshot could not be forwarded.
    #[error("failed to forward the snapshot")]
    Forward(#[source] std::io::Error),
}

/// Outcome of a successful flush.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FlushSummary {
    /// The timestamp of the flush, as passed by the host.
    pub timestamp: UnixTimestamp,
    /// Number of data points or snapshot entries handed to the downstream.
    pub datapoints: usize,
}

/// A receiver of flushed metric snapshots.
///
/// The host calls [`flush`](Self::flush) once per flush interval and never concurrently. A
/// backend keeps no state between flushes.
pub trait Backend: Send + Sync {
    /// The name of this backend, used in logs and status reports.
    fn name(&self) -> &'static str;

    /// Forwards all metrics of the snapshot.
    ///
    /// Sending is fire-and-forget. Failures to deliver are logged, not returned.
    fn flush(
        &self,
        timestamp: UnixTimestamp,
        snapshot: &RawMetricsSnapshot,
    ) -> Result<FlushSummary, FlushError>;

    /// Reports the status of this backend as `(message, backend name)`.
    fn status(&self, reporter: &mut dyn FnMut(&str, &str)) {
        reporter(STATUS_NOT_IMPLEMENTED, self.name());
    }

    /// Waits up to `timeout` for pending sends to complete.
    fn shutdown(&self, _timeout: Duration) {}
}
