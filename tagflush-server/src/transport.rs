use std::time::Duration;

use serde::Serialize;
use tagflush_common::UnixTimestamp;
use tagflush_metrics::DataPoint;

/// Request body of the SignalFx datapoint API.
///
/// All data points are reported as gauges, their category is carried in the `type` dimension.
#[derive(Debug, Serialize)]
pub struct DatapointPayload<'a> {
    /// The data points to send.
    pub gauge: &'a [DataPoint],
}

impl<'a> DatapointPayload<'a> {
    /// Wraps a list of data points.
    pub fn new(points: &'a [DataPoint]) -> Self {
        Self { gauge: points }
    }

    /// Serializes the payload to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Delivers the data points of a flush.
///
/// Implementations must not block on the network. Delivery failures are logged by the transport
/// and never reported back to the caller.
pub trait Transport: Send + Sync {
    /// Hands off the data points of one flush for delivery.
    fn send(&self, timestamp: UnixTimestamp, points: Vec<DataPoint>);

    /// Waits up to `timeout` for pending deliveries to complete.
    fn shutdown(&self, _timeout: Duration) {}
}

/// A transport that logs payloads instead of sending them.
#[derive(Debug, Default)]
pub struct DryRunTransport;

impl Transport for DryRunTransport {
    fn send(&self, timestamp: UnixTimestamp, points: Vec<DataPoint>) {
        match DatapointPayload::new(&points).to_json() {
            Ok(json) => tagflush_log::info!(
                "not sending {} datapoints of flush {timestamp} in dry-run mode: {}",
                points.len(),
                String::from_utf8_lossy(&json)
            ),
            Err(error) => tagflush_log::error!(
                "failed to serialize payload: {}",
                tagflush_log::LogError(&error)
            ),
        }
    }
}
