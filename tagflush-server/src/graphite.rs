use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;
use tagflush_common::UnixTimestamp;
use tagflush_metrics::{RawMetricsSnapshot, remap_snapshot};

use crate::backend::{Backend, FlushError, FlushSummary};

/// A downstream flush handler receiving the remapped snapshots.
pub trait SnapshotSink: Send + Sync {
    /// Forwards a snapshot.
    fn forward(&self, timestamp: UnixTimestamp, snapshot: &RawMetricsSnapshot) -> io::Result<()>;
}

#[derive(Serialize)]
struct FlushRecord<'a> {
    timestamp: UnixTimestamp,
    metrics: &'a RawMetricsSnapshot,
}

/// Writes every forwarded snapshot as one line of JSON.
///
/// Lines have the form `{"timestamp": 1615889449, "metrics": {...}}`, which is the same format
/// the `run` command reads.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write> JsonLinesSink<W> {
    /// Creates a sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> SnapshotSink for JsonLinesSink<W> {
    fn forward(&self, timestamp: UnixTimestamp, snapshot: &RawMetricsSnapshot) -> io::Result<()> {
        let record = FlushRecord {
            timestamp,
            metrics: snapshot,
        };

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Rewrites metric keys into multi-dimensional Graphite names and forwards the snapshot.
///
/// See [`remap_snapshot`] for the transformation. Entries with malformed keys are dropped.
pub struct GraphiteBackend {
    sink: Box<dyn SnapshotSink>,
}

impl GraphiteBackend {
    /// Creates a backend forwarding to the given sink.
    pub fn new(sink: Box<dyn SnapshotSink>) -> Self {
        Self { sink }
    }
}

impl Backend for GraphiteBackend {
    fn name(&self) -> &'static str {
        "graphite"
    }

    fn flush(
        &self,
        timestamp: UnixTimestamp,
        snapshot: &RawMetricsSnapshot,
    ) -> Result<FlushSummary, FlushError> {
        tagflush_log::trace!("remapping snapshot of flush {timestamp}: {snapshot:?}");
        let remapped = remap_snapshot(snapshot);
        tagflush_log::trace!("remapped snapshot of flush {timestamp}: {remapped:?}");

        self.sink
            .forward(timestamp, &remapped)
            .map_err(FlushError::Forward)?;

        Ok(FlushSummary {
            timestamp,
            datapoints: remapped.len(),
        })
    }
}

impl std::fmt::Debug for GraphiteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphiteBackend").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl SnapshotSink for FailingSink {
        fn forward(&self, _: UnixTimestamp, _: &RawMetricsSnapshot) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_flush_remapped() {
        let buffer = SharedBuffer::default();
        let backend = GraphiteBackend::new(Box::new(JsonLinesSink::new(buffer.clone())));

        let snapshot: RawMetricsSnapshot = serde_json::from_str(
            r#"{
                "counters": {
                    "statsd.bad_lines_seen": 1,
                    "[[\"graphite_keys\", \"host;port\"], [\"host\", \"h1\"], [\"port\", \"p1\"], [\"metric_name\", \"m\"]]": 200,
                    "[[\"graphite_keys\", \"host;port\"], [\"host\", \"h1\"]]": 3
                },
                "pctThreshold": [90]
            }"#,
        )
        .unwrap();

        let summary = backend
            .flush(UnixTimestamp::from_secs(1615889449), &snapshot)
            .unwrap();
        assert_eq!(summary.datapoints, 2);

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        insta::assert_snapshot!(output.trim_end(), @r###"
        {"timestamp":1615889449,"metrics":{"counters":{"m.host.h1.port.p1":200.0,"statsd.bad_lines_seen":1.0},"gauges":{},"sets":{},"counter_rates":{},"timers":{},"timer_data":{},"pctThreshold":[90]}}
        "###);
    }

    #[test]
    fn test_forward_error() {
        let backend = GraphiteBackend::new(Box::new(FailingSink));
        let result = backend.flush(UnixTimestamp::from_secs(1), &RawMetricsSnapshot::default());
        assert!(matches!(result, Err(FlushError::Forward(_))));
    }

    #[test]
    fn test_status() {
        let backend = GraphiteBackend::new(Box::new(FailingSink));

        let mut reports = Vec::new();
        backend.status(&mut |message, name| reports.push((message.to_owned(), name.to_owned())));
        assert_eq!(
            reports,
            [("not yet implemented".to_owned(), "graphite".to_owned())]
        );
    }
}
