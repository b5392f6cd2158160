use std::fs;
use std::io;

use tagflush_config::{BackendKind, Config, ConfigError};
use tokio::runtime::Handle;

use crate::backend::Backend;
use crate::graphite::{GraphiteBackend, JsonLinesSink, SnapshotSink};
use crate::http::{HttpError, HttpTransport};
use crate::signalfx::SignalFxBackend;
use crate::transport::{DryRunTransport, Transport};

/// Indicates the type of failure when creating a backend.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The configuration does not describe a usable backend.
    #[error("invalid backend configuration")]
    Config(#[from] ConfigError),
    /// Initializing the HTTP client failed.
    #[error("could not initialize http client")]
    Http(#[from] HttpError),
    /// The output of the Graphite backend cannot be opened.
    #[error("could not open graphite output")]
    Output(#[from] io::Error),
}

/// Creates the backend selected in the configuration.
///
/// HTTP requests of the SignalFx backend are spawned onto `runtime`.
pub fn create_backend(config: &Config, runtime: &Handle) -> Result<Box<dyn Backend>, ServiceError> {
    match config.backend() {
        BackendKind::SignalFx => {
            let transport: Box<dyn Transport> = if config.dry_run() {
                tagflush_log::info!("dry-run mode enabled, payloads are logged instead of sent");
                Box::new(DryRunTransport)
            } else {
                config.validate()?;
                let endpoint = config.signalfx_endpoint()?;
                let token = config.signalfx_token().unwrap_or_default();
                tagflush_log::info!("sending datapoints to {endpoint}");

                Box::new(HttpTransport::new(
                    endpoint,
                    token,
                    config.http_timeout(),
                    runtime.clone(),
                )?)
            };

            let shape_config = config.shape_config().clone();
            Ok(Box::new(SignalFxBackend::new(shape_config, transport)))
        }
        BackendKind::Graphite => {
            let sink: Box<dyn SnapshotSink> = match config.graphite_output() {
                Some(path) => {
                    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
                    tagflush_log::info!("writing remapped snapshots to {}", path.display());
                    Box::new(JsonLinesSink::new(file))
                }
                None => Box::new(JsonLinesSink::new(io::stdout())),
            };

            Ok(Box::new(GraphiteBackend::new(sink)))
        }
    }
}

#[cfg(test)]
mod tests {
    use tagflush_common::UnixTimestamp;
    use tagflush_metrics::RawMetricsSnapshot;

    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_signalfx() {
        let runtime = runtime();
        let config = Config::from_json_value(serde_json::json!({
            "signalfx": {"host": "ingest.signalfx.com", "token": "abc"}
        }))
        .unwrap();

        let backend = create_backend(&config, runtime.handle()).unwrap();
        assert_eq!(backend.name(), "signalfx");
    }

    #[test]
    fn test_create_signalfx_missing_host() {
        let runtime = runtime();
        let config = Config::from_json_value(serde_json::json!({
            "signalfx": {"token": "abc"}
        }))
        .unwrap();

        let result = create_backend(&config, runtime.handle());
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[test]
    fn test_create_dry_run() {
        tagflush_log::init_test!();
        let runtime = runtime();
        let config = Config::from_json_value(serde_json::json!({
            "signalfx": {"dry_run": true}
        }))
        .unwrap();

        let backend = create_backend(&config, runtime.handle()).unwrap();
        let snapshot: RawMetricsSnapshot =
            serde_json::from_str(r#"{"gauges": {"queue.depth": 7}}"#).unwrap();

        let summary = backend
            .flush(UnixTimestamp::from_secs(10), &snapshot)
            .unwrap();
        assert_eq!(summary.datapoints, 1);
    }

    #[test]
    fn test_create_graphite_file() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("graphite.jsonl");

        let config = Config::from_json_value(serde_json::json!({
            "backend": "graphite",
            "graphite": {"output": output}
        }))
        .unwrap();

        let backend = create_backend(&config, runtime.handle()).unwrap();
        assert_eq!(backend.name(), "graphite");

        backend
            .flush(UnixTimestamp::from_secs(10), &RawMetricsSnapshot::default())
            .unwrap();

        let contents = fs::read_to_string(&output).unwrap();
        assert!(contents.starts_with(r#"{"timestamp":10,"metrics":{"#));
        assert!(contents.ends_with('\n'));
    }
}
