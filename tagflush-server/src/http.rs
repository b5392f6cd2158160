//! Delivery of data points to the SignalFx HTTP API.

use std::mem;
use std::sync::Mutex;
use std::time::Duration;

#[doc(inline)]
pub use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Request};
use tagflush_common::UnixTimestamp;
use tagflush_log::LogError;
use tagflush_metrics::DataPoint;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use url::Url;

use crate::transport::{DatapointPayload, Transport};

/// Header carrying the SignalFx API token.
const TOKEN_HEADER: &str = "X-SF-Token";

/// An error sending data points to SignalFx.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The API token cannot be used as a header value.
    #[error("invalid api token")]
    InvalidToken(#[from] reqwest::header::InvalidHeaderValue),
    /// The request could not be built or sent.
    #[error("could not send request")]
    Reqwest(#[from] reqwest::Error),
    /// The payload could not be serialized.
    #[error("failed to serialize payload")]
    Json(#[from] serde_json::Error),
    /// The API responded with an unsuccessful status code.
    #[error("request failed with status {status}: {body}")]
    Status {
        /// The status code of the response.
        status: StatusCode,
        /// The response body, if it could be read.
        body: String,
    },
}

/// A transport that posts data points to the SignalFx datapoint endpoint.
///
/// Every send is spawned onto the given runtime and returns immediately. Failed requests are
/// logged with the status and response body, they are never retried.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    token: HeaderValue,
    runtime: Handle,
    pending: Mutex<JoinSet<()>>,
}

impl HttpTransport {
    /// Creates a new transport posting to `endpoint`.
    pub fn new(
        endpoint: Url,
        token: &str,
        timeout: Duration,
        runtime: Handle,
    ) -> Result<Self, HttpError> {
        let mut token = HeaderValue::from_str(token)?;
        token.set_sensitive(true);

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            token,
            runtime,
            pending: Mutex::new(JoinSet::new()),
        })
    }

    /// Builds the request for a list of data points.
    pub fn build_request(&self, points: &[DataPoint]) -> Result<Request, HttpError> {
        let body = DatapointPayload::new(points).to_json()?;

        let request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(TOKEN_HEADER, self.token.clone())
            .body(body)
            .build()?;

        Ok(request)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        // A panicking send cannot leave the set in an inconsistent state.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for HttpTransport {
    fn send(&self, timestamp: UnixTimestamp, points: Vec<DataPoint>) {
        let request = match self.build_request(&points) {
            Ok(request) => request,
            Err(error) => {
                tagflush_log::error!(
                    "dropping {} datapoints of flush {timestamp}: {}",
                    points.len(),
                    LogError(&error)
                );
                return;
            }
        };

        tagflush_log::debug!(
            "sending {} datapoints of flush {timestamp} to {}",
            points.len(),
            self.endpoint
        );

        let client = self.client.clone();
        let count = points.len();

        let mut pending = self.pending();
        // Reap completed sends so the set does not grow across flushes.
        while pending.try_join_next().is_some() {}

        pending.spawn_on(
            async move {
                match execute(&client, request).await {
                    Ok(status) => tagflush_log::debug!(
                        "finished flush {timestamp} with {count} datapoints: {status}"
                    ),
                    Err(error) => tagflush_log::warn!(
                        "failed to send {count} datapoints of flush {timestamp}: {}",
                        LogError(&error)
                    ),
                }
            },
            &self.runtime,
        );
    }

    fn shutdown(&self, timeout: Duration) {
        let mut pending = mem::take(&mut *self.pending());
        if pending.is_empty() {
            return;
        }

        tagflush_log::info!("waiting for {} pending sends", pending.len());

        let drained = self.runtime.block_on(tokio::time::timeout(timeout, async {
            while pending.join_next().await.is_some() {}
        }));

        if drained.is_err() {
            tagflush_log::warn!("shutdown timed out, dropping {} pending sends", pending.len());
            pending.abort_all();
        }
    }
}

async fn execute(client: &Client, request: Request) -> Result<StatusCode, HttpError> {
    let response = client.execute(request).await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HttpError::Status { status, body });
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const ERROR_RESPONSE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
        content-type: text/plain\r\n\
        content-length: 13\r\n\
        connection: close\r\n\
        \r\n\
        ingest failed";

    fn points() -> Vec<DataPoint> {
        vec![DataPoint {
            metric: "sfx_test.this.is.my".to_owned(),
            value: 453.0,
            dimensions: BTreeMap::from([
                ("rifle".to_owned(), "gun".to_owned()),
                ("type".to_owned(), "gauge".to_owned()),
            ]),
        }]
    }

    /// Runtime with a worker thread, so spawned sends make progress during shutdown.
    fn worker_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };

        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        body.len() >= length
    }

    /// Answers every request with a 500 and counts the requests received.
    fn serve_errors(runtime: &tokio::runtime::Runtime) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        runtime.spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0; 1024];
                while !request_complete(&buf) {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }

                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(ERROR_RESPONSE).await;
                let _ = stream.shutdown().await;
            }
        });

        (addr, requests)
    }

    fn local_transport(runtime: &tokio::runtime::Runtime, addr: SocketAddr) -> HttpTransport {
        HttpTransport::new(
            format!("http://{addr}/v2/datapoint").parse().unwrap(),
            "sfxtoken",
            Duration::from_secs(5),
            runtime.handle().clone(),
        )
        .unwrap()
    }

    fn transport(runtime: &tokio::runtime::Runtime) -> HttpTransport {
        HttpTransport::new(
            "https://ingest.signalfx.com/v2/datapoint".parse().unwrap(),
            "sfxtoken",
            Duration::from_secs(5),
            runtime.handle().clone(),
        )
        .unwrap()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_request() {
        let runtime = runtime();
        let transport = transport(&runtime);

        let request = transport.build_request(&points()).unwrap();
        assert_eq!(request.method(), &reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://ingest.signalfx.com/v2/datapoint"
        );
        assert_eq!(request.headers()["content-type"], "application/json");
        assert_eq!(request.headers()["x-sf-token"], "sfxtoken");

        let body = request.body().and_then(|body| body.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        insta::assert_json_snapshot!(json, @r###"
        {
          "gauge": [
            {
              "dimensions": {
                "rifle": "gun",
                "type": "gauge"
              },
              "metric": "sfx_test.this.is.my",
              "value": 453.0
            }
          ]
        }
        "###);
    }

    #[test]
    fn test_invalid_token() {
        let runtime = runtime();
        let result = HttpTransport::new(
            "https://ingest.signalfx.com/v2/datapoint".parse().unwrap(),
            "bad\ntoken",
            Duration::from_secs(5),
            runtime.handle().clone(),
        );

        assert!(matches!(result, Err(HttpError::InvalidToken(_))));
    }

    #[test]
    fn test_shutdown_without_pending() {
        let runtime = runtime();
        let transport = transport(&runtime);
        transport.shutdown(Duration::from_millis(10));
    }

    #[test]
    fn test_status_error_display() {
        let error = HttpError::Status {
            status: StatusCode::UNAUTHORIZED,
            body: "invalid token".to_owned(),
        };

        assert_eq!(
            error.to_string(),
            "request failed with status 401 Unauthorized: invalid token"
        );
    }

    #[test]
    fn test_execute_error_status() {
        let runtime = worker_runtime();
        let (addr, requests) = serve_errors(&runtime);
        let transport = local_transport(&runtime, addr);

        let request = transport.build_request(&points()).unwrap();
        let error = runtime
            .block_on(execute(&transport.client, request))
            .unwrap_err();

        assert_eq!(
            error.to_string(),
            "request failed with status 500 Internal Server Error: ingest failed"
        );
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_error_status_not_retried() {
        tagflush_log::init_test!();

        let runtime = worker_runtime();
        let (addr, requests) = serve_errors(&runtime);
        let transport = local_transport(&runtime, addr);

        let start = Instant::now();
        transport.send(UnixTimestamp::from_secs(1), points());
        transport.send(UnixTimestamp::from_secs(2), points());
        transport.shutdown(Duration::from_secs(5));

        // Both sends completed before the shutdown deadline.
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_send_connection_refused() {
        tagflush_log::init_test!();

        let runtime = worker_runtime();
        let addr = {
            let listener = runtime
                .block_on(TcpListener::bind("127.0.0.1:0"))
                .unwrap();
            listener.local_addr().unwrap()
        };

        let transport = local_transport(&runtime, addr);
        let request = transport.build_request(&points()).unwrap();
        let result = runtime.block_on(execute(&transport.client, request));
        assert!(matches!(result, Err(HttpError::Reqwest(_))));

        let start = Instant::now();
        transport.send(UnixTimestamp::from_secs(1), points());
        transport.shutdown(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
