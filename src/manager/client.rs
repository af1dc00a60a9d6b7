//! HTTP client for one builder.
//!
//! Connection-level failures (refused, reset, aborted) are retried after
//! `retry_interval` without limit; the caller's step deadline bounds the
//! loop. This covers the window between builder launch and socket
//! readiness.

use std::error::Error as _;
use std::io::ErrorKind;
use std::time::Duration;

use reqwest::header::ACCEPT_ENCODING;
use reqwest::{Method, Response};
use tracing::debug;

use crate::errors::ManagerError;

#[derive(Debug, Clone)]
pub struct BuilderClient {
    http: reqwest::Client,
    base_url: String,
    retry_interval: Duration,
}

impl BuilderClient {
    pub fn new(base_url: impl Into<String>, retry_interval: Duration) -> Result<Self, ManagerError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(ManagerError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            retry_interval,
        })
    }

    /// Send one request, retrying transient connection failures.
    ///
    /// Compression is refused: large exports intermittently truncate when
    /// the response is encoded.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<Response, ManagerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(ACCEPT_ENCODING, "identity");
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.body(body.to_vec());
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if is_transient(&e) => {
                    debug!(%method, %url, attempt, error = %e, "builder not reachable, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(ManagerError::Transport(e)),
            }
        }
    }
}

/// Connection refused, reset, or aborted anywhere in the error chain.
///
/// Name resolution and routing failures are not transient.
pub fn is_transient(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            );
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use tokio::net::TcpListener;

    async fn free_addr() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_send_retries_until_builder_listens() {
        let addr = free_addr().await;
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let app = Router::new().route("/claim", post(|| async { "done" }));
            axum::serve(listener, app).await.unwrap();
        });

        let client = BuilderClient::new(format!("http://{}", addr), Duration::from_millis(50)).unwrap();
        let response = tokio::time::timeout(
            Duration::from_secs(10),
            client.send(Method::POST, "/claim", &[], None),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "done");
        server.abort();
    }

    #[tokio::test]
    async fn test_send_refuses_compression_and_escapes_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/export",
            get(|headers: HeaderMap, uri: axum::http::Uri| async move {
                let encoding = headers
                    .get("accept-encoding")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                format!("{}|{}", encoding, uri.query().unwrap_or_default())
            }),
        );
        let server = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = BuilderClient::new(format!("http://{}", addr), Duration::from_millis(50)).unwrap();
        let response = client
            .send(Method::GET, "/export", &[("path", "p1/image 1.raw")], None)
            .await
            .unwrap();
        let body = response.text().await.unwrap();

        let (encoding, query) = body.split_once('|').unwrap();
        assert_eq!(encoding, "identity");
        assert!(query.starts_with("path=p1%2Fimage"), "{}", query);
        server.abort();
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails_without_retrying() {
        let client =
            BuilderClient::new("http://no-such-builder.invalid:3333", Duration::from_millis(50)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(20),
            client.send(Method::POST, "/claim", &[], None),
        )
        .await
        .expect("resolution failure was retried");

        match result {
            Err(ManagerError::Transport(e)) => assert!(!is_transient(&e), "{}", e),
            other => panic!("expected a transport error, got {:?}", other.map(|r| r.status())),
        }
    }

    #[tokio::test]
    async fn test_send_reports_non_transient_failure() {
        let client = BuilderClient::new("http://[::1", Duration::from_millis(10)).unwrap();
        let result = client.send(Method::GET, "/progress", &[], None).await;
        assert!(matches!(result, Err(ManagerError::Transport(_))));
    }
}
