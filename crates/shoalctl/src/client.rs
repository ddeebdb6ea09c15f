//! Minimal HTTP/1 client for the shoald operator API.

use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use shoal_api::ApiResponse;

/// A decoded API reply.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: ApiResponse<Value>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn data(&self) -> &Value {
        self.body.data.as_ref().unwrap_or(&Value::Null)
    }

    pub fn error(&self) -> &str {
        self.body.error.as_deref().unwrap_or("request failed")
    }
}

pub struct ApiClient {
    /// `host:port` of the API listener.
    server: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(server: &str, timeout: Duration) -> Self {
        let server = server
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self { server, timeout }
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Reply> {
        self.send(Method::GET, path, None, self.timeout).await
    }

    /// GET with a caller-chosen deadline, for long polls.
    pub async fn get_with_timeout(&self, path: &str, timeout: Duration) -> anyhow::Result<Reply> {
        self.send(Method::GET, path, None, timeout).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<Reply> {
        let bytes = serde_json::to_vec(body)?;
        self.send(Method::POST, path, Some(bytes), self.timeout).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Reply> {
        self.send(Method::DELETE, path, None, self.timeout).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> anyhow::Result<Reply> {
        let uri = format!("http://{}{path}", self.server);
        debug!(%method, %uri, "api request");
        tokio::time::timeout(timeout, self.exchange(method, &uri, body))
            .await
            .map_err(|_| anyhow!("{uri}: timed out after {timeout:?}"))?
    }

    async fn exchange(&self, method: Method, uri: &str, body: Option<Vec<u8>>) -> anyhow::Result<Reply> {
        let stream = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("failed to connect to {}", self.server))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("HTTP handshake failed")?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", self.server.as_str())
            .header("user-agent", "shoalctl/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let resp = sender
            .send_request(req)
            .await
            .with_context(|| format!("{uri}: request failed"))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .with_context(|| format!("{uri}: failed to read body"))?
            .to_bytes();
        let body: ApiResponse<Value> = serde_json::from_slice(&bytes)
            .with_context(|| format!("{uri}: unexpected response ({status})"))?;
        Ok(Reply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Answers every request with `status` and an envelope echoing the method and path.
    async fn spawn_api(status: StatusCode) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| async move {
                        let summary = format!("{} {}", req.method(), req.uri().path());
                        let body = if status.is_success() {
                            serde_json::json!({ "success": true, "data": summary })
                        } else {
                            serde_json::json!({ "success": false, "error": summary })
                        };
                        let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
                        *resp.status_mut() = status;
                        Ok::<_, hyper::Error>(resp)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn decodes_success_envelope() {
        let addr = spawn_api(StatusCode::OK).await;
        let client = ApiClient::new(&format!("http://{addr}/"), Duration::from_secs(2));

        let reply = client.get("/api/v1/workloads").await.unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.data(), &Value::String("GET /api/v1/workloads".into()));
    }

    #[tokio::test]
    async fn decodes_error_envelope() {
        let addr = spawn_api(StatusCode::CONFLICT).await;
        let client = ApiClient::new(&addr.to_string(), Duration::from_secs(2));

        let reply = client.delete("/api/v1/workload/default/web").await.unwrap();
        assert_eq!(reply.status, StatusCode::CONFLICT);
        assert_eq!(reply.error(), "DELETE /api/v1/workload/default/web");
        assert_eq!(reply.data(), &Value::Null);
    }

    #[tokio::test]
    async fn connection_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ApiClient::new(&addr.to_string(), Duration::from_secs(2));
        assert!(client.get("/healthz").await.is_err());
    }
}
