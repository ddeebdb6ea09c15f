//! HTTP forwarding proxy.
//!
//! `ProxyServer` accepts external requests, dispatches them through the
//! ingress layer, and forwards each to the leased endpoint over a fresh
//! HTTP/1.1 connection. Routing failures map to 404 / 503; upstream
//! failures to 502 (504 on timeout).
//!
//! The endpoint lease rides along with the upstream response body, so an
//! instance counts as busy until its response has been fully relayed.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::header::{HOST, HeaderValue};
use http::{StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::ingress::Ingress;
use crate::router::Lease;

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Ingress-facing HTTP server.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    ingress: Arc<Ingress>,
    upstream_timeout: Duration,
}

impl ProxyServer {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        ingress: Arc<Ingress>,
        upstream_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind proxy listener")?;
        let local_addr = listener.local_addr().context("proxy local addr")?;
        Ok(Self {
            listener,
            local_addr,
            ingress,
            upstream_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown signal fires. One task per connection.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "proxy listening");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    let (stream, peer_addr) = match accept_result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "proxy accept failed");
                            continue;
                        }
                    };
                    let ingress = self.ingress.clone();
                    let timeout = self.upstream_timeout;

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let ingress = ingress.clone();
                            async move {
                                Ok::<_, hyper::Error>(forward(&ingress, req, peer_addr, timeout).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, svc)
                            .await
                        {
                            debug!(%peer_addr, error = %e, "proxy connection closed with error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("proxy shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn forward(
    ingress: &Ingress,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    timeout: Duration,
) -> Response<ProxyBody> {
    let host = request_host(&req);
    let path = req.uri().path().to_string();

    let lease = match ingress.route(&host, &path) {
        Ok(lease) => lease,
        Err(e) => {
            debug!(%host, %path, error = %e, "request not routed");
            return text_response(e.status_code(), &e.to_string());
        }
    };
    let endpoint = lease.endpoint().clone();

    let result = tokio::time::timeout(timeout, send_upstream(&endpoint.address, req, peer_addr)).await;

    match result {
        Ok(Ok(resp)) => resp.map(|body| LeasedBody::new(body, lease).boxed_unsync()),
        Ok(Err(e)) => {
            warn!(instance = %endpoint.instance_id, error = %e, "upstream request failed");
            text_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
        Err(_) => {
            warn!(instance = %endpoint.instance_id, ?timeout, "upstream request timed out");
            text_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out")
        }
    }
}

/// A response body that holds its endpoint lease until the last frame
/// has been read or the body is dropped.
struct LeasedBody<B> {
    inner: B,
    lease: Option<Lease>,
}

impl<B> LeasedBody<B> {
    fn new(inner: B, lease: Lease) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }
}

impl<B> Body for LeasedBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.lease.take();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

async fn send_upstream(
    address: &str,
    mut req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> anyhow::Result<Response<Incoming>> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("connect to {address}"))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("upstream handshake")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!(error = %e, "upstream connection error");
        }
    });

    // Upstreams get origin-form URIs.
    let origin: Uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .context("rewrite request uri")?;
    *req.uri_mut() = origin;
    req.headers_mut().insert(
        "x-forwarded-for",
        HeaderValue::from_str(&peer_addr.ip().to_string()).context("forwarded-for header")?,
    );

    sender.send_request(req).await.context("upstream send")
}

fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalanceStrategy;
    use crate::registry::EndpointRegistry;
    use crate::router::ServiceRouter;
    use http_body_util::Empty;
    use shoal_state::Route;

    /// Upstream that answers with its own tag and the request path.
    async fn spawn_upstream(tag: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| async move {
                        let body = format!("{tag} {}", req.uri().path());
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    async fn get(proxy: SocketAddr, host: &str, path: &str) -> (StatusCode, String) {
        let stream = TcpStream::connect(proxy).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);
        let req = Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn start_proxy(registry: EndpointRegistry) -> (SocketAddr, tokio::sync::watch::Sender<bool>) {
        let router = Arc::new(ServiceRouter::new(registry, BalanceStrategy::RoundRobin));
        let ingress = Arc::new(Ingress::new(router));
        ingress.reload(&[Route {
            namespace: "default".into(),
            name: "web".into(),
            host_pattern: "web.local".into(),
            path_prefix: "/".into(),
            target_workload: "web".into(),
        }]);
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), ingress, Duration::from_secs(2))
            .await
            .unwrap();
        let addr = server.local_addr();
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(server.serve(rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn forwards_to_healthy_endpoint() {
        let upstream = spawn_upstream("a").await;
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", &upstream.to_string());

        let (proxy, _shutdown) = start_proxy(registry).await;
        let (status, body) = get(proxy, "web.local", "/hello?x=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "a /hello");
    }

    #[tokio::test]
    async fn lease_is_held_until_body_is_read() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        let router = ServiceRouter::new(registry.clone(), BalanceStrategy::RoundRobin);

        let lease = router.route("default/web").unwrap();
        let body = LeasedBody::new(Full::new(Bytes::from_static(b"streamed")), lease);
        assert_eq!(registry.inflight("web-0.default"), 1);

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"streamed");
        assert_eq!(registry.inflight("web-0.default"), 0);
    }

    #[tokio::test]
    async fn unread_body_releases_lease_on_drop() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:9000");
        let router = ServiceRouter::new(registry.clone(), BalanceStrategy::LeastConnections);

        let body = LeasedBody::new(Empty::<Bytes>::new(), router.route("default/web").unwrap());
        assert_eq!(registry.inflight("web-0.default"), 1);
        drop(body);
        assert_eq!(registry.inflight("web-0.default"), 0);
    }

    #[tokio::test]
    async fn forwarded_request_leaves_nothing_in_flight() {
        let upstream = spawn_upstream("a").await;
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", &upstream.to_string());

        let (proxy, _shutdown) = start_proxy(registry.clone()).await;
        let (status, _) = get(proxy, "web.local", "/").await;
        assert_eq!(status, StatusCode::OK);
        // The proxy drops the body after the last frame is written.
        assert!(registry.drain("web-0.default", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn unknown_host_is_404() {
        let (proxy, _shutdown) = start_proxy(EndpointRegistry::new()).await;
        let (status, _) = get(proxy, "nope.local", "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn no_healthy_endpoint_is_503() {
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", "127.0.0.1:1");
        registry.mark_unhealthy("web-0.default");

        let (proxy, _shutdown) = start_proxy(registry).await;
        let (status, _) = get(proxy, "web.local", "/").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn dead_upstream_is_502() {
        // Bind then drop to get a port nothing listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let registry = EndpointRegistry::new();
        registry.register("default/web", "web-0.default", &dead.to_string());

        let (proxy, _shutdown) = start_proxy(registry).await;
        let (status, _) = get(proxy, "web.local", "/").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn serves_and_shuts_down() {
        let router = Arc::new(ServiceRouter::new(EndpointRegistry::new(), BalanceStrategy::RoundRobin));
        let server = ProxyServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Ingress::new(router)),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(server.serve(rx));
        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
