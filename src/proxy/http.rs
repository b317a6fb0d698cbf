//! HTTP reverse proxying over a sniffed stream.
//!
//! Each classified connection gets exactly one server-side exchange:
//! the sniffed prefix plus the rest of the socket are served through a
//! single hyper http1 connection, the request is rewritten onto the
//! configured upstream, and the response is relayed back. Upgrade
//! (101) responses switch the connection to a transparent byte relay
//! with no further HTTP timeout.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::time::timeout;

use crate::config::schema::HttpUpstream;
use crate::error::GatewayError;
use crate::net::sniffer::SniffedStream;
use crate::observability::metrics;
use crate::policy::{DenyReason, PolicyEngine};

/// Server-side read/write bound, independent of the upstream timeout.
const HTTP_IO_TIMEOUT: Duration = Duration::from_secs(30);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers never forwarded by a proxy.
const HOP_BY_HOP: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const TRACE_CONTEXT: [header::HeaderName; 2] = [
    header::HeaderName::from_static("traceparent"),
    header::HeaderName::from_static("tracestate"),
];

pub struct HttpProxy {
    scheme: Scheme,
    authority: Authority,
    host_header: HeaderValue,
    request_timeout: Duration,
    client: Client<HttpConnector, Incoming>,
    policy: Arc<PolicyEngine>,
    gateway_id: HeaderValue,
}

impl HttpProxy {
    pub fn new(
        upstream: &HttpUpstream,
        policy: Arc<PolicyEngine>,
        gateway_id: &str,
    ) -> Result<Self, GatewayError> {
        let uri: Uri = upstream
            .target_url
            .parse()
            .map_err(|_| GatewayError::InvalidUpstream(upstream.target_url.clone()))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| GatewayError::InvalidUpstream(upstream.target_url.clone()))?;
        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|_| GatewayError::InvalidUpstream(upstream.target_url.clone()))?;
        let gateway_id = HeaderValue::from_str(gateway_id)
            .map_err(|_| GatewayError::InvalidUpstream(gateway_id.to_string()))?;

        Ok(Self {
            scheme,
            authority,
            host_header,
            request_timeout: upstream.timeout,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            policy,
            gateway_id,
        })
    }

    pub fn upstream_label(&self) -> &str {
        self.authority.as_str()
    }

    /// Serve one HTTP exchange (or upgrade) from the sniffed stream.
    pub async fn serve(self: Arc<Self>, stream: SniffedStream, remote: SocketAddr) {
        let io = TokioIo::new(stream);
        let proxy = self.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, remote).await) }
        });

        let result = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HTTP_IO_TIMEOUT)
            .serve_connection(io, service)
            .with_upgrades()
            .await;
        if let Err(e) = result {
            tracing::debug!(remote = %remote, error = %e, "HTTP connection ended with error");
        }
    }

    async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let mut response = self.handle_inner(req, remote).await;
        // One exchange per sniffed connection: anything that is not an
        // upgrade tells the server connection to close afterwards.
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }

    async fn handle_inner(
        &self,
        mut req: Request<Incoming>,
        remote: SocketAddr,
    ) -> Response<ProxyBody> {
        let started = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        if let Err(reason) = self
            .policy
            .authorize_http(&req)
            .and_then(|()| self.policy.apply_waf(&req, remote.ip()))
        {
            let status = reason.http_status();
            tracing::warn!(remote = %remote, %method, %path, reason = %reason, "Request denied");
            self.policy
                .audit_http(remote, &method, &path, status.as_u16(), started.elapsed(), Some(&reason));
            metrics::record_http_request(&method, status.as_u16(), self.upstream_label(), started);
            return self.decorate(deny_response(status, &reason), &req);
        }

        // Taken before forwarding so a 101 can hand the client side to
        // the relay task.
        let client_upgrade = hyper::upgrade::on(&mut req);
        let upgrade_header = req.headers().get(header::UPGRADE).cloned();

        let outbound = match self.rewrite(req, remote, upgrade_header) {
            Ok(outbound) => outbound,
            Err(response) => return response,
        };
        let trace_headers: Vec<(header::HeaderName, HeaderValue)> = TRACE_CONTEXT
            .iter()
            .filter_map(|name| {
                outbound
                    .headers()
                    .get(name)
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();

        let mut response = match timeout(self.request_timeout, self.client.request(outbound)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(remote = %remote, upstream = %self.authority, error = %e, "Upstream request failed");
                if e.is_connect() {
                    metrics::record_upstream_dial_failure(self.upstream_label());
                }
                let status = StatusCode::BAD_GATEWAY;
                self.policy
                    .audit_http(remote, &method, &path, status.as_u16(), started.elapsed(), None);
                metrics::record_http_request(&method, status.as_u16(), self.upstream_label(), started);
                return text_response(status, "upstream request failed\n");
            }
            Err(_) => {
                tracing::warn!(remote = %remote, upstream = %self.authority, "Upstream request timed out");
                let status = StatusCode::GATEWAY_TIMEOUT;
                self.policy
                    .audit_http(remote, &method, &path, status.as_u16(), started.elapsed(), None);
                metrics::record_http_request(&method, status.as_u16(), self.upstream_label(), started);
                return text_response(status, "upstream timeout\n");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(relay_upgraded(client_upgrade, upstream_upgrade));
            tracing::debug!(remote = %remote, "Upgrade accepted, relaying bytes");
        }

        let status = response.status().as_u16();
        self.policy
            .audit_http(remote, &method, &path, status, started.elapsed(), None);
        metrics::record_http_request(&method, status, self.upstream_label(), started);

        let mut response = response.map(|body| body.boxed());
        for (name, value) in trace_headers {
            if !response.headers().contains_key(&name) {
                response.headers_mut().insert(name, value);
            }
        }
        response
            .headers_mut()
            .insert("x-gateway-id", self.gateway_id.clone());
        response
    }

    /// Rewrite the inbound request onto the upstream authority.
    fn rewrite(
        &self,
        mut req: Request<Incoming>,
        remote: SocketAddr,
        upgrade_header: Option<HeaderValue>,
    ) -> Result<Request<Incoming>, Response<ProxyBody>> {
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        let uri = Uri::from_parts(parts).map_err(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "URI rewrite failed\n")
        })?;
        *req.uri_mut() = uri;

        let headers = req.headers_mut();
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }
        // Upgrades survive the hop-by-hop strip: the intent must reach
        // the upstream for the 101 handshake to happen at all.
        if let Some(upgrade) = upgrade_header {
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::UPGRADE, upgrade);
        }
        headers.insert(header::HOST, self.host_header.clone());
        headers.insert("x-gateway-id", self.gateway_id.clone());
        if let Ok(forwarded) = HeaderValue::from_str(&remote.ip().to_string()) {
            headers.append("x-forwarded-for", forwarded);
        }

        Ok(req)
    }

    fn decorate(&self, mut response: Response<ProxyBody>, req: &Request<Incoming>) -> Response<ProxyBody> {
        response
            .headers_mut()
            .insert("x-gateway-id", self.gateway_id.clone());
        for name in &TRACE_CONTEXT {
            if let Some(value) = req.headers().get(name) {
                response.headers_mut().insert(name.clone(), value.clone());
            }
        }
        response
    }
}

/// Transparent byte relay for an upgraded exchange. Runs until either
/// side closes; the HTTP timeouts no longer apply here.
async fn relay_upgraded(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Upgrade completion failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => {
            tracing::debug!(bytes_up = up, bytes_down = down, "Upgrade relay closed");
        }
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) => {}
        Err(e) => tracing::debug!(error = %e, "Upgrade relay errored"),
    }
}

fn deny_response(status: StatusCode, reason: &DenyReason) -> Response<ProxyBody> {
    let body = match status {
        StatusCode::FORBIDDEN => format!("blocked by WAF: {}\n", reason),
        StatusCode::UNAUTHORIZED => format!("unauthorized: {}\n", reason),
        _ => format!("{}\n", reason),
    };
    text_response(status, body)
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}
