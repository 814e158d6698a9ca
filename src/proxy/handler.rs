//! Relay engine: per-request routing, rewriting and streaming
//!
//! Services one inbound request end to end. Plain requests are forwarded over
//! an HTTP/1.1 client connection (directly to the origin or through the
//! configured upstream proxy); CONNECT requests become raw byte tunnels. Both
//! modes share the outbound transport, header handling and byte accounting.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{CONTENT_TYPE, HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::error::{reason_phrase, Result, ViaductError};
use crate::models::{RelayOutcome, RelayRecord, UpstreamProxy};
use crate::proxy::counters::{ByteCount, ByteCounters, CountingStream, ServerStats};
use crate::proxy::headers::{self, HeaderTransform};
use crate::proxy::transport::{self, ConnectOptions, DnsResolve, IpFamily, ProxyConnection};
use crate::proxy::tunnel::{EstablishedTunnel, TunnelHandler};

/// Body type returned to the client for every relay
pub type RelayBody = BoxBody<Bytes, hyper::Error>;

const DEFAULT_UPSTREAM_AUTH_MESSAGE: &str = "Failed to authenticate upstream proxy";

/// Immutable per-request routing configuration, produced by the
/// request-preparation hook and consumed read-only by the engine.
#[derive(Clone, Default)]
pub struct HandlerConfig {
    /// Upstream proxy to route through; direct to the origin when absent
    pub upstream: Option<UpstreamProxy>,
    /// Local address to bind the outbound socket to
    pub bind_address: Option<IpAddr>,
    /// Restrict outbound addresses to one family
    pub ip_family: Option<IpFamily>,
    /// Custom DNS lookup for outbound hosts
    pub dns_resolver: Option<Arc<dyn DnsResolve>>,
    /// Header transform for the plain HTTP leg
    pub http_headers_hook: Option<HeaderTransform>,
    /// Header transform for the CONNECT/tunnel leg
    pub connect_headers_hook: Option<HeaderTransform>,
    /// Client-visible message when the upstream demands authentication
    pub upstream_auth_message: Option<String>,
}

impl HandlerConfig {
    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            bind_address: self.bind_address,
            ip_family: self.ip_family,
            resolver: self.dns_resolver.clone(),
        }
    }
}

/// Configuration for the relay handler
#[derive(Debug, Clone)]
pub struct RelayHandlerConfig {
    /// Timeout covering outbound connect, TLS and chaining handshakes
    pub connect_timeout: Duration,
}

impl Default for RelayHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Relay request handler
pub struct RelayHandler {
    config: RelayHandlerConfig,
    record_tx: Option<broadcast::Sender<RelayRecord>>,
    stats: Arc<ServerStats>,
}

impl RelayHandler {
    pub fn new(
        config: RelayHandlerConfig,
        record_tx: Option<broadcast::Sender<RelayRecord>>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            config,
            record_tx,
            stats,
        }
    }

    /// Handle one inbound request or CONNECT.
    ///
    /// Always resolves to a response: failures before any response bytes were
    /// written map to a client status per the error table, so the client is
    /// never left hanging. Once a response has been returned, later stream
    /// errors terminate the relay without a second response.
    #[instrument(skip(self, req, cfg), fields(method = %req.method(), uri = %req.uri(), client = %client_ip))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        cfg: HandlerConfig,
        client_ip: String,
    ) -> Response<RelayBody> {
        let started = Instant::now();
        let method = req.method().clone();
        let target_label = req.uri().to_string();
        let via_proxy = cfg.upstream.is_some();
        let counters = Arc::new(ByteCounters::default());

        let result = if method == Method::CONNECT {
            self.stats.inc_tunnels();
            self.handle_connect(req, &cfg, counters.clone(), started)
                .await
        } else {
            self.stats.inc_relays();
            self.handle_http(req, &cfg, counters.clone(), started).await
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                let status = e.client_status(via_proxy);
                let message = match &e {
                    ViaductError::UpstreamAuthRequired => cfg
                        .upstream_auth_message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_UPSTREAM_AUTH_MESSAGE.to_string()),
                    _ => reason_phrase(status).to_string(),
                };

                warn!(status = %status, error = %e, "relay failed before response");
                self.stats.inc_failures();

                let count = counters.snapshot();
                emit_record(
                    &self.record_tx,
                    &self.stats,
                    RelayRecord {
                        method: method.to_string(),
                        target: target_label,
                        upstream: cfg.upstream.as_ref().map(|u| u.redacted()),
                        outcome: RelayOutcome::Failed,
                        status_code: status.as_u16(),
                        error_message: Some(e.to_string()),
                        bytes_sent: count.sent,
                        bytes_received: count.received,
                        duration_ms: started.elapsed().as_millis() as i64,
                        timestamp: Utc::now(),
                    },
                );

                error_response(status, &message)
            }
        }
    }

    /// Forward one plain HTTP request and stream the response back.
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        cfg: &HandlerConfig,
        counters: Arc<ByteCounters>,
        started: Instant,
    ) -> Result<Response<RelayBody>> {
        let target_label = req.uri().to_string();
        let (parts, body) = req.into_parts();

        let (target_host, target_port, target_tls) = request_target(&parts)?;
        let upstream = cfg.upstream.as_ref();
        let via_http_upstream = matches!(upstream, Some(u) if u.is_http());

        // Absolute-URI form through an HTTP upstream, origin-form otherwise.
        let outbound_uri = outbound_uri(&parts, via_http_upstream)?;

        // Raw headers -> optional hook -> sanitizer. The hook returns the
        // full replacement sequence.
        let raw = headers::collect_pairs(&parts.headers);
        let transformed = headers::apply_transform(raw, cfg.http_headers_hook.as_ref());
        let pairs = headers::sanitize_headers(transformed);

        // Credentials belong on the HTTP-upstream leg only; an encoding
        // failure aborts before any outbound connection is attempted.
        let auth = match upstream {
            Some(u) if u.is_http() => headers::proxy_authorization(u)?,
            _ => None,
        };

        let opts = cfg.connect_options();
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            open_outbound(
                upstream,
                &target_host,
                target_port,
                target_tls,
                &opts,
                counters.clone(),
            ),
        )
        .await
        .map_err(|_| ViaductError::Timeout)??;

        // Tolerant response parsing so non-conformant upstreams do not abort
        // the relay outright.
        let io = TokioIo::new(stream);
        let mut client = hyper::client::conn::http1::Builder::new();
        client
            .preserve_header_case(true)
            .title_case_headers(true)
            .allow_spaces_after_header_name_in_responses(true)
            .allow_obsolete_multiline_headers_in_responses(true)
            .ignore_invalid_headers_in_responses(true);
        let (mut sender, conn) = client.handshake(io).await.map_err(ViaductError::from_hyper)?;

        // The connection task pumps both directions; when it winds down the
        // relay is complete and the final byte counts are known.
        let (template_tx, template_rx) = oneshot::channel::<RelayRecord>();
        let record_tx = self.record_tx.clone();
        let stats = self.stats.clone();
        let conn_counters = counters.clone();
        tokio::spawn(async move {
            let conn_result = conn.await;
            if let Ok(mut record) = template_rx.await {
                let count = conn_counters.snapshot();
                record.bytes_sent = count.sent;
                record.bytes_received = count.received;
                record.duration_ms = started.elapsed().as_millis() as i64;
                if let Err(e) = conn_result {
                    record.outcome = RelayOutcome::Interrupted;
                    record.error_message = Some(e.to_string());
                }
                emit_record(&record_tx, &stats, record);
            }
        });

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(outbound_uri);
        for (name, value) in &pairs {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &auth {
            builder = builder.header(PROXY_AUTHORIZATION, auth.as_str());
        }
        let outbound = builder
            .body(body)
            .map_err(|e| ViaductError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let response = sender
            .send_request(outbound)
            .await
            .map_err(ViaductError::from_hyper)?;

        // An outbound side demanding proxy authentication is a relay failure,
        // not a response to pass through; its body is never relayed.
        if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(ViaductError::UpstreamAuthRequired);
        }

        let (resp_parts, resp_body) = response.into_parts();
        let status = clamp_status(resp_parts.status.as_u16());
        let resp_pairs = headers::sanitize_headers(headers::collect_pairs(&resp_parts.headers));

        let mut builder = Response::builder().status(status);
        for (name, value) in &resp_pairs {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let client_response = builder
            .body(resp_body.boxed())
            .map_err(|e| ViaductError::Http(e.to_string()))?;

        debug!(status = %status, "response head relayed to client");

        // From here on the relay resolves even if streaming fails; the
        // connection task records the terminal outcome.
        let _ = template_tx.send(RelayRecord {
            method: parts.method.to_string(),
            target: target_label,
            upstream: upstream.map(|u| u.redacted()),
            outcome: RelayOutcome::Completed,
            status_code: status.as_u16(),
            error_message: None,
            bytes_sent: 0,
            bytes_received: 0,
            duration_ms: 0,
            timestamp: Utc::now(),
        });

        Ok(client_response)
    }

    /// Establish a CONNECT tunnel, then splice raw bytes after the client
    /// upgrades the connection.
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        cfg: &HandlerConfig,
        counters: Arc<ByteCounters>,
        started: Instant,
    ) -> Result<Response<RelayBody>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (target_host, target_port) = transport::parse_authority(&authority, 443)?;

        debug!(target = %authority, "CONNECT request");

        // Do not answer 200 until the outbound side exists.
        let tunnel = tokio::time::timeout(
            self.config.connect_timeout,
            TunnelHandler::establish(cfg, &target_host, target_port, counters.clone()),
        )
        .await
        .map_err(|_| ViaductError::Timeout)??;

        let on_upgrade = hyper::upgrade::on(req);
        let record_tx = self.record_tx.clone();
        let stats = self.stats.clone();
        let upstream_label = cfg.upstream.as_ref().map(|u| u.redacted());

        tokio::spawn(async move {
            let EstablishedTunnel {
                stream: server,
                leftover,
            } = tunnel;

            let (outcome, error_message) = match on_upgrade.await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    let primed = if leftover.is_empty() {
                        Ok(())
                    } else {
                        client.write_all(&leftover).await
                    };
                    match primed {
                        Ok(()) => {
                            TunnelHandler::copy_bidirectional(client, server).await;
                            (RelayOutcome::Completed, None)
                        }
                        Err(e) => (RelayOutcome::Interrupted, Some(e.to_string())),
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                    (RelayOutcome::Interrupted, Some(e.to_string()))
                }
            };

            let count = counters.snapshot();
            emit_record(
                &record_tx,
                &stats,
                RelayRecord {
                    method: Method::CONNECT.to_string(),
                    target: authority,
                    upstream: upstream_label,
                    outcome,
                    status_code: StatusCode::OK.as_u16(),
                    error_message,
                    bytes_sent: count.sent,
                    bytes_received: count.received,
                    duration_ms: started.elapsed().as_millis() as i64,
                    timestamp: Utc::now(),
                },
            );
        });

        info!(target = %target_host, port = target_port, "CONNECT tunnel established");

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap();
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }
}

/// Open the upstream-facing stream for a plain HTTP relay, counted from the
/// first byte, with TLS chosen by the outbound origin's scheme.
async fn open_outbound(
    upstream: Option<&UpstreamProxy>,
    target_host: &str,
    target_port: u16,
    target_tls: bool,
    opts: &ConnectOptions,
    counters: Arc<ByteCounters>,
) -> Result<Box<dyn ProxyConnection>> {
    match upstream {
        Some(u) if u.is_http() => {
            let tcp = transport::open_tcp(&u.host, u.port, opts).await?;
            let counted = CountingStream::new(tcp, counters);
            if u.uses_tls() {
                Ok(Box::new(transport::tls_connect(counted, &u.host).await?))
            } else {
                Ok(Box::new(counted))
            }
        }
        Some(u) => {
            let tcp = transport::socks5_connect(u, target_host, target_port, opts).await?;
            let counted = CountingStream::new(tcp, counters);
            if target_tls {
                Ok(Box::new(transport::tls_connect(counted, target_host).await?))
            } else {
                Ok(Box::new(counted))
            }
        }
        None => {
            let tcp = transport::open_tcp(target_host, target_port, opts).await?;
            let counted = CountingStream::new(tcp, counters);
            if target_tls {
                Ok(Box::new(transport::tls_connect(counted, target_host).await?))
            } else {
                Ok(Box::new(counted))
            }
        }
    }
}

/// Derive the outbound target from the request: absolute-form URI when
/// present, otherwise the Host header (transparent mode).
fn request_target(parts: &http::request::Parts) -> Result<(String, u16, bool)> {
    if parts.uri.host().is_some() {
        return transport::parse_target(&parts.uri);
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ViaductError::InvalidRequest("Missing Host header".to_string()))?;
    let (host, port) = transport::parse_authority(host, 80)?;
    Ok((host, port, false))
}

/// Outbound request path: the absolute-URI form when routed through an HTTP
/// upstream proxy, the original origin-form path otherwise.
fn outbound_uri(parts: &http::request::Parts, via_http_upstream: bool) -> Result<Uri> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if !via_http_upstream {
        return path
            .parse()
            .map_err(|e| ViaductError::InvalidRequest(format!("Invalid path: {}", e)));
    }

    if parts.uri.authority().is_some() {
        return Ok(parts.uri.clone());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ViaductError::InvalidRequest("Missing Host header".to_string()))?;
    format!("http://{}{}", host, path)
        .parse()
        .map_err(|e| ViaductError::InvalidRequest(format!("Invalid target URL: {}", e)))
}

/// Clamp a numeric status into the valid client-facing range [100, 999];
/// anything outside is replaced with 502 rather than failing the relay.
pub(crate) fn clamp_status(raw: u16) -> StatusCode {
    StatusCode::from_u16(raw).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Publish a terminal relay record and fold its byte counts into the
/// server-wide aggregates.
fn emit_record(
    record_tx: &Option<broadcast::Sender<RelayRecord>>,
    stats: &ServerStats,
    record: RelayRecord,
) {
    stats.add_bytes(ByteCount {
        sent: record.bytes_sent,
        received: record.bytes_received,
    });
    if let Some(tx) = record_tx {
        let _ = tx.send(record);
    }
}

/// Create an error response with a plain-text body
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(message.to_string()))
        .unwrap()
}

fn empty_body() -> RelayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(data: impl Into<Bytes>) -> RelayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_status_passes_valid_range() {
        assert_eq!(clamp_status(100), StatusCode::CONTINUE);
        assert_eq!(clamp_status(200), StatusCode::OK);
        assert_eq!(clamp_status(599).as_u16(), 599);
        assert_eq!(clamp_status(999).as_u16(), 999);
    }

    #[test]
    fn test_clamp_status_replaces_out_of_range() {
        assert_eq!(clamp_status(0), StatusCode::BAD_GATEWAY);
        assert_eq!(clamp_status(99), StatusCode::BAD_GATEWAY);
        assert_eq!(clamp_status(1000), StatusCode::BAD_GATEWAY);
    }

    fn parts_for(uri: &str, host_header: Option<&str>) -> http::request::Parts {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(host) = host_header {
            builder = builder.header(HOST, host);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn test_request_target_from_absolute_uri() {
        let parts = parts_for("http://example.test/page", None);
        assert_eq!(
            request_target(&parts).unwrap(),
            ("example.test".to_string(), 80, false)
        );

        let parts = parts_for("https://example.test:8443/page", None);
        assert_eq!(
            request_target(&parts).unwrap(),
            ("example.test".to_string(), 8443, true)
        );
    }

    #[test]
    fn test_request_target_from_host_header() {
        let parts = parts_for("/page", Some("example.test"));
        assert_eq!(
            request_target(&parts).unwrap(),
            ("example.test".to_string(), 80, false)
        );

        let parts = parts_for("/page", Some("example.test:8080"));
        assert_eq!(
            request_target(&parts).unwrap(),
            ("example.test".to_string(), 8080, false)
        );
    }

    #[test]
    fn test_request_target_missing_host() {
        let parts = parts_for("/page", None);
        assert!(matches!(
            request_target(&parts),
            Err(ViaductError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_outbound_uri_origin_form_without_upstream() {
        let parts = parts_for("http://example.test/page?x=1", None);
        let uri = outbound_uri(&parts, false).unwrap();
        assert_eq!(uri.to_string(), "/page?x=1");
    }

    #[test]
    fn test_outbound_uri_absolute_form_via_upstream() {
        let parts = parts_for("http://example.test/page", None);
        let uri = outbound_uri(&parts, true).unwrap();
        assert_eq!(uri.to_string(), "http://example.test/page");

        // transparent request gains an authority from the Host header
        let parts = parts_for("/page", Some("example.test"));
        let uri = outbound_uri(&parts, true).unwrap();
        assert_eq!(uri.to_string(), "http://example.test/page");
    }

    #[test]
    fn test_error_response_carries_reason_phrase_body() {
        let response = error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
