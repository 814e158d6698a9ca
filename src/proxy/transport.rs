//! Outbound connection plumbing
//!
//! Establishes the upstream-facing socket for a relay: address resolution
//! (with an optional caller-supplied resolver), local binding, IP family
//! preference, plain or TLS transport, and the CONNECT/SOCKS5 handshakes used
//! when chaining through an upstream proxy.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{Result, ViaductError};
use crate::models::UpstreamProxy;
use crate::proxy::handler::clamp_status;
use crate::proxy::headers::HeaderPair;

/// Upper bound on the CONNECT response head read from an upstream proxy
const CONNECT_HEAD_MAX: usize = 8 * 1024;

/// Preferred address family for outbound connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "4" | "v4" | "ipv4" => Some(IpFamily::V4),
            "6" | "v6" | "ipv6" => Some(IpFamily::V6),
            _ => None,
        }
    }

    fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Caller-supplied DNS resolution hook.
///
/// When present, every outbound hostname lookup goes through this instead of
/// the system resolver. The hook may suspend.
#[async_trait]
pub trait DnsResolve: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Per-relay options applied when opening the outbound socket
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Local address to bind the outbound socket to
    pub bind_address: Option<IpAddr>,
    /// Restrict candidate addresses to one family
    pub ip_family: Option<IpFamily>,
    /// Custom DNS lookup, replacing the system resolver
    pub resolver: Option<Arc<dyn DnsResolve>>,
}

/// Any stream a relay can run over
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ProxyConnection for S {}

/// Resolve a host to candidate socket addresses, honoring the custom
/// resolver and family preference.
async fn resolve_addrs(host: &str, port: u16, opts: &ConnectOptions) -> Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![SocketAddr::new(ip, port)]
    } else if let Some(resolver) = &opts.resolver {
        resolver
            .resolve(host, port)
            .await
            .map_err(|e| ViaductError::HostUnresolvable(format!("{}: {}", host, e)))?
    } else {
        lookup_host((host, port))
            .await
            .map_err(|e| ViaductError::HostUnresolvable(format!("{}: {}", host, e)))?
            .collect()
    };

    if let Some(family) = opts.ip_family {
        addrs.retain(|addr| family.matches(addr));
    }

    if addrs.is_empty() {
        return Err(ViaductError::HostUnresolvable(host.to_string()));
    }
    Ok(addrs)
}

/// Open a TCP connection to `host:port`, trying each resolved address in
/// order. The local bind address, when set, restricts candidates to its
/// family.
pub async fn open_tcp(host: &str, port: u16, opts: &ConnectOptions) -> Result<TcpStream> {
    let mut addrs = resolve_addrs(host, port, opts).await?;

    if let Some(bind) = opts.bind_address {
        addrs.retain(|addr| addr.is_ipv4() == bind.is_ipv4());
        if addrs.is_empty() {
            return Err(ViaductError::HostUnresolvable(format!(
                "{}: no address matching bind family",
                host
            )));
        }
    }

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        let socket = match if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        } {
            Ok(socket) => socket,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        if let Some(bind) = opts.bind_address {
            if let Err(e) = socket.bind(SocketAddr::new(bind, 0)) {
                last_err = Some(e);
                continue;
            }
        }

        match socket.connect(addr).await {
            Ok(stream) => {
                debug!(%addr, "outbound connection established");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "outbound connect failed");
                last_err = Some(e);
            }
        }
    }

    Err(ViaductError::Connection(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "no addresses to connect")
    })))
}

fn tls_client_config() -> Arc<rustls::ClientConfig> {
    static TLS_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    TLS_CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .expect("ring provider supports default TLS versions")
                .with_root_certificates(roots)
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

/// Wrap an established stream in a client-side TLS session for `host`.
pub async fn tls_connect<S>(stream: S, host: &str) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| ViaductError::InvalidRequest(format!("invalid TLS server name: {}", host)))?;
    let connector = tokio_rustls::TlsConnector::from(tls_client_config());
    connector
        .connect(server_name, stream)
        .await
        .map_err(ViaductError::Connection)
}

/// Negotiate a CONNECT tunnel through an HTTP upstream proxy.
///
/// Writes the CONNECT request with the caller's (already sanitized) header
/// sequence and optional `Proxy-Authorization`, then reads the response head.
/// Returns any bytes the upstream sent past the head; they belong to the
/// tunnel and must reach the client first.
pub async fn http_connect_handshake<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    headers: &[HeaderPair],
    proxy_authorization: Option<&str>,
) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format_connect_authority(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\n", authority);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if let Some(auth) = proxy_authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ViaductError::Connection)?;

    let (status, leftover) = read_connect_head(stream).await?;
    match status {
        407 => Err(ViaductError::UpstreamAuthRequired),
        200..=299 => {
            debug!(%authority, "CONNECT tunnel established through upstream");
            Ok(leftover)
        }
        other => Err(ViaductError::ConnectRejected {
            status: clamp_status(other),
        }),
    }
}

/// Read an HTTP response head (through the terminating blank line) and parse
/// the status code. Returns the code and any buffered bytes past the head.
async fn read_connect_head<S>(stream: &mut S) -> Result<(u16, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > CONNECT_HEAD_MAX {
            return Err(ViaductError::Http(
                "CONNECT response head too large".to_string(),
            ));
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(ViaductError::Connection)?;
        if n == 0 {
            return Err(ViaductError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed during CONNECT handshake",
            )));
        }
    };

    let leftover = buf.split_off(head_len).freeze();
    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.split_whitespace();
    let version = parts.next().unwrap_or("");
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|_| version.starts_with("HTTP/"))
        .ok_or_else(|| {
            ViaductError::Http(format!(
                "malformed CONNECT response: {}",
                head.lines().next().unwrap_or("")
            ))
        })?;

    Ok((status, leftover))
}

/// Connect to the target through a SOCKS5 upstream. Credentials ride in the
/// SOCKS handshake, not in an HTTP header.
pub async fn socks5_connect(
    upstream: &UpstreamProxy,
    target_host: &str,
    target_port: u16,
    opts: &ConnectOptions,
) -> Result<TcpStream> {
    debug!(upstream = %upstream.redacted(), "connecting through SOCKS5 upstream");
    let socket = open_tcp(&upstream.host, upstream.port, opts).await?;

    let stream = if upstream.has_credentials() {
        let username = upstream.decoded_username()?;
        let password = upstream.decoded_password()?;
        Socks5Stream::connect_with_password_and_socket(
            socket,
            (target_host, target_port),
            &username,
            &password,
        )
        .await
    } else {
        Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await
    }
    .map_err(|e| {
        ViaductError::Connection(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("SOCKS5 connect failed: {}", e),
        ))
    })?;

    Ok(stream.into_inner())
}

/// Parse host, port and TLS flag from a request target URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16, bool)> {
    let host = uri
        .host()
        .ok_or_else(|| ViaductError::InvalidRequest("Missing host in URI".to_string()))?
        .to_string();

    let tls = matches!(uri.scheme_str(), Some("https"));
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    Ok((host, port, tls))
}

/// Parse host and port from an authority string such as a CONNECT target or
/// Host header value
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid =
        || ViaductError::InvalidRequest(format!("Invalid authority '{}'", authority));

    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6: "[::1]" or "[::1]:8443"
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid()),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // An extra colon in the host part means an unbracketed IPv6 literal
        // without a port.
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), default_port)),
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port_str.parse::<u16>().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        None => {
            if authority.is_empty() {
                return Err(invalid());
            }
            Ok((authority.to_string(), default_port))
        }
    }
}

/// `host:port` with IPv6 hosts bracketed, for CONNECT request lines
pub fn format_connect_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_parse_target_defaults() {
        let uri: Uri = "http://example.test/page".parse().unwrap();
        assert_eq!(
            parse_target(&uri).unwrap(),
            ("example.test".to_string(), 80, false)
        );

        let uri: Uri = "https://example.test/page".parse().unwrap();
        assert_eq!(
            parse_target(&uri).unwrap(),
            ("example.test".to_string(), 443, true)
        );

        let uri: Uri = "http://example.test:8080/".parse().unwrap();
        assert_eq!(
            parse_target(&uri).unwrap(),
            ("example.test".to_string(), 8080, false)
        );
    }

    #[test]
    fn test_parse_target_requires_host() {
        let uri: Uri = "/page".parse().unwrap();
        assert!(matches!(
            parse_target(&uri),
            Err(ViaductError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.test:8443", 443).unwrap(),
            ("example.test".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.test", 443).unwrap(),
            ("example.test".to_string(), 443)
        );
        assert_eq!(
            parse_authority("example.test", 80).unwrap(),
            ("example.test".to_string(), 80)
        );
        assert_eq!(
            parse_authority("[::1]:8443", 443).unwrap(),
            ("::1".to_string(), 8443)
        );
    }

    #[test]
    fn test_format_connect_authority_brackets_ipv6() {
        assert_eq!(
            format_connect_authority("example.test", 443),
            "example.test:443"
        );
        assert_eq!(format_connect_authority("::1", 443), "[::1]:443");
    }

    #[tokio::test]
    async fn test_open_tcp_to_literal_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = open_tcp("127.0.0.1", addr.port(), &ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_open_tcp_refused_maps_to_bad_gateway() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = open_tcp("127.0.0.1", addr.port(), &ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.client_status(false), hyper::StatusCode::BAD_GATEWAY);
    }

    struct StaticResolver(Vec<SocketAddr>);

    #[async_trait]
    impl DnsResolve for StaticResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<SocketAddr>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_open_tcp_uses_custom_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let opts = ConnectOptions {
            resolver: Some(Arc::new(StaticResolver(vec![addr]))),
            ..Default::default()
        };

        let stream = open_tcp("fake.internal", 80, &opts).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_family_preference_filters_candidates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let opts = ConnectOptions {
            resolver: Some(Arc::new(StaticResolver(vec![addr]))),
            ip_family: Some(IpFamily::V6),
            ..Default::default()
        };

        let err = open_tcp("fake.internal", 80, &opts).await.unwrap_err();
        assert!(matches!(err, ViaductError::HostUnresolvable(_)));
    }

    #[tokio::test]
    async fn test_http_connect_handshake_success_with_leftover() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let proxy_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = stream.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();

            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\nearly")
                .await
                .unwrap();
            req
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let headers = vec![("Host".to_string(), "example.test:443".to_string())];
        let leftover = http_connect_handshake(
            &mut stream,
            "example.test",
            443,
            &headers,
            Some("Basic dXNlcjpwYXNz"),
        )
        .await
        .unwrap();

        assert_eq!(&leftover[..], b"early");

        let req = proxy_task.await.unwrap();
        assert!(req.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.test:443\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_handshake_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = http_connect_handshake(&mut stream, "example.test", 443, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ViaductError::ConnectRejected { status } if status == hyper::StatusCode::FORBIDDEN
        ));
    }

    #[tokio::test]
    async fn test_http_connect_handshake_upstream_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = timeout(
            Duration::from_secs(1),
            http_connect_handshake(&mut stream, "example.test", 443, &[], None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ViaductError::UpstreamAuthRequired));
    }
}
