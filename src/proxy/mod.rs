//! Proxy relay implementation
//!
//! This module provides the forward-proxy functionality including:
//! - HTTP/HTTPS request forwarding, direct or through an upstream proxy
//! - CONNECT tunneling with optional upstream chaining
//! - Header sanitation and per-leg header transform hooks
//! - Byte accounting and relay completion records

pub mod counters;
pub mod handler;
pub mod headers;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use counters::{ByteCount, ByteCounters, CountingStream, ServerStats, StatsSnapshot};
pub use handler::{HandlerConfig, RelayHandler, RelayHandlerConfig};
pub use headers::{sanitize_headers, HeaderPair, HeaderTransform};
pub use server::{
    PrepareRequest, ProxyServer, ProxyServerBuilder, RequestDescriptor, StaticPrepare,
};
pub use transport::{ConnectOptions, DnsResolve, IpFamily, ProxyConnection};
pub use tunnel::TunnelHandler;
