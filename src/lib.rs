//! Viaduct - Forward Proxy with Upstream Chaining
//!
//! A forward/transparent HTTP(S) proxy server written in Rust.
//!
//! ## Features
//!
//! - Plain HTTP forwarding, direct to the origin or through an upstream proxy
//! - CONNECT tunneling for HTTPS, with chained tunneling through an upstream
//! - HTTP, HTTPS, and SOCKS5 upstream proxies with embedded credentials
//! - Per-request routing hooks: upstream selection, bind address, IP family,
//!   custom DNS resolution, and header transforms per leg
//! - Per-connection byte accounting and relay completion records

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{Result, ViaductError};
