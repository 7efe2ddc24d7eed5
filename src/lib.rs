//! dualproxy - a local forwarding proxy speaking HTTP and SOCKS5
//!
//! This crate provides:
//! - An HTTP/1.1 proxy (absolute-URI forwarding and CONNECT tunnels)
//! - A SOCKS5 proxy (no authentication, CONNECT only)
//! - A shared bidirectional relay with idle teardown
//! - An idempotent launcher that binds both listeners once
//! - Prometheus metrics

pub mod config;
pub mod frontend;
pub mod launcher;
pub mod metrics;
pub mod proxy;
pub mod session;
pub mod util;

pub use config::Config;
pub use launcher::{LaunchError, ProxyAddrs, ProxyLauncher};
