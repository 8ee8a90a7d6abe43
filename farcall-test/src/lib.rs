//! Test utilities for farcall.
//!
//! [`TestApp`] drives a server's router in-process over
//! `tower::ServiceExt::oneshot`; [`TestServer`] binds an ephemeral port for
//! flows that need a real connection, and [`TestSocket`] speaks the socket
//! envelope protocol against it.

mod app;
mod socket;

pub use app::{TestApp, TestResponse};
pub use socket::{wait_for, TestServer, TestSocket};

/// Install a fmt subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Called by [`TestApp`] and [`TestServer`] on construction; repeat calls are
/// no-ops, so every test gets server logs without any setup of its own.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
