//! TLS listener and lifecycle
//!
//! Serves the proxy router over rustls with a header read timeout, and
//! turns SIGTERM/ctrl-c into a graceful drain: pre-shutdown hooks run
//! first, then in-flight requests get a grace period to finish.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use tracing::info;

use crate::error::{Error, Result};
use crate::hooks::PreShutdownHooks;

/// Listener read-header timeout
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How long in-flight requests get to finish after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// PEM-encoded serving certificate chain
    pub cert_path: PathBuf,
    /// PEM-encoded private key
    pub key_path: PathBuf,
}

/// Serve `router` until shutdown.
///
/// TLS material failures are configuration errors (startup-fatal); a
/// listener failure after startup is an internal error so the process can
/// exit with the runtime-failure code.
pub async fn serve(
    listener: ListenerConfig,
    router: Router,
    hooks: Arc<PreShutdownHooks>,
) -> Result<()> {
    let tls = RustlsConfig::from_pem_file(&listener.cert_path, &listener.key_path)
        .await
        .map_err(|e| {
            Error::config(format!(
                "failed to load serving certificate {} / key {}: {}",
                listener.cert_path.display(),
                listener.key_path.display(),
                e
            ))
        })?;

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone(), hooks));

    info!(addr = %listener.addr, "proxy listening");

    let mut server = axum_server::bind_rustls(listener.addr, tls).handle(handle);
    server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    server
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| Error::internal(format!("listener failed: {}", e)))
}

/// Wait for a termination signal, run hooks, then drain
async fn shutdown_on_signal(handle: Handle, hooks: Arc<PreShutdownHooks>) {
    wait_for_signal().await;
    info!("shutdown signal received");

    hooks.run();
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
