//! Request audit trail
//!
//! Every request produces a pair of events: one when it is accepted and one
//! when the response (including any streamed body) has completed. Events
//! are pushed onto an unbounded channel and drained by a single writer
//! task, so the sink is append-only and internally serialised without any
//! locking on the request path.
//!
//! With `--audit-log-path` events are written as JSON lines; without it
//! they are emitted on the `audit` tracing target.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Where in the request lifecycle an event was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    /// Request accepted by the listener, before authentication
    RequestReceived,
    /// Response complete, body fully streamed
    ResponseComplete,
}

/// How the request was (or was not) sent upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// Impersonation headers were applied
    Impersonated,
    /// Original bearer token forwarded verbatim
    Passthrough,
    /// Request rejected before dispatch
    Rejected,
}

/// A single audit record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event id
    pub id: Uuid,
    /// Event timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// Lifecycle stage
    pub stage: AuditStage,
    /// Externally reachable proxy address
    pub proxy_address: String,
    /// Client address
    pub remote_addr: String,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Authenticated username, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Dispatch decision, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<AuditDecision>,
    /// Final response status, on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Failure cause; recorded here and in logs, never in 401/403 bodies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Event recorded when a request is accepted
    pub fn request_received(
        proxy_address: impl Into<String>,
        remote_addr: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            stage: AuditStage::RequestReceived,
            proxy_address: proxy_address.into(),
            remote_addr: remote_addr.into(),
            method: method.into(),
            path: path.into(),
            user: None,
            decision: None,
            status: None,
            reason: None,
        }
    }

    /// The paired completion event for this request
    pub fn completed(
        &self,
        user: Option<String>,
        decision: AuditDecision,
        status: u16,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            stage: AuditStage::ResponseComplete,
            proxy_address: self.proxy_address.clone(),
            remote_addr: self.remote_addr.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            user,
            decision: Some(decision),
            status: Some(status),
            reason,
        }
    }
}

/// Handle for emitting audit events from request handlers
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditSink {
    /// Start the sink and its writer task.
    ///
    /// The returned join handle completes when every sender is dropped and
    /// the channel has drained, so awaiting it at shutdown flushes the log.
    pub fn start(log_path: Option<PathBuf>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(drain(rx, log_path));
        (Self { tx }, writer)
    }

    /// Record an event. Never blocks; a closed sink drops the event.
    pub fn emit(&self, event: AuditEvent) {
        let _ = self.tx.send(event);
    }
}

/// Writer task: consumes the channel until all senders are gone
async fn drain(mut rx: mpsc::UnboundedReceiver<AuditEvent>, log_path: Option<PathBuf>) {
    let mut file = match &log_path {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to open audit log, falling back to tracing");
                None
            }
        },
        None => None,
    };

    while let Some(event) = rx.recv().await {
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to serialise audit event");
                continue;
            }
        };

        match &mut file {
            Some(f) => {
                if let Err(e) = f.write_all(format!("{}\n", line).as_bytes()).await {
                    error!(error = %e, "failed to write audit event");
                }
            }
            None => info!(target: "audit", "{}", line),
        }
    }

    if let Some(f) = &mut file {
        let _ = f.flush().await;
    }
}
