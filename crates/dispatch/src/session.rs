//! Session ownership and keepalive.
//!
//! [`SessionManager`] is the only holder of the authentication token.
//! Refreshes are single-writer: concurrent callers that find the token
//! missing or about to expire all wait on one authentication call and
//! share its result. A background keepalive task pings the server at
//! the cadence it asked for; an expired session triggers
//! re-authentication instead of crashing the worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use shepherd_core::hardware::HardwareSummary;
use shepherd_events::{EventBus, WorkerEvent};

use crate::api::{DispatchError, DispatchService, KeepAlive};

/// Refresh the token this long before the server-side expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Heartbeat cadence used until the server tells us its own.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15 * 60);

/// An authenticated, time-bounded credential. Memory-only; a restarted
/// worker authenticates from scratch.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub heartbeat: Duration,
}

impl Session {
    /// Whether the token is expired or close enough that a fresh one
    /// should be fetched before use.
    pub fn expires_soon(&self) -> bool {
        let margin = chrono::Duration::from_std(EXPIRY_MARGIN).unwrap_or_default();
        Utc::now() + margin >= self.expires_at
    }
}

/// Owns the session token; see the module docs.
pub struct SessionManager {
    service: Arc<dyn DispatchService>,
    hardware: HardwareSummary,
    session: RwLock<Option<Session>>,
    /// Serializes refreshes; readers never hold this.
    refresh: Mutex<()>,
    events: Arc<EventBus>,
}

impl SessionManager {
    pub fn new(
        service: Arc<dyn DispatchService>,
        hardware: HardwareSummary,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            hardware,
            session: RwLock::new(None),
            refresh: Mutex::new(()),
            events,
        })
    }

    /// A token valid for at least [`EXPIRY_MARGIN`], authenticating
    /// first if necessary.
    pub async fn token(&self) -> Result<String, DispatchError> {
        if let Some(session) = self.session.read().await.as_ref() {
            if !session.expires_soon() {
                return Ok(session.token.clone());
            }
        }
        self.refresh_session().await
    }

    /// Drop the current session so the next [`token`](Self::token) call
    /// re-authenticates.
    pub async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    /// Heartbeat cadence of the current session, if any.
    pub async fn heartbeat(&self) -> Duration {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.heartbeat)
            .unwrap_or(DEFAULT_HEARTBEAT)
    }

    /// Spawn the keepalive task. It runs until `cancel` fires.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.keepalive_loop(cancel).await;
            tracing::debug!("Keepalive task exited");
        })
    }

    async fn refresh_session(&self) -> Result<String, DispatchError> {
        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(session) = self.session.read().await.as_ref() {
            if !session.expires_soon() {
                return Ok(session.token.clone());
            }
        }

        let session = self.service.authenticate(&self.hardware).await?;
        tracing::info!(expires_at = %session.expires_at, "Session established");
        self.events.publish(WorkerEvent::SessionEstablished);

        let token = session.token.clone();
        *self.session.write().await = Some(session);
        Ok(token)
    }

    async fn keepalive_loop(&self, cancel: CancellationToken) {
        loop {
            let interval = self.heartbeat().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let token = match self.token().await {
                Ok(token) => token,
                Err(e) => {
                    // The engine surfaces fatal auth errors on its own
                    // calls; the keepalive task only reports.
                    tracing::warn!(error = %e, "Keepalive could not obtain a session");
                    continue;
                }
            };

            match self.service.keep_alive(&token).await {
                Ok(KeepAlive::Renewed) => {
                    tracing::debug!("Session renewed");
                }
                Ok(KeepAlive::Expired) => {
                    tracing::info!("Session expired, re-authenticating");
                    self.invalidate().await;
                    if let Err(e) = self.token().await {
                        tracing::warn!(error = %e, "Re-authentication after expiry failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Keepalive failed");
                    if !e.is_transient() {
                        self.invalidate().await;
                    }
                }
            }
        }
    }
}
