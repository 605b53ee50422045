//! Holds back control-plane requests while its credential is being refreshed.
//!
//! The status itself comes from an external poller writing into
//! [`AuthStatusStore`]. Requests that see `INVALID_TOKEN` wait until the store
//! is given anything else (or is cleared), even if that value is replaced by
//! `INVALID_TOKEN` again before the waiter wakes. However many requests wait
//! at once, only one "reconnecting" indicator is raised per episode.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderName;
use reqwest::Request;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sidelink_types::AuthStatus;

use crate::event_bus::{ClientEvent, EventBus};
use crate::http::RequestMiddleware;

/// Latest control-plane auth status, with change notification.
#[derive(Clone)]
pub struct AuthStatusStore {
    tx: Arc<watch::Sender<Option<AuthStatus>>>,
    settlements: Arc<AtomicU64>,
}

impl AuthStatusStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            settlements: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current(&self) -> Option<AuthStatus> {
        *self.tx.borrow()
    }

    pub fn set(&self, status: AuthStatus) {
        self.publish(Some(status));
    }

    pub fn clear(&self) {
        self.publish(None);
    }

    /// How many non-transient values have been published so far. Bumped
    /// before receivers are notified.
    pub fn settlements(&self) -> u64 {
        self.settlements.load(Ordering::SeqCst)
    }

    fn publish(&self, status: Option<AuthStatus>) {
        if !status.is_some_and(AuthStatus::is_transient) {
            self.settlements.fetch_add(1, Ordering::SeqCst);
        }
        self.tx.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AuthStatus>> {
        self.tx.subscribe()
    }
}

impl Default for AuthStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AuthGateMiddleware {
    statuses: AuthStatusStore,
    events: EventBus,
    ccloud_connection_id: String,
    connection_id_header: HeaderName,
    max_wait: Option<Duration>,
    reconnecting: AtomicBool,
}

impl AuthGateMiddleware {
    pub fn new(
        statuses: AuthStatusStore,
        events: EventBus,
        ccloud_connection_id: impl Into<String>,
        connection_id_header: HeaderName,
    ) -> Self {
        Self {
            statuses,
            events,
            ccloud_connection_id: ccloud_connection_id.into(),
            connection_id_header,
            max_wait: None,
            reconnecting: AtomicBool::new(false),
        }
    }

    /// Let blocked requests through after `max_wait` even if the token is
    /// still invalid. Unset, requests wait for as long as the status says so.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    fn targets_control_plane(&self, request: &Request) -> bool {
        request
            .headers()
            .get(&self.connection_id_header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|id| id == self.ccloud_connection_id)
    }

    /// Check the cached status and wait out a token refresh if one is in
    /// progress.
    pub async fn gate(&self) {
        match self.statuses.current() {
            Some(status) if status.is_transient() => self.wait_for_token_refresh().await,
            Some(status) if status.requires_sign_in() => {
                self.finish_reconnecting();
                info!(status = status.as_str(), "control-plane session invalidated");
                self.events.publish(ClientEvent::SessionInvalidated);
            }
            _ => self.finish_reconnecting(),
        }
    }

    async fn wait_for_token_refresh(&self) {
        let baseline = self.statuses.settlements();
        let mut rx = self.statuses.subscribe();
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("control-plane token invalid; holding requests until it refreshes");
            self.events.publish(ClientEvent::ReconnectingStarted);
        }

        let settled = match self.max_wait {
            Some(limit) => {
                match tokio::time::timeout(limit, self.settled_status(baseline, &mut rx)).await {
                    Ok(settled) => settled,
                    Err(_) => {
                        warn!(
                            waited_ms = limit.as_millis() as u64,
                            "token still invalid; releasing request anyway"
                        );
                        return;
                    }
                }
            }
            None => self.settled_status(baseline, &mut rx).await,
        };

        match settled {
            Some(status) => {
                debug!(
                    status = status.map_or("<cleared>", AuthStatus::as_str),
                    "auth status settled; releasing request"
                );
                self.finish_reconnecting();
            }
            None => warn!("auth status store closed while waiting"),
        }
    }

    fn finish_reconnecting(&self) {
        if self
            .reconnecting
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.events.publish(ClientEvent::ReconnectingFinished);
        }
    }

    /// Wait until a non-transient status has been published since `baseline`,
    /// or the store already holds one. Returns the status seen on release;
    /// `None` means the store went away.
    async fn settled_status(
        &self,
        baseline: u64,
        rx: &mut watch::Receiver<Option<AuthStatus>>,
    ) -> Option<Option<AuthStatus>> {
        loop {
            let seen = *rx.borrow_and_update();
            let republished = self.statuses.settlements() != baseline;
            if republished || !seen.is_some_and(AuthStatus::is_transient) {
                return Some(seen);
            }
            rx.changed().await.ok()?;
        }
    }
}

#[async_trait]
impl RequestMiddleware for AuthGateMiddleware {
    async fn pre_request(&self, request: &mut Request) -> anyhow::Result<()> {
        if self.targets_control_plane(request) {
            self.gate().await;
        }
        Ok(())
    }
}
