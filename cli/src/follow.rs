use std::future::Future;
use std::sync::Arc;

use sidelink_core::{ClientEvent, ResourceCache, SessionState, SidecarHttpClient};
use sidelink_types::ConnectionDescriptor;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Interrupted,
    SessionClosed,
    SignalsClosed,
}

/// Applies client signals in background tasks, so a refresh parked behind
/// the auth gate never holds up the watch loop.
pub struct SignalDispatcher {
    cache: Arc<ResourceCache>,
    http: SidecarHttpClient,
    tasks: JoinSet<()>,
}

impl SignalDispatcher {
    pub fn new(cache: Arc<ResourceCache>, http: SidecarHttpClient) -> Self {
        Self {
            cache,
            http,
            tasks: JoinSet::new(),
        }
    }

    pub fn dispatch(&mut self, event: &ClientEvent) {
        self.reap();
        match event {
            ClientEvent::EnvironmentChanged {
                id,
                was_deleted: true,
            } => {
                let (id, cache) = (id.clone(), self.cache.clone());
                self.tasks.spawn(async move {
                    if let Err(err) = cache.delete_environments(Some(id.as_str())).await {
                        warn!(connection_id = %id, "failed to drop cached environments: {err}");
                    }
                });
            }
            ClientEvent::ConnectionStable { connection_id } => {
                let (connection_id, http) = (connection_id.clone(), self.http.clone());
                self.tasks
                    .spawn(async move { refresh_connection(&http, &connection_id).await });
            }
            _ => {}
        }
    }

    /// Signal tasks still running.
    pub fn pending(&mut self) -> usize {
        self.reap();
        self.tasks.len()
    }

    pub fn shutdown(mut self) {
        let pending = self.pending();
        if pending > 0 {
            debug!(pending, "abandoning in-flight signal tasks");
        }
        self.tasks.abort_all();
    }

    fn reap(&mut self) {
        while let Some(finished) = self.tasks.try_join_next() {
            if let Err(err) = finished {
                if err.is_panic() {
                    warn!("signal task panicked: {err}");
                }
            }
        }
    }
}

async fn refresh_connection(http: &SidecarHttpClient, connection_id: &str) {
    let path = format!("gateway/v1/connections/{connection_id}");
    match http
        .get_json::<ConnectionDescriptor>(&path, Some(connection_id))
        .await
    {
        Ok(connection) => info!(
            connection_id = %connection.id,
            connection_type = %connection.connection_type,
            "connection settled"
        ),
        Err(err) => warn!(%connection_id, "failed to refresh connection: {err}"),
    }
}

/// Print and dispatch client signals until interrupted, the session drops,
/// or the signal bus closes.
pub async fn follow<F>(
    mut signals: broadcast::Receiver<ClientEvent>,
    mut state: watch::Receiver<SessionState>,
    dispatcher: &mut SignalDispatcher,
    interrupt: F,
) -> anyhow::Result<Stop>
where
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupted; closing sidecar session");
                return Ok(Stop::Interrupted);
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == SessionState::Disconnected {
                    warn!("sidecar closed the session");
                    return Ok(Stop::SessionClosed);
                }
            }
            signal = signals.recv() => match signal {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    dispatcher.dispatch(&event);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "client signals lagged"),
                Err(RecvError::Closed) => return Ok(Stop::SignalsClosed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sidelink_core::{
        AuthGateMiddleware, AuthStatusStore, ClientConfig, CloudConnectionReconciler, EventBus,
        MemoryStore,
    };
    use sidelink_types::{
        AuthStatus, ConnectedState, ConnectionAction, ConnectionEvent, ConnectionStatus,
        ConnectionType, Environment, SubResourceStatus,
    };
    use tokio::sync::oneshot;

    use crate::status_mirror::StatusMirror;

    struct Harness {
        config: ClientConfig,
        statuses: AuthStatusStore,
        events: EventBus,
        cache: Arc<ResourceCache>,
        dispatcher: SignalDispatcher,
    }

    fn harness() -> Harness {
        let config = ClientConfig::default();
        let statuses = AuthStatusStore::new();
        let events = EventBus::new();
        let header = config.connection_id_header_name().unwrap();
        let gate = AuthGateMiddleware::new(
            statuses.clone(),
            events.clone(),
            config.ccloud_connection_id.clone(),
            header.clone(),
        );
        let http = SidecarHttpClient::new("http://127.0.0.1:9", header)
            .with_middleware(Arc::new(gate));
        let cache = Arc::new(ResourceCache::new(Arc::new(MemoryStore::new())));
        let dispatcher = SignalDispatcher::new(cache.clone(), http);
        Harness {
            config,
            statuses,
            events,
            cache,
            dispatcher,
        }
    }

    fn expired_ccloud(id: &str) -> ConnectionEvent {
        ConnectionEvent {
            action: ConnectionAction::Updated,
            connection: ConnectionDescriptor {
                id: id.to_string(),
                name: None,
                connection_type: ConnectionType::Ccloud,
                status: ConnectionStatus {
                    ccloud: Some(SubResourceStatus::new(ConnectedState::Expired)),
                    ..Default::default()
                },
            },
        }
    }

    fn interrupt_after(delay: Duration) -> impl Future<Output = ()> {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = stop_tx.send(());
        });
        async move {
            let _ = stop_rx.await;
        }
    }

    #[tokio::test]
    async fn expired_token_refresh_does_not_block_interrupt() {
        let mut h = harness();
        let signals = h.events.subscribe();
        let (_state_tx, state) = watch::channel(SessionState::Connected);
        let mirror = StatusMirror::new(h.statuses.clone(), h.events.clone());

        mirror
            .reconcile(&expired_ccloud(&h.config.ccloud_connection_id))
            .await
            .unwrap();
        assert_eq!(h.statuses.current(), Some(AuthStatus::InvalidToken));

        let stop = tokio::time::timeout(
            Duration::from_secs(2),
            follow(
                signals,
                state,
                &mut h.dispatcher,
                interrupt_after(Duration::from_millis(100)),
            ),
        )
        .await
        .expect("watch loop should stay responsive")
        .unwrap();

        assert_eq!(stop, Stop::Interrupted);
        // The refresh is still parked behind the gate.
        assert_eq!(h.dispatcher.pending(), 1);
        h.dispatcher.shutdown();
    }

    #[tokio::test]
    async fn session_loss_ends_the_loop_while_a_refresh_is_parked() {
        let mut h = harness();
        let signals = h.events.subscribe();
        let (state_tx, state) = watch::channel(SessionState::Connected);
        h.statuses.set(AuthStatus::InvalidToken);
        h.events.publish(ClientEvent::ConnectionStable {
            connection_id: h.config.ccloud_connection_id.clone(),
        });

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            state_tx.send_replace(SessionState::Disconnected);
            // Keep the sender alive until the loop has seen the change.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let stop = tokio::time::timeout(
            Duration::from_secs(2),
            follow(signals, state, &mut h.dispatcher, std::future::pending()),
        )
        .await
        .expect("session loss should end the loop")
        .unwrap();
        assert_eq!(stop, Stop::SessionClosed);
        assert_eq!(h.dispatcher.pending(), 1);
        h.dispatcher.shutdown();
    }

    #[tokio::test]
    async fn deleted_environment_drops_cached_entries() {
        let mut h = harness();
        h.cache
            .set_environments(
                "direct-1",
                vec![Environment {
                    id: "env-1".to_string(),
                    name: "dev".to_string(),
                    connection_id: "direct-1".to_string(),
                    connection_type: ConnectionType::Direct,
                }],
            )
            .await
            .unwrap();

        h.dispatcher.dispatch(&ClientEvent::EnvironmentChanged {
            id: "direct-1".to_string(),
            was_deleted: true,
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.dispatcher.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cache update should finish");

        assert_eq!(h.cache.environments("direct-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unrelated_signals_spawn_nothing() {
        let mut h = harness();
        h.dispatcher.dispatch(&ClientEvent::ReconnectingStarted);
        h.dispatcher.dispatch(&ClientEvent::EnvironmentChanged {
            id: "direct-1".to_string(),
            was_deleted: false,
        });
        assert_eq!(h.dispatcher.pending(), 0);
    }
}
