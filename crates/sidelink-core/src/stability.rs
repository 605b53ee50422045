//! Turns connection-status pushes into "stable" signals for the UI.
//!
//! Stable means the connection finished transitioning, not that it is healthy:
//! a direct connection whose Kafka and Schema Registry probes both failed is
//! stable. Stability is recomputed from the pushed status on every event, so
//! a repeated stable event fires its signals again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use sidelink_types::{ConnectedState, ConnectionDescriptor, ConnectionEvent, ConnectionType};
use sidelink_wire::{MessageBody, MessageType};

use crate::error::{Result, SidelinkError};
use crate::event_bus::{ClientEvent, EventBus};
use crate::router::{MessageRouter, Subscription};

/// Applies cloud-connection events to the rest of the client state.
#[async_trait]
pub trait CloudConnectionReconciler: Send + Sync {
    async fn reconcile(&self, event: &ConnectionEvent) -> anyhow::Result<()>;
}

/// Whether `connection` has settled. Local connections are not tracked here
/// and are rejected.
pub fn is_connection_stable(connection: &ConnectionDescriptor) -> Result<bool> {
    let status = &connection.status;
    match connection.connection_type {
        ConnectionType::Ccloud => {
            let state = status.ccloud_state();
            if let Some(sign_in) = status.sign_in_error() {
                warn!(
                    connection_id = %connection.id,
                    "cloud connection reports sign-in error: {}",
                    sign_in.message
                );
            }
            Ok(state != ConnectedState::None)
        }
        ConnectionType::Direct => {
            let kafka = status.kafka_state();
            let schema_registry = status.schema_registry_state();
            Ok(kafka != ConnectedState::Attempting
                && schema_registry != ConnectedState::Attempting)
        }
        other => Err(SidelinkError::UnhandledConnectionType(other)),
    }
}

pub struct ConnectionStabilityTracker {
    events: EventBus,
    reconciler: Arc<dyn CloudConnectionReconciler>,
}

impl ConnectionStabilityTracker {
    pub fn new(events: EventBus, reconciler: Arc<dyn CloudConnectionReconciler>) -> Self {
        Self { events, reconciler }
    }

    /// Route every CONNECTION_EVENT frame from `router` into this tracker.
    pub fn attach(self: &Arc<Self>, router: &MessageRouter) -> Subscription {
        let tracker = self.clone();
        router.subscribe(MessageType::ConnectionEvent, move |message| {
            let tracker = tracker.clone();
            async move {
                if let MessageBody::ConnectionEvent(event) = &message.body {
                    tracker.handle_event(event).await?;
                }
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    pub async fn handle_event(&self, event: &ConnectionEvent) -> Result<()> {
        let connection = &event.connection;
        match connection.connection_type {
            ConnectionType::Ccloud => self
                .reconciler
                .reconcile(event)
                .await
                .map_err(|err| SidelinkError::Reconcile(format!("{err:#}"))),
            ConnectionType::Direct => self.handle_direct(event),
            ConnectionType::Local => {
                debug!(
                    connection_id = %connection.id,
                    action = event.action.as_str(),
                    "ignoring local connection event"
                );
                Ok(())
            }
            other => Err(SidelinkError::UnhandledConnectionType(other)),
        }
    }

    fn handle_direct(&self, event: &ConnectionEvent) -> Result<()> {
        let id = event.connection.id.clone();
        if event.action.is_removal() {
            info!(connection_id = %id, action = event.action.as_str(), "direct connection removed");
            self.events.publish(ClientEvent::ConnectionStable {
                connection_id: id.clone(),
            });
            self.events.publish(ClientEvent::EnvironmentChanged {
                id,
                was_deleted: true,
            });
            return Ok(());
        }

        if !is_connection_stable(&event.connection)? {
            debug!(
                connection_id = %id,
                action = event.action.as_str(),
                "direct connection still transitioning"
            );
            return Ok(());
        }

        info!(connection_id = %id, action = event.action.as_str(), "direct connection stable");
        self.events.publish(ClientEvent::ConnectionStable {
            connection_id: id.clone(),
        });
        self.events.publish(ClientEvent::EnvironmentChanged {
            id,
            was_deleted: false,
        });
        Ok(())
    }
}
