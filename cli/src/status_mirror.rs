use async_trait::async_trait;
use tracing::{debug, info};

use sidelink_core::{
    is_connection_stable, AuthStatusStore, ClientEvent, CloudConnectionReconciler, EventBus,
};
use sidelink_types::{AuthStatus, ConnectedState, ConnectionEvent};

/// Stands in for the control-plane poller: copies the cloud connection's
/// pushed state into the auth status store, and signals stability the same
/// way direct connections do.
pub struct StatusMirror {
    statuses: AuthStatusStore,
    events: EventBus,
}

impl StatusMirror {
    pub fn new(statuses: AuthStatusStore, events: EventBus) -> Self {
        Self { statuses, events }
    }
}

fn auth_status_for(state: ConnectedState) -> Option<AuthStatus> {
    match state {
        ConnectedState::Success => Some(AuthStatus::Valid),
        ConnectedState::Expired => Some(AuthStatus::InvalidToken),
        ConnectedState::Failed => Some(AuthStatus::Failed),
        ConnectedState::None => Some(AuthStatus::NoToken),
        ConnectedState::Attempting => None,
    }
}

#[async_trait]
impl CloudConnectionReconciler for StatusMirror {
    async fn reconcile(&self, event: &ConnectionEvent) -> anyhow::Result<()> {
        let connection = &event.connection;
        if event.action.is_removal() {
            info!(connection_id = %connection.id, "cloud connection removed");
            self.statuses.clear();
            return Ok(());
        }

        let state = connection.status.ccloud_state();
        if let Some(status) = auth_status_for(state) {
            debug!(connection_id = %connection.id, status = status.as_str(), "auth status");
            self.statuses.set(status);
        }
        if is_connection_stable(connection)? {
            self.events.publish(ClientEvent::ConnectionStable {
                connection_id: connection.id.clone(),
            });
        }
        Ok(())
    }
}
