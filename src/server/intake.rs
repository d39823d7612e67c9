//! Action and validation intake
//!
//! Inbound requests become main-thread tasks. Action dispatch is
//! broadcast-to-binding: every entity bound to the client gets a chance to
//! handle the request by action name, and an entity with no matching
//! handler drops it silently (expected when a bot's code version differs
//! from the current handler set). Validation results are a failure ledger:
//! only failing results are retained, until the run is stopped.

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::net::protocol::{ActionRequest, TickSnapshot, ValidationResult};
use crate::replay::archive::TickDataRecord;
use crate::server::tasks::TaskContext;
use crate::server::BotServer;
use crate::ClientId;

/// Append-only failing validation results per client.
///
/// Retained across client teardown so tests can inspect failures after
/// bots finish; cleared only when the whole run shuts down.
#[derive(Default)]
pub struct ValidationLedger {
    failures: RwLock<HashMap<ClientId, Vec<ValidationResult>>>,
}

impl ValidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, client_id: ClientId) {
        self.failures.write().entry(client_id).or_default();
    }

    pub fn append(&self, client_id: ClientId, result: ValidationResult) {
        self.failures
            .write()
            .entry(client_id)
            .or_default()
            .push(result);
    }

    pub fn failed_for(&self, client_id: ClientId) -> Vec<ValidationResult> {
        self.failures
            .read()
            .get(&client_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.failures.write().clear();
    }
}

/// Per-client action/validation activity accumulated between broadcast
/// ticks, flushed to the history writer with each tick's snapshot
#[derive(Debug, Default, Clone)]
pub struct TickActivity {
    pub actions: Vec<ActionRequest>,
    pub validations: Vec<ValidationResult>,
}

#[derive(Default)]
pub struct TickActivityLog {
    active: RwLock<HashMap<ClientId, TickActivity>>,
}

impl TickActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_action(&self, client_id: ClientId, request: &ActionRequest) {
        self.active
            .write()
            .entry(client_id)
            .or_default()
            .actions
            .push(request.clone());
    }

    pub fn record_validation(&self, client_id: ClientId, result: &ValidationResult) {
        self.active
            .write()
            .entry(client_id)
            .or_default()
            .validations
            .push(result.clone());
    }

    /// Drain everything accumulated since the last tick
    pub fn take_all(&self) -> Vec<(ClientId, TickActivity)> {
        self.active.write().drain().collect()
    }

    pub fn remove(&self, client_id: ClientId) {
        self.active.write().remove(&client_id);
    }

    pub fn clear(&self) {
        self.active.write().clear();
    }
}

impl BotServer {
    /// Queue an action request for dispatch to every entity bound to the
    /// client
    pub fn handle_action_request(&self, client_id: ClientId, request: ActionRequest) {
        self.tasks.enqueue(
            client_id,
            Box::new(move |ctx| {
                let TaskContext { server, scene } = &mut *ctx;
                debug!(
                    "Dispatching action '{}' for clientId: {}",
                    request.action, client_id
                );
                server.activity.record_action(client_id, &request);

                let entities = server
                    .bindings
                    .entities_for(client_id)
                    .ok_or_else(|| anyhow::anyhow!("no binding for client {client_id}"))?;
                for entity_id in entities {
                    if !scene.perform_action(entity_id, &request) {
                        debug!(
                            "No action handler '{}' on entity {}; request dropped",
                            request.action, entity_id
                        );
                    }
                }
                Ok(())
            }),
        );
    }

    /// Queue a validation result; only failures are added to the ledger
    pub fn handle_validation_result(&self, client_id: ClientId, result: ValidationResult) {
        self.tasks.enqueue(
            client_id,
            Box::new(move |ctx| {
                let TaskContext { server, .. } = &mut *ctx;
                server.activity.record_validation(client_id, &result);
                if !result.passed {
                    debug!(
                        "Saving failed validation '{}' for clientId: {}",
                        result.name, client_id
                    );
                    server.validations.append(client_id, result);
                }
                Ok(())
            }),
        );
    }

    /// Failing validation results recorded for a client so far
    pub fn failed_validations_for(&self, client_id: ClientId) -> Vec<ValidationResult> {
        self.validations.failed_for(client_id)
    }

    /// Persist one tick's worth of a client's activity through the history
    /// writer
    pub fn save_tick_data(
        &self,
        client_id: ClientId,
        snapshot: &TickSnapshot,
        actions: Vec<ActionRequest>,
        validations: Vec<ValidationResult>,
    ) {
        let player_id = self
            .spawns
            .spawned_entity(client_id)
            .or_else(|| {
                self.bindings
                    .entities_for(client_id)
                    .and_then(|entities| entities.first().copied())
            });
        let record = TickDataRecord {
            tick_info: snapshot.clone(),
            actions,
            validations,
            player_id,
            tick_rate: Some(self.config.tick_rate),
        };
        self.history.save_tick_data(client_id, &record);
    }

    /// Flush accumulated activity against the snapshot just broadcast
    pub(crate) fn flush_tick_activity(&self, snapshot: &TickSnapshot) {
        for (client_id, activity) in self.activity.take_all() {
            self.save_tick_data(client_id, snapshot, activity.actions, activity.validations);
        }
    }
}
