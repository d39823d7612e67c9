//! The bot server core
//!
//! `BotServer` is the explicit context object for one running session:
//! connection registry, status board, task queues, agent bindings,
//! validation ledger, and the collaborator services. It is constructed
//! once, shared as an `Arc`, and passed to everything that needs it; there
//! are no process-global singletons, so tests can run isolated sessions
//! side by side.
//!
//! Threading: all fields are safe to touch from transport callbacks, but
//! scene mutation only ever happens inside main-thread tasks drained by
//! the `SimulationDriver`.

pub mod broadcast;
pub mod driver;
pub mod handshake;
pub mod intake;
pub mod services;
pub mod spawn;
pub mod tasks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::net::connection::{
    BotStatus, Connection, ConnectionKind, ConnectionRegistry, StatusBoard,
};
use crate::net::protocol::{ClientEnvelope, ClientPayload, Lifecycle};
use crate::net::transport::{BotTransport, LocalTransport, MessageSink, RemoteTransport};
use crate::server::intake::{TickActivityLog, ValidationLedger};
use crate::server::services::{spawn_best_effort, HistoryWriter, InstanceControl};
use crate::server::spawn::{AgentBindings, SpawnQueue};
use crate::server::tasks::{TaskContext, TaskQueues};
use crate::sim::scene::SimScene;
use crate::sim::state::MergePolicy;
use crate::{ClientId, CONTROL_CLIENT};

/// One running session's server context
pub struct BotServer {
    pub(crate) config: ServerConfig,
    pub(crate) session_secret: RwLock<String>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) status: Arc<StatusBoard>,
    pub(crate) tasks: TaskQueues,
    pub(crate) validations: ValidationLedger,
    pub(crate) activity: TickActivityLog,
    pub(crate) bindings: AgentBindings,
    pub(crate) spawns: SpawnQueue,
    pub(crate) control: Arc<dyn InstanceControl>,
    pub(crate) history: Arc<dyn HistoryWriter>,
    pub(crate) merge_policy: MergePolicy,
    run_started: AtomicBool,
    self_ref: Weak<BotServer>,
}

impl BotServer {
    pub fn new(
        config: ServerConfig,
        control: Arc<dyn InstanceControl>,
        history: Arc<dyn HistoryWriter>,
    ) -> Arc<Self> {
        let secret = config
            .session_secret
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Arc::new_cyclic(|weak| Self {
            config,
            session_secret: RwLock::new(secret),
            registry: ConnectionRegistry::new(),
            status: Arc::new(StatusBoard::new()),
            tasks: TaskQueues::new(),
            validations: ValidationLedger::new(),
            activity: TickActivityLog::new(),
            bindings: AgentBindings::new(),
            spawns: SpawnQueue::new(),
            control,
            history,
            merge_policy: MergePolicy::default(),
            run_started: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskQueues {
        &self.tasks
    }

    pub fn status_board(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    pub fn bot_status(&self, client_id: ClientId) -> BotStatus {
        self.status.status(client_id)
    }

    pub fn add_status_listener(
        &self,
        client_id: ClientId,
        listener: impl Fn(BotStatus) + Send + Sync + 'static,
    ) {
        self.status.add_listener(client_id, listener);
    }

    /// The secret bots must present; regenerated when the session shuts
    /// down so stale bots cannot rejoin
    pub fn session_secret(&self) -> String {
        self.session_secret.read().clone()
    }

    fn rotate_session_secret(&self) {
        *self.session_secret.write() = uuid::Uuid::new_v4().to_string();
    }

    /// Register a client connection. Idempotent: re-registering an
    /// existing id returns the existing record untouched.
    pub fn add_connection(&self, client_id: ClientId, kind: ConnectionKind) -> Arc<Connection> {
        debug!("Adding client connection entry for client: {}", client_id);
        let conn = self.registry.add_with(client_id, || {
            let transport: Arc<dyn BotTransport> = match kind {
                ConnectionKind::Remote => Arc::new(RemoteTransport::new(
                    client_id,
                    self.control.clone(),
                    self.config.connect_timeout,
                )),
                ConnectionKind::Local => Arc::new(LocalTransport::new()),
            };
            Connection::new(client_id, kind, transport)
        });
        self.validations.ensure(client_id);
        conn
    }

    /// Register with a caller-supplied transport (local runtimes, tests)
    pub fn add_connection_with_transport(
        &self,
        client_id: ClientId,
        kind: ConnectionKind,
        transport: Arc<dyn BotTransport>,
    ) -> Arc<Connection> {
        let conn = self
            .registry
            .add_with(client_id, || Connection::new(client_id, kind, transport));
        self.validations.ensure(client_id);
        conn
    }

    pub fn get_connection(&self, client_id: ClientId) -> Option<Arc<Connection>> {
        self.registry.get(client_id)
    }

    pub fn is_client_connected(&self, client_id: ClientId) -> bool {
        self.registry
            .get(client_id)
            .map(|conn| conn.connected())
            .unwrap_or(false)
    }

    /// True while any bot is connected to this session
    pub fn has_bots_running(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Tear one client out of the registry: teardown notice, transport
    /// close, then the kind-specific best-effort side effect (remote:
    /// instance stop; local: replay history save). Neither is awaited;
    /// they may still be in flight after this returns.
    pub fn end_connection(&self, client_id: ClientId) {
        if let Some(conn) = self.registry.remove(client_id) {
            conn.send_teardown();
            conn.close();
            match conn.kind {
                ConnectionKind::Remote => {
                    let control = self.control.clone();
                    spawn_best_effort(format!("stop-instance-{client_id}"), async move {
                        control.stop_instance(client_id).await
                    });
                }
                ConnectionKind::Local => {
                    let history = self.history.clone();
                    spawn_best_effort(format!("save-history-{client_id}"), async move {
                        history.save_history(client_id).await
                    });
                }
            }
        } else {
            // not ours to know about
            self.status.set_status(client_id, BotStatus::Unknown);
        }

        self.bindings.remove(client_id);
        self.status.remove_client(client_id);
        self.tasks.remove(client_id);
        self.activity.remove(client_id);
        // the validation ledger is kept until shutdown so results stay
        // readable after bots finish
    }

    /// End every connection, enumerating a stable snapshot of ids so
    /// concurrent registrations are neither missed nor double-processed
    pub fn end_all(&self) {
        for client_id in self.registry.ids() {
            self.end_connection(client_id);
        }
    }

    /// A client asked to be torn down (or its transport reported one)
    pub fn handle_client_teardown(&self, client_id: ClientId) {
        self.status.set_status(client_id, BotStatus::TearingDown);
        self.tasks.enqueue(
            client_id,
            Box::new(move |ctx| {
                let TaskContext { server, scene } = &mut *ctx;
                server.teardown_client_now(&mut **scene, client_id);
                Ok(())
            }),
        );
    }

    /// Main-thread teardown: despawn the client's entity, then end the
    /// connection
    pub(crate) fn teardown_client_now(&self, scene: &mut dyn SimScene, client_id: ClientId) {
        self.teardown_bot_now(scene, client_id);
        self.end_connection(client_id);
    }

    pub fn run_started(&self) -> bool {
        self.run_started.load(Ordering::SeqCst)
    }

    /// Queue a run start on the control queue
    pub fn request_start_run(&self) {
        self.tasks.enqueue(
            CONTROL_CLIENT,
            Box::new(|ctx| {
                let TaskContext { server, scene } = &mut *ctx;
                server.start_run_now(&mut **scene);
                Ok(())
            }),
        );
    }

    /// Queue a run stop on the control queue
    pub fn request_stop_run(&self) {
        self.tasks.enqueue(
            CONTROL_CLIENT,
            Box::new(|ctx| {
                let TaskContext { server, scene } = &mut *ctx;
                server.stop_run_now(&mut **scene);
                Ok(())
            }),
        );
    }

    /// Start a run: stop anything stale, then queue every configured
    /// managed bot with the control plane. Each successful start registers
    /// a remote connection for the driver's reconnect pass to dial.
    pub(crate) fn start_run_now(&self, scene: &mut dyn SimScene) {
        self.stop_run_now(scene);
        info!("Starting managed bots");
        for bot_id in self.config.managed_bots.clone() {
            let control = self.control.clone();
            let server = self.self_ref.clone();
            spawn_best_effort(format!("start-bot-{bot_id}"), async move {
                match control.start_instance(bot_id).await {
                    Ok(info) => {
                        if let Some(server) = server.upgrade() {
                            server.add_connection(info.instance_id, ConnectionKind::Remote);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Error starting botId: {}, starting without them", bot_id);
                        Err(e)
                    }
                }
            });
        }
        self.run_started.store(true, Ordering::SeqCst);
    }

    /// Stop the run: tear down every Managed connection (Persistent ones
    /// survive), then clean up anything still spawned
    pub(crate) fn stop_run_now(&self, scene: &mut dyn SimScene) {
        info!("Stopping spawnable bots");
        self.run_started.store(false, Ordering::SeqCst);

        for (client_id, conn) in self.registry.snapshot() {
            if conn.lifecycle() == Lifecycle::Managed {
                self.teardown_client_now(scene, client_id);
            }
        }

        self.stop_spawned_now(scene);
    }

    /// Full session shutdown: stop the run, end every connection, clear
    /// all per-session state, and rotate the session secret. Main thread
    /// only.
    pub fn shutdown_now(&self, scene: &mut dyn SimScene) {
        info!("Stopping bot client connections");
        self.stop_run_now(scene);
        self.end_all();
        self.registry.clear();
        self.validations.clear();
        self.activity.clear();
        self.status.clear();
        self.tasks.clear();
        self.rotate_session_secret();
    }

    fn check_token(&self, client_id: ClientId, token: &str) -> bool {
        if token == self.session_secret() {
            true
        } else {
            warn!("Client id {} made call with invalid token", client_id);
            false
        }
    }
}

impl MessageSink for BotServer {
    /// Entry point for inbound messages from transport reader tasks; only
    /// enqueues, never touches the scene
    fn deliver(&self, envelope: ClientEnvelope) {
        let client_id = envelope.client_id;
        match envelope.payload {
            ClientPayload::Handshake(handshake) => self.handle_handshake(client_id, handshake),
            ClientPayload::ValidationResult(result) => {
                if self.check_token(client_id, &envelope.token) {
                    self.handle_validation_result(client_id, result);
                }
            }
            ClientPayload::Request(request) => {
                if self.check_token(client_id, &envelope.token) {
                    self.handle_action_request(client_id, request);
                }
            }
            ClientPayload::Teardown => self.handle_client_teardown(client_id),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::testing::RecordingTransport;
    use crate::server::testing::{run_steps, test_server, test_server_with};
    use crate::sim::headless::HeadlessScene;

    #[test]
    fn test_add_connection_is_idempotent() {
        let server = test_server();
        let transport = RecordingTransport::new();
        let first = server.add_connection_with_transport(5, ConnectionKind::Remote, transport);
        let second = server.add_connection(5, ConnectionKind::Remote);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(server.registry.count(), 1);
    }

    #[test]
    fn test_end_connection_remote_requests_instance_stop() {
        let (server, control, _history) = test_server_with();
        server.add_connection_with_transport(5, ConnectionKind::Remote, RecordingTransport::new());

        server.end_connection(5);

        assert_eq!(*control.stopped.lock(), vec![5]);
    }

    #[test]
    fn test_end_connection_local_attempts_history_save() {
        let (server, control, history) = test_server_with();
        server.add_connection_with_transport(6, ConnectionKind::Local, RecordingTransport::new());

        server.end_connection(6);

        assert_eq!(*history.history_saves.lock(), vec![6]);
        assert!(control.stopped.lock().is_empty());
    }

    #[test]
    fn test_teardown_cleanup_leaves_unknown() {
        let server = test_server();
        let transport = RecordingTransport::new();
        server.add_connection_with_transport(5, ConnectionKind::Remote, transport.clone());
        server.bindings.bind_empty(5);
        server.status.set_status(5, BotStatus::Running);
        server
            .tasks
            .enqueue(5, Box::new(|_ctx| Ok(())));

        server.end_connection(5);

        assert_eq!(server.bot_status(5), BotStatus::Unknown);
        assert!(server.registry.get(5).is_none());
        assert!(!server.bindings.contains(5));
        assert!(!server.tasks.contains(5));
        // the teardown notice went out before the transport closed
        assert!(!transport.sent().is_empty());
        assert!(!transport.connected());
    }

    #[test]
    fn test_end_connection_unknown_client_publishes_unknown() {
        let server = test_server();
        server.status.set_status(42, BotStatus::Running);
        server.registry.remove(42); // simulate an id we never owned

        server.end_connection(42);
        assert_eq!(server.bot_status(42), BotStatus::Unknown);
    }

    #[test]
    fn test_end_all_ends_everything() {
        let server = test_server();
        for id in 1..=3 {
            server.add_connection_with_transport(
                id,
                ConnectionKind::Remote,
                RecordingTransport::new(),
            );
        }

        server.end_all();
        assert_eq!(server.registry.count(), 0);
    }

    #[test]
    fn test_client_teardown_publishes_tearing_down_then_unknown() {
        let server = test_server();
        let mut scene = HeadlessScene::new("test");
        server.add_connection_with_transport(5, ConnectionKind::Remote, RecordingTransport::new());

        server.handle_client_teardown(5);
        assert_eq!(server.bot_status(5), BotStatus::TearingDown);

        run_steps(&server, &mut scene, 1);
        assert_eq!(server.bot_status(5), BotStatus::Unknown);
        assert!(server.registry.get(5).is_none());
    }

    #[test]
    fn test_shutdown_clears_state_and_rotates_secret() {
        let server = test_server();
        let mut scene = HeadlessScene::new("test");
        server.add_connection_with_transport(1, ConnectionKind::Remote, RecordingTransport::new());
        server.validations.append(
            1,
            crate::net::protocol::ValidationResult {
                name: "check".into(),
                passed: false,
                message: None,
            },
        );
        let secret_before = server.session_secret();

        server.shutdown_now(&mut scene);

        assert!(!server.has_bots_running());
        assert!(server.failed_validations_for(1).is_empty());
        assert_ne!(server.session_secret(), secret_before);
    }

    #[tokio::test]
    async fn test_start_run_queues_managed_bots() {
        let control = crate::server::services::testing::RecordingInstanceControl::new();
        let history = crate::server::services::testing::RecordingHistoryWriter::new();
        let mut config = crate::server::testing::test_config();
        config.managed_bots = vec![11, 12];
        let server = BotServer::new(config, control.clone(), history);
        let mut scene = HeadlessScene::new("test");

        server.start_run_now(&mut scene);
        assert!(server.run_started());
        assert_eq!(*control.started.lock(), vec![11, 12]);

        // the spawned best-effort tasks register connections as instances
        // come up
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(server.registry.get(11).is_some());
        assert!(server.registry.get(12).is_some());
    }

    #[test]
    fn test_stop_run_keeps_persistent_connections() {
        let server = test_server();
        let mut scene = HeadlessScene::new("test");
        let managed =
            server.add_connection_with_transport(1, ConnectionKind::Remote, RecordingTransport::new());
        let persistent =
            server.add_connection_with_transport(2, ConnectionKind::Remote, RecordingTransport::new());
        managed.set_lifecycle(Lifecycle::Managed);
        persistent.set_lifecycle(Lifecycle::Persistent);

        server.stop_run_now(&mut scene);

        assert!(server.registry.get(1).is_none());
        assert!(server.registry.get(2).is_some());
    }
}
