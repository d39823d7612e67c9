//! Collaborator service interfaces
//!
//! The matchmaking control plane and the durable replay store live outside
//! this crate; the core only depends on these contracts. All of their
//! side effects during teardown are best-effort: queued, not awaited,
//! failures logged.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::replay::archive::TickDataRecord;
use crate::ClientId;

/// Boxed future returned by collaborator calls
pub type ServiceFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

/// Result of queueing a bot instance with the control plane
#[derive(Debug, Clone, Copy)]
pub struct InstanceInfo {
    /// The instance id doubles as the client id for the resulting
    /// connection
    pub instance_id: ClientId,
}

/// Remote bot instance control (the matchmaking service).
///
/// Every call is tolerant of failure: callers log and move on.
pub trait InstanceControl: Send + Sync {
    /// Queue a new instance of the given bot; on success the instance id
    /// becomes a client id awaiting connection
    fn start_instance(&self, bot_id: i64) -> ServiceFuture<InstanceInfo>;

    /// Ask the control plane to stop a running instance
    fn stop_instance(&self, instance_id: ClientId) -> ServiceFuture<()>;

    /// Where the instance's bot runtime is listening
    fn connection_info(&self, instance_id: ClientId) -> ServiceFuture<SocketAddr>;
}

/// Durable replay history sink.
///
/// `save_tick_data` is called once per broadcast tick per active client;
/// `save_history` finalizes a client's records when it is torn down.
pub trait HistoryWriter: Send + Sync {
    fn save_tick_data(&self, client_id: ClientId, record: &TickDataRecord);

    fn save_history(&self, client_id: ClientId) -> ServiceFuture<()>;
}

/// Run a fire-and-forget side effect: queued on the runtime, never awaited
/// by the caller, failures logged. Without a runtime (plain unit tests)
/// the task is dropped after being handed out, which still lets tests
/// assert it was attempted.
pub fn spawn_best_effort(
    name: impl Into<String>,
    fut: impl Future<Output = anyhow::Result<()>> + Send + 'static,
) {
    let name = name.into();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = fut.await {
                    warn!("Best-effort task '{}' failed: {e:#}", name);
                }
            });
        }
        Err(_) => debug!("No async runtime; best-effort task '{}' dropped", name),
    }
}

/// Instance control used when no control plane is configured: every call
/// fails softly
#[derive(Debug, Default)]
pub struct DisabledInstanceControl;

impl DisabledInstanceControl {
    pub fn new() -> Self {
        Self
    }
}

impl InstanceControl for DisabledInstanceControl {
    fn start_instance(&self, bot_id: i64) -> ServiceFuture<InstanceInfo> {
        Box::pin(async move { anyhow::bail!("instance control disabled; cannot start bot {bot_id}") })
    }

    fn stop_instance(&self, instance_id: ClientId) -> ServiceFuture<()> {
        Box::pin(async move {
            debug!("Instance control disabled; not stopping instance {instance_id}");
            Ok(())
        })
    }

    fn connection_info(&self, instance_id: ClientId) -> ServiceFuture<SocketAddr> {
        Box::pin(async move {
            anyhow::bail!("instance control disabled; no connection info for {instance_id}")
        })
    }
}

/// History writer persisting one JSON file per tick under
/// `<root>/<session>/<client_id>/`, readable back by the replay archive
/// loader
pub struct FsHistoryWriter {
    root: PathBuf,
    session: String,
}

impl FsHistoryWriter {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            session: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn client_dir(&self, client_id: ClientId) -> PathBuf {
        self.root.join(&self.session).join(client_id.to_string())
    }
}

impl HistoryWriter for FsHistoryWriter {
    fn save_tick_data(&self, client_id: ClientId, record: &TickDataRecord) {
        let dir = self.client_dir(client_id);
        let path = dir.join(format!("tick_{:08}.json", record.tick_info.tick));
        let body = match serde_json::to_vec(record) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize tick record for client {client_id}: {e}");
                return;
            }
        };
        spawn_best_effort(format!("save-tick-{client_id}"), async move {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, body).await?;
            Ok(())
        });
    }

    fn save_history(&self, client_id: ClientId) -> ServiceFuture<()> {
        let dir = self.client_dir(client_id);
        Box::pin(async move {
            tokio::fs::create_dir_all(&dir).await?;
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            let manifest = serde_json::json!({ "clientId": client_id, "records": names });
            tokio::fs::write(dir.join("history.json"), manifest.to_string()).await?;
            debug!("Saved replay history for client {client_id}");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_dir_is_per_session_per_client() {
        let writer = FsHistoryWriter::new(PathBuf::from("replay-data"));
        let dir = writer.client_dir(7);
        assert!(dir.starts_with("replay-data"));
        assert!(dir.ends_with("7"));

        // distinct sessions never collide on disk
        let other = FsHistoryWriter::new(PathBuf::from("replay-data"));
        assert_ne!(dir, other.client_dir(7));
    }

    #[tokio::test]
    async fn test_save_history_writes_manifest() {
        let root = std::env::temp_dir().join(format!("history-test-{}", uuid::Uuid::new_v4()));
        let writer = FsHistoryWriter::new(root.clone());
        let dir = writer.client_dir(3);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tick_00000050.json"), b"{}").unwrap();

        writer.save_history(3).await.unwrap();

        let manifest = std::fs::read_to_string(dir.join("history.json")).unwrap();
        assert!(manifest.contains("tick_00000050.json"));

        let _ = std::fs::remove_dir_all(&root);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording collaborator stubs: every call is recorded synchronously
    //! at the moment it is attempted, before any future is polled

    use super::*;
    use hashbrown::HashMap;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct RecordingInstanceControl {
        pub started: Mutex<Vec<i64>>,
        pub stopped: Mutex<Vec<ClientId>>,
        pub endpoints: Mutex<HashMap<ClientId, SocketAddr>>,
    }

    impl RecordingInstanceControl {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl InstanceControl for RecordingInstanceControl {
        fn start_instance(&self, bot_id: i64) -> ServiceFuture<InstanceInfo> {
            self.started.lock().push(bot_id);
            Box::pin(async move {
                Ok(InstanceInfo {
                    instance_id: bot_id,
                })
            })
        }

        fn stop_instance(&self, instance_id: ClientId) -> ServiceFuture<()> {
            self.stopped.lock().push(instance_id);
            Box::pin(async move { Ok(()) })
        }

        fn connection_info(&self, instance_id: ClientId) -> ServiceFuture<SocketAddr> {
            let endpoint = self.endpoints.lock().get(&instance_id).copied();
            Box::pin(async move {
                endpoint.ok_or_else(|| anyhow::anyhow!("no endpoint for {instance_id}"))
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingHistoryWriter {
        pub tick_records: Mutex<Vec<(ClientId, TickDataRecord)>>,
        pub history_saves: Mutex<Vec<ClientId>>,
    }

    impl RecordingHistoryWriter {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl HistoryWriter for RecordingHistoryWriter {
        fn save_tick_data(&self, client_id: ClientId, record: &TickDataRecord) {
            self.tick_records.lock().push((client_id, record.clone()));
        }

        fn save_history(&self, client_id: ClientId) -> ServiceFuture<()> {
            self.history_saves.lock().push(client_id);
            Box::pin(async move { Ok(()) })
        }
    }
}
