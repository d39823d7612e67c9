//! Main-thread task queues
//!
//! Everything that arrives asynchronously (handshakes, action requests,
//! teardown notices, run control) becomes a task on a per-client FIFO.
//! The simulation driver drains AT MOST ONE task per client per step, so
//! per-step cost is bounded by the number of clients regardless of how
//! deep any one client's backlog gets, and no client can starve the others.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::error;

use crate::server::BotServer;
use crate::sim::scene::SimScene;
use crate::ClientId;

/// Execution context handed to every main-thread task
pub struct TaskContext<'a> {
    pub server: &'a Arc<BotServer>,
    pub scene: &'a mut dyn SimScene,
}

/// A deferred action applied on the simulation thread. Errors are caught
/// and logged by the drain; they never stop other clients' queues.
pub type MainThreadTask = Box<dyn FnOnce(&mut TaskContext) -> anyhow::Result<()> + Send>;

struct TaskQueue {
    tx: Sender<MainThreadTask>,
    rx: Receiver<MainThreadTask>,
}

impl TaskQueue {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

/// Per-client FIFO queues, created on first use and discarded as a unit at
/// teardown
#[derive(Default)]
pub struct TaskQueues {
    queues: RwLock<HashMap<ClientId, TaskQueue>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, client_id: ClientId, task: MainThreadTask) {
        let tx = {
            let mut queues = self.queues.write();
            queues
                .entry(client_id)
                .or_insert_with(TaskQueue::new)
                .tx
                .clone()
        };
        // the receiver lives in the map, so this can only fail if the
        // client was torn down between the lookup and the send; the task
        // dies with the queue in that case
        let _ = tx.send(task);
    }

    /// Run at most one task for every client with a non-empty queue.
    /// Receivers are snapshotted so tasks may enqueue (or tear down
    /// clients) without deadlocking the drain.
    pub fn drain_step(&self, ctx: &mut TaskContext<'_>) {
        let receivers: SmallVec<[(ClientId, Receiver<MainThreadTask>); 8]> = self
            .queues
            .read()
            .iter()
            .map(|(id, queue)| (*id, queue.rx.clone()))
            .collect();

        for (client_id, rx) in receivers {
            if let Ok(task) = rx.try_recv() {
                if let Err(e) = task(ctx) {
                    error!("Task for client {} failed: {e:#}", client_id);
                }
            }
        }
    }

    /// Discard a client's queue, dropping any tasks still in it
    pub fn remove(&self, client_id: ClientId) {
        self.queues.write().remove(&client_id);
    }

    pub fn clear(&self) {
        self.queues.write().clear();
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.queues.read().contains_key(&client_id)
    }

    pub fn depth(&self, client_id: ClientId) -> usize {
        self.queues
            .read()
            .get(&client_id)
            .map(|q| q.rx.len())
            .unwrap_or(0)
    }
}
