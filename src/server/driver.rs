//! The simulation driver
//!
//! Exactly one logical thread steps the simulation. Each step: run a
//! reconnect pass for down links (rate-limited to ~once per second),
//! queue pending spawns while a run is active, drain at most one task per
//! client, then advance the step counter and broadcast a snapshot every
//! `tick_rate` steps. All scene mutation in the process happens inside
//! this loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::net::connection::BotStatus;
use crate::net::transport::MessageSink;
use crate::server::tasks::TaskContext;
use crate::server::BotServer;
use crate::sim::scene::SimScene;

pub struct SimulationDriver {
    server: Arc<BotServer>,
    scene: Box<dyn SimScene>,
    step: i64,
    last_reconnect: Option<Instant>,
}

impl SimulationDriver {
    pub fn new(server: Arc<BotServer>, scene: Box<dyn SimScene>) -> Self {
        Self {
            server,
            scene,
            step: 0,
            last_reconnect: None,
        }
    }

    pub fn server(&self) -> &Arc<BotServer> {
        &self.server
    }

    pub fn scene_mut(&mut self) -> &mut dyn SimScene {
        &mut *self.scene
    }

    /// Simulation steps executed so far; the broadcast tick number is this
    /// counter at broadcast time
    pub fn step_count(&self) -> i64 {
        self.step
    }

    /// One simulation step
    pub fn step(&mut self) {
        self.reconnect_pass();

        if self.server.run_started() {
            self.server.request_spawn_pending();
        }

        let mut ctx = TaskContext {
            server: &self.server,
            scene: &mut *self.scene,
        };
        self.server.tasks().drain_step(&mut ctx);

        self.step += 1;
        if self.step % self.server.config().tick_rate == 0 {
            self.server.broadcast_tick(self.step, &*self.scene);
        }
    }

    /// Dial any registered connection whose link is down. Evaluated at
    /// most once per reconnect interval, not every step.
    fn reconnect_pass(&mut self) {
        if let Some(last) = self.last_reconnect {
            if last.elapsed() < self.server.config().reconnect_interval {
                return;
            }
        }
        self.last_reconnect = Some(Instant::now());

        let sink: Arc<dyn MessageSink> = self.server.clone();
        for (client_id, conn) in self.server.registry().snapshot() {
            if !conn.connected() && conn.transport().connect(sink.clone()) {
                debug!("Dialing bot runtime for client: {}", client_id);
                self.server
                    .status_board()
                    .set_status(client_id, BotStatus::Connecting);
            }
        }
    }

    /// Drive the loop until `shutdown` resolves, then tear the session
    /// down gracefully on this same logical thread
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.server.config().step_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Simulation loop started at {} Hz, broadcasting every {} steps",
            self.server.config().step_rate,
            self.server.config().tick_rate
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.step(),
                _ = &mut shutdown => break,
            }
        }

        self.server.shutdown_now(&mut *self.scene);
        info!("Simulation loop stopped");
    }
}
