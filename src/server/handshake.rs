//! Client handshake and agent binding
//!
//! The whole sequence runs as one main-thread task: validate the session
//! secret, normalize the bot name, record the lifecycle, set up the
//! binding, publish `Connected` strictly before any outbound
//! acknowledgement, spawn or ack, publish `Running`. A failure anywhere is
//! logged as a warning and the client keeps whatever status it last
//! reached; there is no rollback.

use std::collections::BTreeMap;

use anyhow::anyhow;
use serde_json::Value;
use tracing::{debug, warn};

use crate::net::connection::BotStatus;
use crate::net::protocol::{ClientHandshake, HandshakeAck, ServerPayload};
use crate::server::spawn::BotSeat;
use crate::server::tasks::TaskContext;
use crate::server::BotServer;
use crate::sim::scene::SimScene;
use crate::ClientId;

impl BotServer {
    /// Queue the handshake for main-thread processing
    pub fn handle_handshake(&self, client_id: ClientId, handshake: ClientHandshake) {
        self.tasks.enqueue(
            client_id,
            Box::new(move |ctx| {
                let TaskContext { server, scene } = &mut *ctx;
                if let Err(e) = server.process_handshake(&mut **scene, client_id, handshake) {
                    warn!("Failed to process handshake from clientId: {client_id} - {e:#}");
                }
                Ok(())
            }),
        );
    }

    pub(crate) fn handshake_ack(&self, character_config: BTreeMap<String, Value>) -> HandshakeAck {
        HandshakeAck {
            server_token: self.session_secret(),
            character_config,
            error: None,
        }
    }

    fn process_handshake(
        &self,
        scene: &mut dyn SimScene,
        client_id: ClientId,
        handshake: ClientHandshake,
    ) -> anyhow::Result<()> {
        if handshake.session_token != self.session_secret() {
            warn!("A client tried to connect/handshake with an invalid session token");
            return Ok(());
        }

        let conn = self
            .registry
            .get(client_id)
            .ok_or_else(|| anyhow!("handshake from unregistered client {client_id}"))?;

        let lifecycle = handshake.lifecycle.unwrap_or_default();
        conn.set_lifecycle(lifecycle);

        // make the name unique across clients without a global registry;
        // a bot that already appended its id keeps its name as-is
        let mut bot_name = handshake.bot_name;
        let suffix = format!("-{client_id}");
        if !bot_name.ends_with(&suffix) {
            bot_name.push_str(&suffix);
        }

        conn.set_token(handshake.client_token);

        if !handshake.spawnable && lifecycle == crate::net::protocol::Lifecycle::Persistent {
            // menu / human-simulator bot: acts through the one
            // human-controlled overlay entity
            self.bindings
                .bind_overlay(client_id, scene.overlay_entity());
        } else {
            self.bindings.bind_empty(client_id);
        }

        // listeners observing Connected must see it before any traffic
        // flows back to the bot
        self.status.set_status(client_id, BotStatus::Connected);

        if handshake.spawnable {
            self.seat_bot(BotSeat {
                client_id,
                bot_name,
                character_config: handshake.character_config,
            });
        } else {
            debug!("Sending handshake response to client id: {client_id}");
            conn.send_payload(&ServerPayload::Handshake(
                self.handshake_ack(handshake.character_config),
            ));
        }

        self.status.set_status(client_id, BotStatus::Running);
        Ok(())
    }
}
