//! Wire protocol for bot connections
//!
//! Messages are JSON inside length-prefixed frames (see `framing`). Client
//! messages arrive in an envelope carrying the client's id and the token it
//! was handed for this run; server messages echo the per-client token so the
//! bot can pair responses with its own session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::sync::Arc;

use crate::sim::state::EntityState;
use crate::{ClientId, EntityId};

/// Errors raised while encoding or decoding protocol messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid UTF-8 payload")]
    InvalidUtf8,
}

/// Connection lifecycle requested at handshake time.
///
/// Managed connections are torn down automatically when the run stops;
/// persistent ones survive across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lifecycle {
    #[default]
    Managed,
    Persistent,
}

/// Messages from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientPayload {
    /// Identity + capabilities, first message on any connection
    Handshake(ClientHandshake),
    /// A test assertion outcome computed by the bot
    ValidationResult(ValidationResult),
    /// Request to perform an action through the bot's bound entities
    Request(ActionRequest),
    /// The bot is finished and wants its connection torn down
    Teardown,
}

/// Envelope around every inbound client message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Token proving the sender belongs to this run; checked against the
    /// session secret for everything except the handshake itself
    #[serde(default)]
    pub token: String,
    #[serde(rename = "clientId")]
    pub client_id: ClientId,
    #[serde(flatten)]
    pub payload: ClientPayload,
}

/// Messages from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerPayload {
    /// Handshake acknowledgement; after this the bot may start processing
    Handshake(HandshakeAck),
    /// Full per-tick state snapshot
    TickInfo(TickSnapshot),
    /// The entity spawned for this client and now bound to it
    AgentSpawned(AgentSpawned),
    /// Disconnect now
    Teardown,
}

/// Envelope around every outbound server message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// The client's own token, echoed back
    pub token: String,
    #[serde(flatten)]
    pub payload: ServerPayload,
}

/// Handshake message (client → server)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHandshake {
    pub bot_name: String,
    /// Whether the server should spawn an entity for this bot
    #[serde(default)]
    pub spawnable: bool,
    #[serde(default)]
    pub lifecycle: Option<Lifecycle>,
    /// Opaque character/loadout selection, echoed back in the ack
    #[serde(default)]
    pub character_config: BTreeMap<String, Value>,
    /// Token the client mints for us to echo in our messages
    #[serde(default)]
    pub client_token: String,
    /// Must equal the server's current session secret or the handshake is
    /// rejected
    #[serde(default)]
    pub session_token: String,
}

/// Handshake acknowledgement (server → client)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    /// The session secret the client must present on subsequent messages
    pub server_token: String,
    #[serde(default)]
    pub character_config: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Notification of the entity spawned for a client
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpawned {
    pub entity_id: EntityId,
}

/// Action request (client → server)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub input: BTreeMap<String, Value>,
    /// Optional specific target among the client's bound entities; the
    /// dispatch contract is broadcast-to-binding regardless
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<EntityId>,
}

/// Validation result (client → server)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Full state snapshot broadcast once per tick. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TickSnapshot {
    pub tick: i64,
    pub scene_id: String,
    pub entities: BTreeMap<EntityId, EntityState>,
}

/// A tick snapshot serialized exactly once per broadcast pass and shared by
/// every per-client send; only the thin envelope differs per client.
#[derive(Debug, Clone)]
pub struct PreparedTick {
    snapshot: Arc<TickSnapshot>,
    raw: Box<RawValue>,
}

impl PreparedTick {
    pub fn new(snapshot: TickSnapshot) -> Result<Self, ProtocolError> {
        let raw = RawValue::from_string(serde_json::to_string(&snapshot)?)?;
        Ok(Self {
            snapshot: Arc::new(snapshot),
            raw,
        })
    }

    pub fn tick(&self) -> i64 {
        self.snapshot.tick
    }

    pub fn snapshot(&self) -> &Arc<TickSnapshot> {
        &self.snapshot
    }

    pub fn raw(&self) -> &RawValue {
        &self.raw
    }
}

/// Borrowed envelope used for tick frames so the shared payload is written
/// through without re-serialization
#[derive(Serialize)]
struct RawTickEnvelope<'a> {
    token: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a RawValue,
}

/// Encode a server message (non-tick) into a JSON body
pub fn encode_server(token: &str, payload: &ServerPayload) -> Result<Vec<u8>, ProtocolError> {
    let envelope = ServerEnvelope {
        token: token.to_string(),
        payload: payload.clone(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Encode a tick frame reusing the shared pre-serialized snapshot
pub fn encode_tick(token: &str, tick: &PreparedTick) -> Result<Vec<u8>, ProtocolError> {
    let envelope = RawTickEnvelope {
        token,
        kind: "tickInfo",
        data: tick.raw(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode an inbound client message body
pub fn decode_client(bytes: &[u8]) -> Result<ClientEnvelope, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_handshake_envelope() {
        let body = json!({
            "token": "bot-token",
            "clientId": 17,
            "type": "handshake",
            "data": {
                "botName": "scout",
                "spawnable": true,
                "lifecycle": "PERSISTENT",
                "characterConfig": {"class": "mage"},
                "clientToken": "bot-token",
                "sessionToken": "secret"
            }
        });
        let envelope = decode_client(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.client_id, 17);
        match envelope.payload {
            ClientPayload::Handshake(hs) => {
                assert_eq!(hs.bot_name, "scout");
                assert!(hs.spawnable);
                assert_eq!(hs.lifecycle, Some(Lifecycle::Persistent));
                assert_eq!(hs.session_token, "secret");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_decode_teardown_without_data() {
        let body = json!({"token": "t", "clientId": 3, "type": "teardown"});
        let envelope = decode_client(body.to_string().as_bytes()).unwrap();
        assert!(matches!(envelope.payload, ClientPayload::Teardown));
    }

    #[test]
    fn test_decode_action_request_defaults() {
        let body = json!({
            "token": "t",
            "clientId": 3,
            "type": "request",
            "data": {"action": "teleport"}
        });
        let envelope = decode_client(body.to_string().as_bytes()).unwrap();
        match envelope.payload {
            ClientPayload::Request(req) => {
                assert_eq!(req.action, "teleport");
                assert!(req.input.is_empty());
                assert!(req.target_id.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_lifecycle_wire_names() {
        assert_eq!(
            serde_json::to_string(&Lifecycle::Managed).unwrap(),
            "\"MANAGED\""
        );
        assert_eq!(
            serde_json::from_str::<Lifecycle>("\"PERSISTENT\"").unwrap(),
            Lifecycle::Persistent
        );
    }

    #[test]
    fn test_tick_envelope_shares_payload() {
        let mut snapshot = TickSnapshot {
            tick: 100,
            scene_id: "arena".into(),
            entities: BTreeMap::new(),
        };
        snapshot.entities.insert(5, EntityState::new());
        let prepared = PreparedTick::new(snapshot).unwrap();

        let frame_a = encode_tick("token-a", &prepared).unwrap();
        let frame_b = encode_tick("token-b", &prepared).unwrap();

        let a: Value = serde_json::from_slice(&frame_a).unwrap();
        let b: Value = serde_json::from_slice(&frame_b).unwrap();
        assert_eq!(a["type"], "tickInfo");
        assert_eq!(a["data"]["tick"], 100);
        assert_eq!(a["data"], b["data"]);
        assert_ne!(a["token"], b["token"]);
    }

    #[test]
    fn test_snapshot_entity_keys_roundtrip() {
        let mut snapshot = TickSnapshot {
            tick: 1,
            scene_id: "menu".into(),
            entities: BTreeMap::new(),
        };
        snapshot.entities.insert(-4, EntityState::new());
        snapshot.entities.insert(12, EntityState::new());

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: TickSnapshot = serde_json::from_str(&json).unwrap();
        assert!(back.entities.contains_key(&-4));
        assert!(back.entities.contains_key(&12));
    }

    #[test]
    fn test_server_ack_shape() {
        let ack = ServerPayload::Handshake(HandshakeAck {
            server_token: "secret".into(),
            character_config: BTreeMap::new(),
            error: None,
        });
        let bytes = encode_server("bot-token", &ack).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "handshake");
        assert_eq!(value["token"], "bot-token");
        assert_eq!(value["data"]["serverToken"], "secret");
        assert!(value["data"].get("error").is_none());
    }
}
