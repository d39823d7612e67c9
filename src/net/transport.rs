//! Bot transports
//!
//! A transport is one bot's link abstraction. Remote bots run out of
//! process and are dialed over TCP using connection info from the instance
//! control service; local bots run in-process and receive typed messages
//! over a channel. Sends are non-blocking best-effort: a `false` return
//! means the link is gone and the caller should expect a reconnect pass to
//! pick it up later.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::net::connection::ConnectionKind;
use crate::net::framing;
use crate::net::protocol::{
    self, AgentSpawned, ClientEnvelope, HandshakeAck, PreparedTick, ServerPayload, TickSnapshot,
};
use crate::server::services::InstanceControl;
use crate::ClientId;

/// Receives inbound client messages from transport reader tasks.
///
/// Implemented by the server; `deliver` only enqueues and returns.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, envelope: ClientEnvelope);
}

/// One bot's link. All methods are safe to call from any thread.
pub trait BotTransport: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    fn connected(&self) -> bool;

    /// Begin (re)establishing the link if it is down. Non-blocking.
    /// Returns true when a dial was actually initiated.
    fn connect(&self, sink: Arc<dyn MessageSink>) -> bool;

    /// Send one tick snapshot, sharing the pre-serialized payload
    fn send_tick(&self, token: &str, tick: &PreparedTick) -> bool;

    /// Send a non-tick server message
    fn send_payload(&self, token: &str, payload: &ServerPayload) -> bool;

    fn close(&self);
}

struct LinkState {
    connecting: bool,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    io_tasks: Vec<JoinHandle<()>>,
}

struct RemoteShared {
    client_id: ClientId,
    control: Arc<dyn InstanceControl>,
    connect_timeout: Duration,
    link: Mutex<LinkState>,
}

impl RemoteShared {
    fn drop_link(&self) {
        let mut link = self.link.lock();
        link.writer = None;
        for task in link.io_tasks.drain(..) {
            task.abort();
        }
    }
}

/// TCP transport for a bot running out of process.
///
/// The server dials the bot: connection info comes from the instance
/// control service, and a failed or dropped link is simply left down until
/// the driver's next reconnect pass calls `connect` again.
pub struct RemoteTransport {
    shared: Arc<RemoteShared>,
}

impl RemoteTransport {
    pub fn new(
        client_id: ClientId,
        control: Arc<dyn InstanceControl>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(RemoteShared {
                client_id,
                control,
                connect_timeout,
                link: Mutex::new(LinkState {
                    connecting: false,
                    writer: None,
                    io_tasks: Vec::new(),
                }),
            }),
        }
    }

    fn send_bytes(&self, body: Vec<u8>) -> bool {
        let mut link = self.shared.link.lock();
        match &link.writer {
            Some(writer) => {
                if writer.send(body).is_ok() {
                    true
                } else {
                    debug!(
                        "Client Id: {} socket closed, need to re-establish connection",
                        self.shared.client_id
                    );
                    link.writer = None;
                    false
                }
            }
            None => false,
        }
    }
}

impl BotTransport for RemoteTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Remote
    }

    fn connected(&self) -> bool {
        self.shared.link.lock().writer.is_some()
    }

    fn connect(&self, sink: Arc<dyn MessageSink>) -> bool {
        {
            let mut link = self.shared.link.lock();
            if link.connecting || link.writer.is_some() {
                return false;
            }
            link.connecting = true;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let addr = match shared.control.connection_info(shared.client_id).await {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(
                        "No connection info yet for client {}: {e:#}",
                        shared.client_id
                    );
                    shared.link.lock().connecting = false;
                    return;
                }
            };

            info!(
                "Connecting to bot at {} for ClientId: {}",
                addr, shared.client_id
            );
            let stream =
                match tokio::time::timeout(shared.connect_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        debug!(
                            "Failed to connect bot socket to {} for client {}: {}",
                            addr, shared.client_id, e
                        );
                        shared.link.lock().connecting = false;
                        return;
                    }
                    Err(_) => {
                        info!(
                            "Connection TIMED OUT to bot at {} for ClientId: {}",
                            addr, shared.client_id
                        );
                        shared.link.lock().connecting = false;
                        return;
                    }
                };

            let (mut read_half, mut write_half) = stream.into_split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

            let writer_shared = shared.clone();
            let writer_task = tokio::spawn(async move {
                while let Some(body) = rx.recv().await {
                    if let Err(e) = framing::write_message(&mut write_half, &body).await {
                        warn!(
                            "Client Id: {} socket error, dropping link: {}",
                            writer_shared.client_id, e
                        );
                        writer_shared.link.lock().writer = None;
                        break;
                    }
                }
            });

            let reader_shared = shared.clone();
            let reader_task = tokio::spawn(async move {
                loop {
                    match framing::read_message(&mut read_half).await {
                        Ok(bytes) => match protocol::decode_client(&bytes) {
                            Ok(envelope) => sink.deliver(envelope),
                            Err(e) => {
                                warn!(
                                    "Dropping malformed message from client {}: {}",
                                    reader_shared.client_id, e
                                );
                            }
                        },
                        Err(framing::FramingError::ConnectionClosed) => {
                            debug!(
                                "Client Id: {} socket closed by peer",
                                reader_shared.client_id
                            );
                            reader_shared.link.lock().writer = None;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                "Client Id: {} socket read error: {}",
                                reader_shared.client_id, e
                            );
                            reader_shared.link.lock().writer = None;
                            break;
                        }
                    }
                }
            });

            let mut link = shared.link.lock();
            link.writer = Some(tx);
            link.io_tasks = vec![writer_task, reader_task];
            link.connecting = false;
        });

        true
    }

    fn send_tick(&self, token: &str, tick: &PreparedTick) -> bool {
        if !self.connected() {
            return false;
        }
        match protocol::encode_tick(token, tick) {
            Ok(body) => self.send_bytes(body),
            Err(e) => {
                warn!("Failed to encode tick frame: {}", e);
                false
            }
        }
    }

    fn send_payload(&self, token: &str, payload: &ServerPayload) -> bool {
        if !self.connected() {
            return false;
        }
        match protocol::encode_server(token, payload) {
            Ok(body) => self.send_bytes(body),
            Err(e) => {
                warn!("Failed to encode server message: {}", e);
                false
            }
        }
    }

    fn close(&self) {
        self.shared.drop_link();
        self.shared.link.lock().connecting = false;
    }
}

/// Typed messages handed to an in-process bot runner
#[derive(Debug, Clone)]
pub enum LocalServerMessage {
    Handshake(HandshakeAck),
    Tick(Arc<TickSnapshot>),
    AgentSpawned(AgentSpawned),
    Teardown,
}

/// Channel transport for a bot running inside this process.
///
/// The local runtime attaches a runner channel after starting the bot; no
/// serialization happens on this path.
#[derive(Default)]
pub struct LocalTransport {
    runner: Mutex<Option<mpsc::UnboundedSender<LocalServerMessage>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_runner(&self, runner: mpsc::UnboundedSender<LocalServerMessage>) {
        *self.runner.lock() = Some(runner);
    }

    fn send_local(&self, message: LocalServerMessage) -> bool {
        let mut runner = self.runner.lock();
        match &*runner {
            Some(tx) => {
                if tx.send(message).is_ok() {
                    true
                } else {
                    *runner = None;
                    false
                }
            }
            None => false,
        }
    }
}

impl BotTransport for LocalTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Local
    }

    fn connected(&self) -> bool {
        self.runner.lock().is_some()
    }

    fn connect(&self, _sink: Arc<dyn MessageSink>) -> bool {
        // local runners attach themselves when the runtime starts the bot
        false
    }

    fn send_tick(&self, _token: &str, tick: &PreparedTick) -> bool {
        self.send_local(LocalServerMessage::Tick(tick.snapshot().clone()))
    }

    fn send_payload(&self, _token: &str, payload: &ServerPayload) -> bool {
        let message = match payload {
            ServerPayload::Handshake(ack) => LocalServerMessage::Handshake(ack.clone()),
            ServerPayload::TickInfo(snapshot) => {
                LocalServerMessage::Tick(Arc::new(snapshot.clone()))
            }
            ServerPayload::AgentSpawned(spawned) => LocalServerMessage::AgentSpawned(*spawned),
            ServerPayload::Teardown => LocalServerMessage::Teardown,
        };
        self.send_local(message)
    }

    fn close(&self) {
        *self.runner.lock() = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_transport_starts_detached() {
        let transport = LocalTransport::new();
        assert!(!transport.connected());

        let prepared = PreparedTick::new(TickSnapshot::default()).unwrap();
        assert!(!transport.send_tick("token", &prepared));
    }

    #[tokio::test]
    async fn test_local_transport_delivers_typed_messages() {
        let transport = LocalTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach_runner(tx);
        assert!(transport.connected());

        let ack = HandshakeAck {
            server_token: "secret".into(),
            character_config: Default::default(),
            error: None,
        };
        assert!(transport.send_payload("token", &ServerPayload::Handshake(ack)));

        match rx.recv().await {
            Some(LocalServerMessage::Handshake(ack)) => assert_eq!(ack.server_token, "secret"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_transport_send_fails_after_runner_drops() {
        let transport = LocalTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach_runner(tx);
        drop(rx);

        assert!(!transport.send_payload("token", &ServerPayload::Teardown));
        // the dead runner is forgotten, as if never attached
        assert!(!transport.connected());
    }
}
