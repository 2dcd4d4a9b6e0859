use std::sync::Arc;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TeleportConfig;
use crate::session::clock_sync::ClockSync;
use crate::session::message::{Message, MessageType};
use crate::session::registry::{Deserializer, MessageRegistry};
use crate::session::timed_queue::TimedQueue;
use crate::session::{ClientDisconnectReason, MsgTypeId, ServerDisconnectReason, AUTHENTICATED_FLAG};
use crate::transport::udp::UdpTransport;
use crate::transport::MessageTransport;
use crate::util::buf_ext::BufExt;

/// Callbacks for session events on the client. All methods have no-op defaults.
pub trait ClientListener: Send {
    fn on_connected(&mut self, _client_id: u32) {}
    fn on_disconnected(&mut self, _reason: ClientDisconnectReason) {}
    fn on_message_arrived(&mut self, _message: &dyn Message) {}
    /// called for timed messages when they are due, after `on_message_arrived` was called for them
    fn on_timed_playback(&mut self, _message: &dyn Message) {}
}

pub struct NoopClientListener;
impl ClientListener for NoopClientListener {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Disconnected,
    /// waiting for the server's handshake reply
    Handshaking,
    Authenticated {
        client_id: u32,
        auth_key: u8,
    },
}

/// The client side of the session protocol.
///
/// Like the server side, the client is driven by the application calling
///  [ClientProcessor::tick]. Apart from processing incoming data, the client uses `tick` to
///  re-send its handshake until the server replies, to synchronize its estimate of the server's
///  clock periodically, and to play back timed messages when they are due.
///
/// Timed messages are played back when the estimated server time minus the configured playback
///  delay reaches their timestamp.
pub struct ClientProcessor<T: MessageTransport> {
    transport: T,
    config: Arc<TeleportConfig>,
    registry: MessageRegistry,
    listener: Box<dyn ClientListener>,
    state: ClientState,
    clock_sync: ClockSync,
    timed_queue: TimedQueue<Box<dyn Message>>,
    next_handshake: Instant,
    next_time_sync: Instant,
    epoch: Instant,
}

impl<T: MessageTransport> ClientProcessor<T> {
    pub fn new(transport: T, config: Arc<TeleportConfig>, listener: Box<dyn ClientListener>) -> anyhow::Result<ClientProcessor<T>> {
        config.validate()?;

        let now = Instant::now();
        Ok(ClientProcessor {
            transport,
            registry: MessageRegistry::new(config.reserved_msg_type_id_threshold),
            clock_sync: ClockSync::new(&config.time_sync),
            config,
            listener,
            state: ClientState::Disconnected,
            timed_queue: TimedQueue::default(),
            next_handshake: now,
            next_time_sync: now,
            epoch: now,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn register_message(&mut self, msg_type_id: u8, deserializer: Deserializer) -> anyhow::Result<()> {
        self.registry.register_message(msg_type_id, deserializer)
    }

    pub fn register<M: MessageType + 'static>(&mut self) -> anyhow::Result<()> {
        self.registry.register::<M>()
    }

    pub fn unregister_message(&mut self, msg_type_id: u8) -> bool {
        self.registry.unregister_message(msg_type_id)
    }

    pub fn unregister_all_messages(&mut self) {
        self.registry.unregister_all();
    }

    pub fn client_state(&self) -> ClientState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, ClientState::Authenticated { .. })
    }

    /// seconds since the processor was created
    pub fn local_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// the estimated current time on the server's clock, if there was a time sync
    pub fn server_time_estimate(&self) -> Option<f64> {
        self.clock_sync.server_time_estimate(self.local_time())
    }

    pub fn num_pending_timed_messages(&self) -> usize {
        self.timed_queue.len()
    }

    /// Starts a new session: sends a handshake to the server, repeating it until the server
    ///  replies.
    ///
    /// NB: After a server timeout, the transport no longer knows the server's endpoint. Reconnecting
    ///  then requires restarting the transport, i.e. [ClientProcessor::disconnect_and_stop]
    ///  followed by [ClientProcessor::connect].
    pub fn start_handshake(&mut self) -> anyhow::Result<()> {
        if self.state != ClientState::Disconnected {
            bail!("client is already connected or connecting");
        }
        if self.transport.endpoints().is_empty() {
            bail!("the transport has no server endpoint - it was never started, or the server timed out");
        }
        self.state = ClientState::Handshaking;
        self.send_handshake()
    }

    /// Processes all incoming data and does periodic housekeeping. Processing does not stop at
    ///  the first failure: all received data is processed, and the first error is returned
    ///  afterwards.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        if self.state != ClientState::Disconnected && self.transport.endpoints().is_empty() {
            warn!("server timed out");
            self.on_disconnected(ClientDisconnectReason::ServerTimeout);
        }

        if self.state == ClientState::Handshaking && Instant::now() >= self.next_handshake {
            debug!("no handshake reply from server - retrying");
            self.send_handshake()?;
        }

        let mut first_error = None;
        for (endpoint, payload) in self.transport.drain_incoming()? {
            if let Err(e) = self.on_incoming(payload) {
                warn!("error processing message from {:?}: {}", endpoint, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if self.is_authenticated() && Instant::now() >= self.next_time_sync {
            self.send_time_sync()?;
        }

        self.play_timed_messages();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn send_to_server(&mut self, message: &mut dyn Message) -> anyhow::Result<()> {
        let mut buf = self.authenticated_buf(message.msg_type_id())?;

        message.pre_send();
        message.ser(&mut buf);
        self.transport.send_bytes(message.channel_id(), buf.freeze())?;
        message.post_send();
        Ok(())
    }

    /// ends the session, notifying the server if a session was established
    pub fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.is_authenticated() {
            let reason = ClientDisconnectReason::ClientSideDisconnectRequested;
            let mut buf = self.authenticated_buf(MsgTypeId::Disconnect.into())?;
            buf.put_u8(reason.into());
            self.transport.send_bytes(0, buf.freeze())?;
        }
        if self.state != ClientState::Disconnected {
            self.on_disconnected(ClientDisconnectReason::ClientSideDisconnectRequested);
        }
        Ok(())
    }

    /// a buffer with the message type id and the authentication header
    fn authenticated_buf(&self, msg_type_id: u8) -> anyhow::Result<BytesMut> {
        let (client_id, auth_key) = match self.state {
            ClientState::Authenticated { client_id, auth_key } => (client_id, auth_key),
            _ => bail!("client is not connected"),
        };

        let mut buf = BytesMut::new();
        buf.put_u8(msg_type_id);
        buf.put_u8((auth_key << 1) | AUTHENTICATED_FLAG);
        buf.put_u32(client_id);
        Ok(buf)
    }

    fn send_handshake(&mut self) -> anyhow::Result<()> {
        self.next_handshake = Instant::now() + self.config.handshake_retry_interval;
        self.transport.send_bytes(0, Bytes::from_static(&[0, 0]))
    }

    fn send_time_sync(&mut self) -> anyhow::Result<()> {
        self.next_time_sync = Instant::now() + self.config.time_sync.interval;

        let mut buf = self.authenticated_buf(MsgTypeId::TimeSync.into())?;
        buf.put_f64(self.local_time());
        self.transport.send_bytes(0, buf.freeze())
    }

    fn on_disconnected(&mut self, reason: ClientDisconnectReason) {
        info!("disconnected: {:?}", reason);
        self.state = ClientState::Disconnected;
        self.timed_queue.clear();
        self.clock_sync.reset();
        self.listener.on_disconnected(reason);
    }

    fn play_timed_messages(&mut self) {
        let until = match self.server_time_estimate() {
            Some(estimate) => estimate - self.config.playback_delay.as_secs_f64(),
            None => return,
        };

        let listener = &mut self.listener;
        self.timed_queue.process_until(until, |_, mut message| {
            message.on_timed_playback();
            listener.on_timed_playback(&*message);
        });
    }

    fn on_incoming(&mut self, mut buf: Bytes) -> anyhow::Result<()> {
        let msg_type_id = buf.try_read_u8()?;

        match MsgTypeId::try_from(msg_type_id) {
            Ok(MsgTypeId::Handshake) => {
                let auth_key = buf.try_read_u8()?;
                let client_id = buf.try_read_u32()?;
                if self.state != ClientState::Handshaking {
                    debug!("ignoring handshake reply in state {:?}", self.state);
                    return Ok(());
                }

                info!("connected as client {}", client_id);
                self.state = ClientState::Authenticated { client_id, auth_key };
                self.next_time_sync = Instant::now();
                self.listener.on_connected(client_id);
            }
            Ok(MsgTypeId::Disconnect) => {
                match buf.try_read_u8().map(ServerDisconnectReason::try_from) {
                    Ok(Ok(reason)) => debug!("server sent disconnect: {:?}", reason),
                    _ => debug!("server sent disconnect without valid reason"),
                }
                if self.state != ClientState::Disconnected {
                    self.on_disconnected(ClientDisconnectReason::ServerRequestedDisconnect);
                }
            }
            Ok(MsgTypeId::TimeSync) => {
                let client_send_time = buf.try_read_f64()?;
                let server_time = buf.try_read_f64()?;
                let local_time = self.local_time();
                self.clock_sync.on_response(client_send_time, server_time, local_time);
            }
            Err(_) => {
                if !self.is_authenticated() {
                    warn!("received message of type {} before the session was established - dropping", msg_type_id);
                    return Ok(());
                }

                let mut message = self.registry.deserialize(msg_type_id, &mut buf)?;
                message.on_arrival();
                self.listener.on_message_arrived(&*message);
                if let Some(timestamp) = message.timestamp() {
                    self.timed_queue.accept(timestamp, message);
                }
            }
        }
        Ok(())
    }
}

impl ClientProcessor<UdpTransport> {
    pub async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        self.transport.start_client(host, port).await?;
        self.start_handshake()
    }

    /// Ends the session and stops the transport, after sending all queued data. The transport is
    ///  stopped even if the disconnect notification can not be sent.
    pub async fn disconnect_and_stop(&mut self) -> anyhow::Result<()> {
        let disconnect_result = self.disconnect();
        let stop_result = self.transport.stop().await;
        disconnect_result.and(stop_result)
    }
}
