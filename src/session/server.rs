use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TeleportConfig;
use crate::session::message::{DeliveryTarget, Message, MessageType};
use crate::session::registry::{Deserializer, MessageRegistry};
use crate::session::{MsgTypeId, ServerDisconnectReason, AUTHENTICATED_FLAG};
use crate::transport::udp::UdpTransport;
use crate::transport::MessageTransport;
use crate::util::buf_ext::BufExt;

/// Callbacks for session events on the server. All methods have no-op defaults.
pub trait ServerListener: Send {
    fn on_client_connected(&mut self, _client_id: u32, _endpoint: SocketAddr) {}
    fn on_client_disconnected(&mut self, _client_id: u32, _reason: ServerDisconnectReason) {}
    fn on_message_arrived(&mut self, _client_id: u32, _endpoint: SocketAddr, _message: &dyn Message) {}
    fn on_server_online(&mut self) {}
}

pub struct NoopServerListener;
impl ServerListener for NoopServerListener {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientSession {
    pub client_id: u32,
    /// 7 significant bits
    pub auth_key: u8,
    pub endpoint: SocketAddr,
}

/// The server side of the session protocol.
///
/// The processor does not run on its own: the application calls [ServerProcessor::tick]
///  regularly, typically once per frame of its simulation loop. Each tick processes everything
///  that arrived since the previous tick, and all callbacks are invoked from inside `tick`.
pub struct ServerProcessor<T: MessageTransport> {
    transport: T,
    config: Arc<TeleportConfig>,
    registry: MessageRegistry,
    listener: Box<dyn ServerListener>,
    sessions_by_endpoint: FxHashMap<SocketAddr, ClientSession>,
    sessions_by_id: FxHashMap<u32, ClientSession>,
    next_client_id: u32,
    was_online: bool,
    epoch: Instant,
}

impl<T: MessageTransport> ServerProcessor<T> {
    pub fn new(transport: T, config: Arc<TeleportConfig>, listener: Box<dyn ServerListener>) -> anyhow::Result<ServerProcessor<T>> {
        config.validate()?;

        Ok(ServerProcessor {
            transport,
            registry: MessageRegistry::new(config.reserved_msg_type_id_threshold),
            config,
            listener,
            sessions_by_endpoint: Default::default(),
            sessions_by_id: Default::default(),
            next_client_id: 0,
            was_online: false,
            epoch: Instant::now(),
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

    pub fn is_listening(&self) -> bool {
        self.transport.is_running()
    }

    /// seconds since the processor was created
    pub fn local_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn client_ids(&self) -> Vec<u32> {
        self.sessions_by_id.keys().cloned().collect()
    }

    pub fn session(&self, client_id: u32) -> Option<&ClientSession> {
        self.sessions_by_id.get(&client_id)
    }

    /// Processes all incoming data and session events. Processing does not stop at the first
    ///  failure: all received data is processed, and the first error is returned afterwards.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        let is_online = self.transport.is_running();
        if is_online != self.was_online {
            self.was_online = is_online;
            if is_online {
                info!("server is online");
                self.listener.on_server_online();
            }
        }

        self.evict_timed_out_sessions();

        let mut first_error = None;
        for (endpoint, payload) in self.transport.drain_incoming()? {
            if let Err(e) = self.on_incoming(endpoint, payload) {
                warn!("error processing message from {:?}: {}", endpoint, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sends a message according to its [DeliveryTarget]
    pub fn send_message(&mut self, message: &mut dyn Message) -> anyhow::Result<()> {
        self.evict_timed_out_sessions();
        match message.delivery_target() {
            DeliveryTarget::NoOne => Ok(()),
            DeliveryTarget::Everyone => self.send_to_all(message),
            DeliveryTarget::PerConnection => {
                self.stamp_if_timed(message);
                message.pre_send();
                let sessions = self.sessions_by_id.values().cloned().collect::<Vec<_>>();
                for session in sessions {
                    let mut buf = BytesMut::new();
                    buf.put_u8(message.msg_type_id());
                    if message.ser_for_client(&mut buf, session.client_id) {
                        self.transport.send_bytes_to(message.channel_id(), buf.freeze(), &[session.endpoint])?;
                    }
                }
                message.post_send();
                Ok(())
            }
        }
    }

    /// sends a message to all connected clients
    pub fn send_to_all(&mut self, message: &mut dyn Message) -> anyhow::Result<()> {
        self.evict_timed_out_sessions();
        let endpoints = self.sessions_by_endpoint.keys().cloned().collect::<Vec<_>>();
        self.send_to_endpoints(message, &endpoints)
    }

    pub fn send_to_clients(&mut self, message: &mut dyn Message, client_ids: &[u32]) -> anyhow::Result<()> {
        self.evict_timed_out_sessions();
        let endpoints = client_ids.iter()
            .map(|id| self.sessions_by_id.get(id)
                .map(|s| s.endpoint)
                .ok_or_else(|| anyhow!("client {} is not connected", id)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.send_to_endpoints(message, &endpoints)
    }

    pub fn send_to_all_except(&mut self, message: &mut dyn Message, excluded_client_ids: &[u32]) -> anyhow::Result<()> {
        self.evict_timed_out_sessions();
        let endpoints = self.sessions_by_id.values()
            .filter(|s| !excluded_client_ids.contains(&s.client_id))
            .map(|s| s.endpoint)
            .collect::<Vec<_>>();
        self.send_to_endpoints(message, &endpoints)
    }

    /// ends a client's session, notifying the client
    pub fn disconnect_client(&mut self, client_id: u32) -> anyhow::Result<()> {
        self.evict_timed_out_sessions();
        let session = match self.sessions_by_id.get(&client_id) {
            Some(s) => *s,
            None => bail!("client {} is not connected", client_id),
        };

        let reason = ServerDisconnectReason::ServerWantsToDisconnectClient;
        self.send_disconnect(&[session.endpoint], reason)?;
        self.end_session(session, reason);
        Ok(())
    }

    /// Notifies all clients with the given reason, and ends their sessions. Sessions end even if
    ///  sending the notification fails, and the send error is returned afterwards.
    pub fn disconnect_all(&mut self, reason: ServerDisconnectReason) -> anyhow::Result<()> {
        self.evict_timed_out_sessions();

        let sessions = self.sessions_by_id.values().cloned().collect::<Vec<_>>();
        let endpoints = sessions.iter().map(|s| s.endpoint).collect::<Vec<_>>();
        let send_result = self.send_disconnect(&endpoints, reason);
        for session in sessions {
            self.end_session(session, reason);
        }
        send_result
    }

    fn send_to_endpoints(&mut self, message: &mut dyn Message, endpoints: &[SocketAddr]) -> anyhow::Result<()> {
        self.stamp_if_timed(message);
        message.pre_send();

        let mut buf = BytesMut::new();
        buf.put_u8(message.msg_type_id());
        message.ser(&mut buf);
        self.transport.send_bytes_to(message.channel_id(), buf.freeze(), endpoints)?;

        message.post_send();
        Ok(())
    }

    fn stamp_if_timed(&self, message: &mut dyn Message) {
        if message.timestamp().is_some() {
            message.stamp(self.local_time());
        }
    }

    fn send_disconnect(&self, endpoints: &[SocketAddr], reason: ServerDisconnectReason) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(MsgTypeId::Disconnect.into());
        buf.put_u8(reason.into());
        self.transport.send_bytes_to(0, buf.freeze(), endpoints)
    }

    fn end_session(&mut self, session: ClientSession, reason: ServerDisconnectReason) {
        info!("client {} at {:?} disconnected: {:?}", session.client_id, session.endpoint, reason);
        self.sessions_by_id.remove(&session.client_id);
        self.sessions_by_endpoint.remove(&session.endpoint);
        self.listener.on_client_disconnected(session.client_id, reason);
    }

    fn evict_timed_out_sessions(&mut self) {
        if self.sessions_by_endpoint.is_empty() {
            return;
        }

        let live_endpoints = self.transport.endpoints();
        let timed_out = self.sessions_by_endpoint.values()
            .filter(|s| !live_endpoints.contains(&s.endpoint))
            .cloned()
            .collect::<Vec<_>>();
        for session in timed_out {
            self.end_session(session, ServerDisconnectReason::ClientTimeout);
        }
    }

    fn on_incoming(&mut self, endpoint: SocketAddr, mut buf: Bytes) -> anyhow::Result<()> {
        let msg_type_id = buf.try_read_u8()?;
        let header = buf.try_read_u8()?;

        let session = match self.sessions_by_endpoint.get(&endpoint) {
            Some(s) => *s,
            None => {
                if msg_type_id != u8::from(MsgTypeId::Handshake) {
                    bail!("first message from {:?} must be a handshake, was type {}", endpoint, msg_type_id);
                }
                if header & AUTHENTICATED_FLAG != 0 {
                    bail!("authenticated handshake from unknown endpoint {:?}", endpoint);
                }
                return self.on_new_client(endpoint);
            }
        };

        if header & AUTHENTICATED_FLAG == 0 {
            if msg_type_id == u8::from(MsgTypeId::Handshake) {
                debug!("repeated handshake from {:?} - re-sending reply", endpoint);
                return self.send_handshake_reply(session);
            }
            bail!("unauthenticated message of type {} from {:?}", msg_type_id, endpoint);
        }

        let auth_key = header >> 1;
        let client_id = buf.try_read_u32()?;
        if auth_key != session.auth_key || client_id != session.client_id {
            bail!("authentication failed for message from {:?}: client id {}, expected {}", endpoint, client_id, session.client_id);
        }

        match MsgTypeId::try_from(msg_type_id) {
            Ok(MsgTypeId::Handshake) => {
                // the client is authenticated already, nothing to do
                Ok(())
            }
            Ok(MsgTypeId::Disconnect) => {
                if let Ok(reason) = buf.try_read_u8() {
                    debug!("client {} sent disconnect reason {}", client_id, reason);
                }
                self.end_session(session, ServerDisconnectReason::ClientInitiatedDisconnect);
                Ok(())
            }
            Ok(MsgTypeId::TimeSync) => {
                let client_time = buf.try_read_f64()?;
                let mut reply = BytesMut::with_capacity(17);
                reply.put_u8(MsgTypeId::TimeSync.into());
                reply.put_f64(client_time);
                reply.put_f64(self.local_time());
                self.transport.send_bytes_to(0, reply.freeze(), &[endpoint])
            }
            Err(_) => {
                let mut message = self.registry.deserialize(msg_type_id, &mut buf)?;
                message.on_arrival();
                self.listener.on_message_arrived(client_id, endpoint, &*message);
                Ok(())
            }
        }
    }

    fn on_new_client(&mut self, endpoint: SocketAddr) -> anyhow::Result<()> {
        let session = ClientSession {
            client_id: self.next_client_id,
            auth_key: rand::random::<u8>() >> 1,
            endpoint,
        };
        self.next_client_id = self.next_client_id.wrapping_add(1);

        self.sessions_by_endpoint.insert(endpoint, session);
        self.sessions_by_id.insert(session.client_id, session);
        info!("client {} connected from {:?}", session.client_id, endpoint);

        self.send_handshake_reply(session)?;
        self.listener.on_client_connected(session.client_id, endpoint);
        Ok(())
    }

    fn send_handshake_reply(&self, session: ClientSession) -> anyhow::Result<()> {
        let mut reply = BytesMut::with_capacity(6);
        reply.put_u8(MsgTypeId::Handshake.into());
        reply.put_u8(session.auth_key);
        reply.put_u32(session.client_id);
        self.transport.send_bytes_to(0, reply.freeze(), &[session.endpoint])
    }
}

impl ServerProcessor<UdpTransport> {
    pub async fn listen(&mut self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.transport.start_listener(addr).await
    }

    /// Notifies all connected clients and stops the transport. The transport is stopped even if
    ///  notifying clients fails, and the first error is returned.
    pub async fn stop_listening(&mut self) -> anyhow::Result<()> {
        let disconnect_result = self.disconnect_all(ServerDisconnectReason::ServerShutdown);
        let stop_result = self.transport.stop().await;
        disconnect_result.and(stop_result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;
    use crate::session::message::Timed;
    use crate::test_util::listener::{RecordingServerListener, ServerEvent};
    use crate::test_util::message::TestMessage;
    use crate::test_util::transport::InMemoryTransport;
    use crate::transport::MockMessageTransport;

    fn client_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn new_server() -> (ServerProcessor<InMemoryTransport>, RecordingServerListener) {
        let listener = RecordingServerListener::default();
        let transport = InMemoryTransport::new(SocketAddr::from(([10, 0, 0, 100], 7000)));
        let mut server = ServerProcessor::new(transport, Arc::new(TeleportConfig::default()), Box::new(listener.clone())).unwrap();
        server.register::<TestMessage>().unwrap();

        server.tick().unwrap();
        assert_eq!(listener.events(), vec![ServerEvent::Online]);
        listener.clear();
        (server, listener)
    }

    fn handshake(server: &mut ServerProcessor<InMemoryTransport>, from: SocketAddr) -> (u32, u8) {
        server.transport().inject(from, &[0, 0]);
        server.tick().unwrap();

        let sent = server.transport().take_sent();
        let (to, _, reply) = sent.last().unwrap();
        assert_eq!(*to, from);
        assert_eq!(reply[0], 0);
        assert_eq!(reply.len(), 6);
        (u32::from_be_bytes([reply[2], reply[3], reply[4], reply[5]]), reply[1])
    }

    fn authenticated(msg_type_id: u8, auth_key: u8, client_id: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![msg_type_id, (auth_key << 1) | 1];
        buf.extend_from_slice(&client_id.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    fn test_message_body(message: &TestMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_handshake_assigns_sequential_ids() {
        let (mut server, listener) = new_server();

        let (id0, key0) = handshake(&mut server, client_addr(1));
        let (id1, key1) = handshake(&mut server, client_addr(2));
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        assert!(key0 < 0x80);
        assert!(key1 < 0x80);

        assert_eq!(server.session(0).unwrap().auth_key, key0);
        assert_eq!(server.session(1).unwrap().endpoint, client_addr(2));
        assert_eq!(listener.events(), vec![
            ServerEvent::ClientConnected(0, client_addr(1)),
            ServerEvent::ClientConnected(1, client_addr(2)),
        ]);
    }

    #[test]
    fn test_repeated_handshake_resends_reply() {
        let (mut server, listener) = new_server();
        let (id, key) = handshake(&mut server, client_addr(1));

        server.transport().inject(client_addr(1), &[0, 0]);
        server.tick().unwrap();

        let sent = server.transport().take_sent();
        assert_eq!(sent.len(), 1);
        let mut expected = vec![0, key];
        expected.extend_from_slice(&id.to_be_bytes());
        assert_eq!(sent[0].2.as_ref(), expected.as_slice());
        assert_eq!(listener.events().len(), 1);
    }

    #[test]
    fn test_message_dispatch() {
        let (mut server, listener) = new_server();
        let (id, key) = handshake(&mut server, client_addr(1));

        let message = TestMessage::new(42, "hello");
        server.transport().inject(client_addr(1), &authenticated(TestMessage::MSG_TYPE_ID, key, id, &test_message_body(&message)));
        server.tick().unwrap();

        assert_eq!(listener.events().last(), Some(&ServerEvent::MessageArrived(id, client_addr(1), message)));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let (mut server, listener) = new_server();
        let (id, key) = handshake(&mut server, client_addr(1));

        let message = TestMessage::new(42, "hello");
        let wrong_key = (key + 1) & 0x7f;
        server.transport().inject(client_addr(1), &authenticated(TestMessage::MSG_TYPE_ID, wrong_key, id, &test_message_body(&message)));
        assert!(server.tick().is_err());

        // wrong client id
        server.transport().inject(client_addr(1), &authenticated(TestMessage::MSG_TYPE_ID, key, id + 1, &test_message_body(&message)));
        assert!(server.tick().is_err());

        assert_eq!(listener.events().len(), 1);
    }

    #[test]
    fn test_first_message_must_be_handshake() {
        let (mut server, _) = new_server();
        server.transport().inject(client_addr(1), &authenticated(TestMessage::MSG_TYPE_ID, 5, 0, &[]));
        assert!(server.tick().is_err());
        assert!(server.client_ids().is_empty());
    }

    #[test]
    fn test_unknown_message_type() {
        let (mut server, _) = new_server();
        let (id, key) = handshake(&mut server, client_addr(1));
        server.transport().inject(client_addr(1), &authenticated(99, key, id, &[]));
        assert!(server.tick().is_err());
    }

    #[test]
    fn test_processing_continues_after_error() {
        let (mut server, listener) = new_server();
        server.transport().inject(client_addr(1), &[50, 1]);
        server.transport().inject(client_addr(2), &[0, 0]);

        assert!(server.tick().is_err());
        assert_eq!(listener.events(), vec![ServerEvent::ClientConnected(0, client_addr(2))]);
    }

    #[test]
    fn test_time_sync_reply() {
        let (mut server, _) = new_server();
        let (id, key) = handshake(&mut server, client_addr(1));

        server.transport().inject(client_addr(1), &authenticated(2, key, id, &12.5f64.to_be_bytes()));
        server.tick().unwrap();

        let sent = server.transport().take_sent();
        assert_eq!(sent.len(), 1);
        let reply = &sent[0].2;
        assert_eq!(reply.len(), 17);
        assert_eq!(reply[0], 2);
        assert_eq!(&reply[1..9], &12.5f64.to_be_bytes());
    }

    #[test]
    fn test_client_disconnect() {
        let (mut server, listener) = new_server();
        let (id, key) = handshake(&mut server, client_addr(1));

        server.transport().inject(client_addr(1), &authenticated(1, key, id, &[0]));
        server.tick().unwrap();

        assert!(server.client_ids().is_empty());
        assert_eq!(listener.events().last(), Some(&ServerEvent::ClientDisconnected(id, ServerDisconnectReason::ClientInitiatedDisconnect)));

        // the endpoint has to handshake again
        server.transport().inject(client_addr(1), &authenticated(TestMessage::MSG_TYPE_ID, key, id, &[]));
        assert!(server.tick().is_err());
    }

    #[test]
    fn test_disconnect_client() {
        let (mut server, listener) = new_server();
        let (id, _) = handshake(&mut server, client_addr(1));

        server.disconnect_client(id).unwrap();
        assert_eq!(server.transport().take_sent(), vec![(client_addr(1), 0, Bytes::from_static(&[1, 0]))]);
        assert_eq!(listener.events().last(), Some(&ServerEvent::ClientDisconnected(id, ServerDisconnectReason::ServerWantsToDisconnectClient)));

        assert!(server.disconnect_client(id).is_err());
    }

    #[test]
    fn test_session_eviction() {
        let (mut server, listener) = new_server();
        let (id, _) = handshake(&mut server, client_addr(1));
        handshake(&mut server, client_addr(2));

        server.transport().forget_endpoint(client_addr(1));
        server.tick().unwrap();

        assert_eq!(server.client_ids(), vec![1]);
        assert_eq!(listener.events().last(), Some(&ServerEvent::ClientDisconnected(id, ServerDisconnectReason::ClientTimeout)));
    }

    #[rstest::rstest]
    #[case::send_to_all(|server: &mut ServerProcessor<InMemoryTransport>, m: &mut TestMessage| server.send_to_all(m))]
    #[case::send_to_all_except(|server: &mut ServerProcessor<InMemoryTransport>, m: &mut TestMessage| server.send_to_all_except(m, &[2]))]
    #[case::send_message(|server: &mut ServerProcessor<InMemoryTransport>, m: &mut TestMessage| server.send_message(m))]
    fn test_sends_skip_sessions_evicted_since_last_tick(#[case] send: fn(&mut ServerProcessor<InMemoryTransport>, &mut TestMessage) -> anyhow::Result<()>) {
        let (mut server, listener) = new_server();
        for port in 1..=3 {
            handshake(&mut server, client_addr(port));
        }

        // the transport evicted the endpoint, the server did not tick since
        server.transport().forget_endpoint(client_addr(1));

        send(&mut server, &mut TestMessage::new(1, "x")).unwrap();

        let mut recipients = server.transport().take_sent().into_iter()
            .map(|(to, _, _)| to.port())
            .collect::<Vec<_>>();
        recipients.sort();
        assert_eq!(recipients, vec![2]);
        assert!(listener.events().contains(&ServerEvent::ClientDisconnected(0, ServerDisconnectReason::ClientTimeout)));
        assert_eq!(server.client_ids().len(), 2);
    }

    #[test]
    fn test_disconnect_all_after_eviction() {
        let (mut server, listener) = new_server();
        handshake(&mut server, client_addr(1));
        handshake(&mut server, client_addr(2));

        server.transport().forget_endpoint(client_addr(1));
        server.disconnect_all(ServerDisconnectReason::ServerShutdown).unwrap();

        assert_eq!(server.transport().take_sent(), vec![(client_addr(2), 0, Bytes::from_static(&[1, 2]))]);
        assert!(server.client_ids().is_empty());
        assert_eq!(listener.events()[2..], [
            ServerEvent::ClientDisconnected(0, ServerDisconnectReason::ClientTimeout),
            ServerEvent::ClientDisconnected(1, ServerDisconnectReason::ServerShutdown),
        ]);
    }

    #[test]
    fn test_disconnect_all_ends_sessions_when_sending_fails() {
        let mut transport = MockMessageTransport::new();
        transport.expect_is_running()
            .return_const(true);
        transport.expect_endpoints()
            .returning(|| vec![client_addr(1)]);
        transport.expect_send_bytes_to()
            .returning(|_, _, _| Err(anyhow!("socket is gone")));
        transport.expect_drain_incoming()
            .times(1)
            .returning(|| Ok(vec![(client_addr(1), Bytes::from_static(&[0, 0]))]));

        let listener = RecordingServerListener::default();
        let mut server = ServerProcessor::new(transport, Arc::new(TeleportConfig::default()), Box::new(listener.clone())).unwrap();

        // the handshake reply can not be sent, but the session exists
        assert!(server.tick().is_err());
        assert_eq!(server.client_ids(), vec![0]);

        assert!(server.disconnect_all(ServerDisconnectReason::ServerShutdown).is_err());
        assert!(server.client_ids().is_empty());
        assert_eq!(listener.events().last(), Some(&ServerEvent::ClientDisconnected(0, ServerDisconnectReason::ServerShutdown)));
    }

    #[test]
    fn test_send_variants() {
        let (mut server, _) = new_server();
        for port in 1..=3 {
            handshake(&mut server, client_addr(port));
        }

        let mut message = TestMessage::new(1, "x");
        let expected_payload = {
            let mut buf = vec![TestMessage::MSG_TYPE_ID];
            buf.extend(test_message_body(&message));
            Bytes::from(buf)
        };

        let recipients = |server: &ServerProcessor<InMemoryTransport>| {
            let mut result = server.transport().take_sent().into_iter()
                .map(|(to, channel_id, payload)| {
                    assert_eq!(channel_id, 0);
                    assert_eq!(payload, expected_payload);
                    to.port()
                })
                .collect::<Vec<_>>();
            result.sort();
            result
        };

        server.send_to_all(&mut message).unwrap();
        assert_eq!(recipients(&server), vec![1, 2, 3]);

        server.send_to_clients(&mut message, &[0, 2]).unwrap();
        assert_eq!(recipients(&server), vec![1, 3]);

        server.send_to_all_except(&mut message, &[1]).unwrap();
        assert_eq!(recipients(&server), vec![1, 3]);

        assert!(server.send_to_clients(&mut message, &[7]).is_err());
        assert_eq!(message.num_sent, 3);
    }

    #[test]
    fn test_send_message_per_connection() {
        let (mut server, _) = new_server();
        for port in 1..=3 {
            handshake(&mut server, client_addr(port));
        }

        // serializes for client 1 only
        let mut message = TestMessage::new(1, "only for client 1");
        message.per_connection_for = Some(1);
        server.send_message(&mut message).unwrap();

        let sent = server.transport().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, client_addr(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_messages_are_stamped() {
        let (mut server, _) = new_server();
        handshake(&mut server, client_addr(1));

        tokio::time::advance(Duration::from_millis(1500)).await;

        let mut message = Timed::new(TestMessage::new(1, "timed"));
        server.send_to_all(&mut message).unwrap();
        assert!((message.timestamp - 1.5).abs() < 1e-9);

        let sent = server.transport().take_sent();
        assert_eq!(&sent[0].2[1..9], &message.timestamp.to_be_bytes());
    }

    #[test]
    fn test_online_notification() {
        let mut transport = MockMessageTransport::new();
        let mut seq = mockall::Sequence::new();
        transport.expect_is_running()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(false);
        transport.expect_is_running()
            .times(2)
            .in_sequence(&mut seq)
            .return_const(true);
        transport.expect_drain_incoming()
            .returning(|| Ok(vec![]));

        let listener = RecordingServerListener::default();
        let mut server = ServerProcessor::new(transport, Arc::new(TeleportConfig::default()), Box::new(listener.clone())).unwrap();

        server.tick().unwrap();
        assert!(listener.events().is_empty());
        server.tick().unwrap();
        server.tick().unwrap();
        assert_eq!(listener.events(), vec![ServerEvent::Online]);
    }
}
