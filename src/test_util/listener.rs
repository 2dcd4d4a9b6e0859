use std::net::SocketAddr;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::session::client::ClientListener;
use crate::session::message::Message;
use crate::session::server::ServerListener;
use crate::session::{ClientDisconnectReason, ServerDisconnectReason};
use crate::test_util::message::TestMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Online,
    ClientConnected(u32, SocketAddr),
    ClientDisconnected(u32, ServerDisconnectReason),
    MessageArrived(u32, SocketAddr, TestMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected(u32),
    Disconnected(ClientDisconnectReason),
    MessageArrived(TestMessage),
    TimedPlayback(TestMessage),
}

/// Records server callbacks. Clones share the record, so one clone can be passed to the
///  processor while the test keeps another. Messages other than [TestMessage] are not recorded.
#[derive(Clone, Default)]
pub struct RecordingServerListener {
    events: Arc<Mutex<Vec<ServerEvent>>>,
}

impl RecordingServerListener {
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ServerListener for RecordingServerListener {
    fn on_client_connected(&mut self, client_id: u32, endpoint: SocketAddr) {
        self.events.lock().push(ServerEvent::ClientConnected(client_id, endpoint));
    }

    fn on_client_disconnected(&mut self, client_id: u32, reason: ServerDisconnectReason) {
        self.events.lock().push(ServerEvent::ClientDisconnected(client_id, reason));
    }

    fn on_message_arrived(&mut self, client_id: u32, endpoint: SocketAddr, message: &dyn Message) {
        if let Some(m) = test_message(message) {
            self.events.lock().push(ServerEvent::MessageArrived(client_id, endpoint, m));
        }
    }

    fn on_server_online(&mut self) {
        self.events.lock().push(ServerEvent::Online);
    }
}

/// Records client callbacks, see [RecordingServerListener]
#[derive(Clone, Default)]
pub struct RecordingClientListener {
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

impl RecordingClientListener {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }
}

impl ClientListener for RecordingClientListener {
    fn on_connected(&mut self, client_id: u32) {
        self.events.lock().push(ClientEvent::Connected(client_id));
    }

    fn on_disconnected(&mut self, reason: ClientDisconnectReason) {
        self.events.lock().push(ClientEvent::Disconnected(reason));
    }

    fn on_message_arrived(&mut self, message: &dyn Message) {
        if let Some(m) = test_message(message) {
            self.events.lock().push(ClientEvent::MessageArrived(m));
        }
    }

    fn on_timed_playback(&mut self, message: &dyn Message) {
        if let Some(m) = test_message(message) {
            self.events.lock().push(ClientEvent::TimedPlayback(m));
        }
    }
}

/// plain and timed test messages
fn test_message(message: &dyn Message) -> Option<TestMessage> {
    message.downcast_ref::<TestMessage>()
        .or_else(|| message.downcast_ref::<crate::session::message::Timed<TestMessage>>().map(|t| &t.message))
        .cloned()
}
