use std::any::Any;
use bytes::{BufMut, Bytes, BytesMut};
use crate::util::buf_ext::BufExt;

/// Which clients a message is sent to by [crate::session::server::ServerProcessor::send_message]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryTarget {
    NoOne,
    Everyone,
    /// serialized separately for each client, see [Message::ser_for_client]
    PerConnection,
}

/// Allows application code to get at the concrete type of a received message. There is a blanket
///  implementation, so message types need not implement this themselves.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}
impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An application message. Implementations provide the type id and serialization, all other
///  methods have defaults.
///
/// The lifecycle hooks are called by the processors: `pre_send` and `post_send` around sending,
///  `on_arrival` after a message was received and deserialized, and `on_timed_playback` when a
///  timed message is due on the client.
pub trait Message: AsAny + Send {
    fn msg_type_id(&self) -> u8;

    fn channel_id(&self) -> u8 {
        0
    }

    fn delivery_target(&self) -> DeliveryTarget {
        DeliveryTarget::Everyone
    }

    /// serializes the message's body, i.e. without the message type id
    fn ser(&self, buf: &mut BytesMut);

    /// Serializes the message's body for a specific client. Returning `false` means that the
    ///  message is not sent to this client.
    fn ser_for_client(&self, buf: &mut BytesMut, _client_id: u32) -> bool {
        self.ser(buf);
        true
    }

    /// Timed messages carry a timestamp on the server's clock, and are played back on the client
    ///  when its estimate of server time reaches the timestamp
    fn timestamp(&self) -> Option<f64> {
        None
    }
    /// called by the server before sending a timed message
    fn stamp(&mut self, _timestamp: f64) {}

    fn pre_send(&mut self) {}
    fn post_send(&mut self) {}
    fn on_arrival(&mut self) {}
    fn on_timed_playback(&mut self) {}
}

impl<'a> dyn Message + 'a {
    pub fn downcast_ref<M: Message + 'static>(&self) -> Option<&M> {
        AsAny::as_any(self).downcast_ref::<M>()
    }
}

/// A message type that can be registered for deserialization
pub trait MessageType: Message + Sized {
    const MSG_TYPE_ID: u8;

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self>;
}

/// Adds a timestamp to a message. The timestamp is serialized in front of the wrapped message's
///  body, and set by the server when the message is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<M> {
    pub timestamp: f64,
    pub message: M,
}

impl<M> Timed<M> {
    /// a timed message that was not stamped yet
    pub fn new(message: M) -> Timed<M> {
        Timed {
            timestamp: -1.0,
            message,
        }
    }
}

impl<M: Message + 'static> Message for Timed<M> {
    fn msg_type_id(&self) -> u8 {
        self.message.msg_type_id()
    }

    fn channel_id(&self) -> u8 {
        self.message.channel_id()
    }

    fn delivery_target(&self) -> DeliveryTarget {
        self.message.delivery_target()
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f64(self.timestamp);
        self.message.ser(buf);
    }

    fn ser_for_client(&self, buf: &mut BytesMut, client_id: u32) -> bool {
        buf.put_f64(self.timestamp);
        self.message.ser_for_client(buf, client_id)
    }

    fn timestamp(&self) -> Option<f64> {
        Some(self.timestamp)
    }

    fn stamp(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
    }

    fn pre_send(&mut self) {
        self.message.pre_send()
    }

    fn post_send(&mut self) {
        self.message.post_send()
    }

    fn on_arrival(&mut self) {
        self.message.on_arrival()
    }

    fn on_timed_playback(&mut self) {
        self.message.on_timed_playback()
    }
}

impl<M: MessageType + 'static> MessageType for Timed<M> {
    const MSG_TYPE_ID: u8 = M::MSG_TYPE_ID;

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        let timestamp = buf.try_read_f64()?;
        Ok(Timed {
            timestamp,
            message: M::deser(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::TestMessage;

    #[test]
    fn test_timed_wraps_body() {
        let mut timed = Timed::new(TestMessage::new(7, "abc"));
        assert_eq!(Message::timestamp(&timed), Some(-1.0));
        timed.stamp(2.5);

        let mut buf = BytesMut::new();
        timed.ser(&mut buf);
        assert_eq!(&buf[..8], &2.5f64.to_be_bytes());

        let mut bytes = buf.freeze();
        let deser = Timed::<TestMessage>::deser(&mut bytes).unwrap();
        assert_eq!(deser, timed);
        assert_eq!(deser.msg_type_id(), TestMessage::MSG_TYPE_ID);
    }

    #[test]
    fn test_downcast() {
        let message: Box<dyn Message> = Box::new(TestMessage::new(1, "x"));
        assert_eq!(message.downcast_ref::<TestMessage>(), Some(&TestMessage::new(1, "x")));
        assert!(message.downcast_ref::<Timed<TestMessage>>().is_none());
    }
}
