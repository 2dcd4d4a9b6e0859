use bytes::{BufMut, Bytes, BytesMut};
use crate::session::message::{DeliveryTarget, Message, MessageType};
use crate::util::buf_ext::BufExt;

/// A message with a number and a string, tracking calls to its lifecycle hooks. Equality only
///  takes the serialized fields into account.
#[derive(Debug, Clone, Default)]
pub struct TestMessage {
    pub value: u32,
    pub text: String,
    /// if set, the message is sent per connection, and only to this client
    pub per_connection_for: Option<u32>,
    pub num_sent: u32,
    pub num_arrivals: u32,
    pub num_playbacks: u32,
}

impl TestMessage {
    pub fn new(value: u32, text: &str) -> TestMessage {
        TestMessage {
            value,
            text: text.to_string(),
            ..Default::default()
        }
    }
}

impl PartialEq for TestMessage {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.text == other.text
    }
}

impl Message for TestMessage {
    fn msg_type_id(&self) -> u8 {
        Self::MSG_TYPE_ID
    }

    fn delivery_target(&self) -> DeliveryTarget {
        match self.per_connection_for {
            Some(_) => DeliveryTarget::PerConnection,
            None => DeliveryTarget::Everyone,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.value);
        buf.put_u16(self.text.len() as u16);
        buf.put_slice(self.text.as_bytes());
    }

    fn ser_for_client(&self, buf: &mut BytesMut, client_id: u32) -> bool {
        if self.per_connection_for != Some(client_id) {
            return false;
        }
        self.ser(buf);
        true
    }

    fn post_send(&mut self) {
        self.num_sent += 1;
    }

    fn on_arrival(&mut self) {
        self.num_arrivals += 1;
    }

    fn on_timed_playback(&mut self) {
        self.num_playbacks += 1;
    }
}

impl MessageType for TestMessage {
    const MSG_TYPE_ID: u8 = 100;

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        let value = buf.try_read_u32()?;
        let len = buf.try_read_u16()? as usize;
        if buf.len() < len {
            anyhow::bail!("text is truncated");
        }
        let text = String::from_utf8(buf.split_to(len).to_vec())?;
        Ok(TestMessage {
            value,
            text,
            ..Default::default()
        })
    }
}
