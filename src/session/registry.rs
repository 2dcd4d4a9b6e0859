use std::collections::hash_map::Entry;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::session::message::{Message, MessageType};

pub type Deserializer = Box<dyn Fn(&mut Bytes) -> anyhow::Result<Box<dyn Message>> + Send + Sync>;

/// Maps message type ids to deserializers for application messages
pub struct MessageRegistry {
    reserved_msg_type_id_threshold: u8,
    deserializers: FxHashMap<u8, Deserializer>,
}

impl MessageRegistry {
    pub fn new(reserved_msg_type_id_threshold: u8) -> MessageRegistry {
        MessageRegistry {
            reserved_msg_type_id_threshold,
            deserializers: Default::default(),
        }
    }

    pub fn register_message(&mut self, msg_type_id: u8, deserializer: Deserializer) -> anyhow::Result<()> {
        if msg_type_id <= self.reserved_msg_type_id_threshold {
            bail!("message type id {} is reserved: ids must be greater than {}", msg_type_id, self.reserved_msg_type_id_threshold);
        }

        match self.deserializers.entry(msg_type_id) {
            Entry::Occupied(_) => bail!("message type id {} is already registered", msg_type_id),
            Entry::Vacant(e) => {
                debug!("registering message type id {}", msg_type_id);
                e.insert(deserializer);
                Ok(())
            }
        }
    }

    pub fn register<M: MessageType + 'static>(&mut self) -> anyhow::Result<()> {
        self.register_message(M::MSG_TYPE_ID, Box::new(|buf: &mut Bytes| {
            Ok(Box::new(M::deser(buf)?) as Box<dyn Message>)
        }))
    }

    /// returns `true` if there was a registration for the id
    pub fn unregister_message(&mut self, msg_type_id: u8) -> bool {
        self.deserializers.remove(&msg_type_id).is_some()
    }

    pub fn unregister_all(&mut self) {
        self.deserializers.clear();
    }

    pub fn is_registered(&self, msg_type_id: u8) -> bool {
        self.deserializers.contains_key(&msg_type_id)
    }

    pub fn deserialize(&self, msg_type_id: u8, buf: &mut Bytes) -> anyhow::Result<Box<dyn Message>> {
        let deserializer = self.deserializers.get(&msg_type_id)
            .ok_or_else(|| anyhow!("unknown message type id {}", msg_type_id))?;
        deserializer(buf)
    }
}
