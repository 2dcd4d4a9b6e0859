use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;
use crate::channel::Channel;

/// Prefixes each payload with its two-byte length, and reassembles the length-prefixed frames on
///  the receiving side. Data received in a single call may contain several frames or only part
///  of one: incomplete data is kept until the rest arrives.
///
/// NB: Reassembly only makes sense for in-order delivery, so this channel is used inside a
///  sequenced channel.
pub struct AggregatingChannel<C: Channel> {
    inner: C,
    leftovers: Mutex<BytesMut>,
}

impl<C: Channel> AggregatingChannel<C> {
    pub fn new(inner: C) -> AggregatingChannel<C> {
        AggregatingChannel {
            inner,
            leftovers: Default::default(),
        }
    }
}

impl<C: Channel> Channel for AggregatingChannel<C> {
    fn incoming_count(&self) -> usize {
        self.inner.incoming_count()
    }

    fn outgoing_count(&self) -> usize {
        self.inner.outgoing_count()
    }

    fn receive(&self, payload: Bytes) -> anyhow::Result<()> {
        let mut leftovers = self.leftovers.lock();
        leftovers.extend_from_slice(&payload);

        while leftovers.len() >= 2 {
            let frame_len = u16::from_be_bytes([leftovers[0], leftovers[1]]) as usize;
            if leftovers.len() < 2 + frame_len {
                trace!("partial frame: {} of {} bytes", leftovers.len() - 2, frame_len);
                break;
            }
            leftovers.advance(2);
            let frame = leftovers.split_to(frame_len).freeze();
            self.inner.receive(frame)?;
        }
        Ok(())
    }

    fn pop_incoming(&self) -> Option<Bytes> {
        self.inner.pop_incoming()
    }

    fn send(&self, prepared: Bytes) -> anyhow::Result<()> {
        self.inner.send(prepared)
    }

    fn pop_outgoing(&self) -> Option<Bytes> {
        self.inner.pop_outgoing()
    }

    fn prepare_to_send(&self, payload: Bytes) -> anyhow::Result<Bytes> {
        let inner_prepared = self.inner.prepare_to_send(payload)?;
        if inner_prepared.len() > u16::MAX as usize {
            bail!("payload of {} bytes is too long for a length prefix", inner_prepared.len());
        }

        let mut buf = BytesMut::with_capacity(2 + inner_prepared.len());
        buf.put_u16(inner_prepared.len() as u16);
        buf.put_slice(&inner_prepared);
        Ok(buf.freeze())
    }

    fn upkeep(&self) -> anyhow::Result<()> {
        self.inner.upkeep()
    }
}
