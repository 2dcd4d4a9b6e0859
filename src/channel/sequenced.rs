use std::collections::BTreeMap;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::config::RetransmitPolicy;
use crate::protocol::sequence::{SequenceNumber, ACK_SENTINEL};

struct OutboxEntry {
    prepared: Bytes,
    next_retry: Instant,
}

struct SequencedState {
    next_outgoing: SequenceNumber,
    next_expected: SequenceNumber,
    /// sent, but not yet acknowledged
    outbox: BTreeMap<SequenceNumber, OutboxEntry>,
    /// received ahead of `next_expected`, waiting for the gap to be filled
    inbox: FxHashMap<SequenceNumber, Bytes>,
}

/// Adds reliability and ordering to an inner channel.
///
/// Each payload is prefixed with a two-byte sequence number and kept in an outbox until the peer
///  acknowledges it, being re-sent periodically in the meantime. The receiving side acknowledges
///  every envelope it gets, buffers envelopes that arrive ahead of the next expected sequence
///  number, and passes payloads to the inner channel strictly in sequence, exactly once.
///
/// An ack is a four-byte message `[0xFF, 0xFF, seq_hi, seq_lo]`. It is sent through the inner
///  channel directly, without sequencing or preparation.
///
/// NB: Duplicates are acknowledged as well: they are usually the result of a lost ack, and the
///  sender keeps re-sending until an ack gets through.
///
/// Envelopes are buffered at most `receive_window` sequence numbers ahead of the next expected
///  one. Envelopes beyond that are discarded without an ack, so the sender re-sends them later.
pub struct SequencedChannel<C: Channel> {
    inner: C,
    retransmit_policy: RetransmitPolicy,
    receive_window: usize,
    state: Mutex<SequencedState>,
}

impl<C: Channel> SequencedChannel<C> {
    pub fn new(inner: C, retransmit_policy: RetransmitPolicy, receive_window: usize) -> SequencedChannel<C> {
        SequencedChannel {
            inner,
            retransmit_policy,
            receive_window,
            state: Mutex::new(SequencedState {
                next_outgoing: SequenceNumber::ZERO,
                next_expected: SequenceNumber::ZERO,
                outbox: Default::default(),
                inbox: Default::default(),
            }),
        }
    }

    /// number of sent envelopes that were not acknowledged yet
    pub fn unacked_count(&self) -> usize {
        self.state.lock().outbox.len()
    }

    fn on_ack(&self, mut payload: Bytes) {
        if payload.len() != 4 {
            warn!("received ack with invalid length {} - dropping", payload.len());
            return;
        }
        let _ = payload.split_to(2);
        let raw = u16::from_be_bytes([payload[0], payload[1]]);

        match SequenceNumber::from_raw(raw) {
            Ok(sequence) => {
                if self.state.lock().outbox.remove(&sequence).is_some() {
                    trace!("envelope {} was acknowledged", sequence);
                }
                else {
                    trace!("duplicate ack for envelope {}", sequence);
                }
            }
            Err(_) => {
                warn!("received ack for the reserved sequence number - dropping");
            }
        }
    }

    fn send_ack(&self, sequence: SequenceNumber) -> anyhow::Result<()> {
        let mut ack = BytesMut::with_capacity(4);
        ack.put_u16(ACK_SENTINEL);
        ack.put_u16(sequence.to_raw());
        self.inner.send(ack.freeze())
    }
}

impl<C: Channel> Channel for SequencedChannel<C> {
    fn incoming_count(&self) -> usize {
        self.inner.incoming_count()
    }

    fn outgoing_count(&self) -> usize {
        self.inner.outgoing_count()
    }

    fn receive(&self, mut payload: Bytes) -> anyhow::Result<()> {
        if payload.len() < 2 {
            warn!("received envelope without sequence number - dropping");
            return Ok(());
        }

        let raw = u16::from_be_bytes([payload[0], payload[1]]);
        if raw == ACK_SENTINEL {
            self.on_ack(payload);
            return Ok(());
        }

        let sequence = SequenceNumber::from_raw(raw)?;
        let _ = payload.split_to(2);

        let mut state = self.state.lock();
        let is_already_passed = state.next_expected.is_already_passed(sequence);
        if !is_already_passed && state.next_expected.distance_to(sequence) as usize >= self.receive_window {
            debug!("envelope {} is too far ahead of {} - discarding", sequence, state.next_expected);
            return Ok(());
        }

        self.send_ack(sequence)?;

        if is_already_passed {
            debug!("envelope {} was already delivered - discarding", sequence);
            return Ok(());
        }
        if state.inbox.contains_key(&sequence) {
            debug!("envelope {} is already buffered - discarding", sequence);
            return Ok(());
        }
        state.inbox.insert(sequence, payload);

        loop {
            let next_expected = state.next_expected;
            match state.inbox.remove(&next_expected) {
                Some(p) => {
                    self.inner.receive(p)?;
                    state.next_expected = next_expected.next();
                }
                None => break,
            }
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

        let mut state = self.state.lock();
        let sequence = state.next_outgoing;
        if state.outbox.contains_key(&sequence) {
            bail!("sequence number {} is still awaiting an ack - too many unacknowledged envelopes", sequence);
        }

        let mut buf = BytesMut::with_capacity(2 + inner_prepared.len());
        buf.put_u16(sequence.to_raw());
        buf.put_slice(&inner_prepared);
        let prepared = buf.freeze();

        let next_retry = Instant::now() + self.retransmit_policy.interval(state.outbox.len());
        state.outbox.insert(sequence, OutboxEntry {
            prepared: prepared.clone(),
            next_retry,
        });
        state.next_outgoing = sequence.next();

        Ok(prepared)
    }

    fn upkeep(&self) -> anyhow::Result<()> {
        self.inner.upkeep()?;

        let mut state = self.state.lock();
        if state.outbox.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let interval = self.retransmit_policy.interval(state.outbox.len());
        let mut num_resent = 0;
        for entry in state.outbox.values_mut() {
            if entry.next_retry <= now {
                self.inner.send(entry.prepared.clone())?;
                entry.next_retry = now + interval;
                num_resent += 1;
            }
        }
        if num_resent > 0 {
            debug!("re-sent {} unacknowledged envelopes, next retry in {:?}", num_resent, interval);
        }
        Ok(())
    }
}
