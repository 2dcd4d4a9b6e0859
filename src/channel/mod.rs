//! Channels sit between the application and the packet codec. Each endpoint has one channel per
//!  configured channel id, and a channel decides what happens to payloads on their way out and in:
//!  queueing only, sequencing and retransmission, checksumming, or reassembly of length-prefixed
//!  frames.
//!
//! Channels are composable: wrapping channels delegate queueing to an inner channel and add their
//!  own header in `prepare_to_send`, stripping it again in `receive`. Sending is a two-step process,
//!  `channel.send(channel.prepare_to_send(payload)?)`, because wrappers must be able to re-send
//!  prepared data (retransmission) or send data that bypasses preparation (acks).

pub mod aggregating;
pub mod checksum;
pub mod sequenced;
pub mod simple;

use std::sync::Arc;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::channel::aggregating::AggregatingChannel;
use crate::channel::checksum::ChecksumChannel;
use crate::channel::sequenced::SequencedChannel;
use crate::channel::simple::SimpleChannel;
use crate::config::TeleportConfig;

/// All methods take `&self`: a channel is shared between the transport's worker (which moves
///  data between channels and the socket) and the application (which sends and consumes
///  payloads).
#[cfg_attr(test, automock)]
pub trait Channel: Send + Sync {
    fn incoming_count(&self) -> usize;
    fn outgoing_count(&self) -> usize;

    /// called with a frame's payload when it arrives from the network
    fn receive(&self, payload: Bytes) -> anyhow::Result<()>;

    /// the next payload that was received and is ready for the application
    fn pop_incoming(&self) -> Option<Bytes>;

    /// enqueues prepared data for sending
    fn send(&self, prepared: Bytes) -> anyhow::Result<()>;

    /// the next chunk of data that is ready to be framed and sent
    fn pop_outgoing(&self) -> Option<Bytes>;

    fn prepare_to_send(&self, payload: Bytes) -> anyhow::Result<Bytes>;

    /// called by the transport's worker once per cycle
    fn upkeep(&self) -> anyhow::Result<()>;
}

/// The configurable channel stacks.
///
/// NB: A sequenced channel sends its acks through its inner channel without preparing them.
///  It must therefore be the outermost layer of a stack, otherwise the peer's outer layers
///  would see acks without their own headers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    /// no guarantees, payloads are delivered in the order they arrive, if at all
    Unreliable,
    /// acknowledged, retransmitted and delivered in order, exactly once
    Reliable,
    /// unreliable, with an additional one-byte checksum of the payload
    Checksummed,
    /// reliable, with length-prefixed frames that are reassembled on the receiving side
    Stream,
}

impl ChannelKind {
    /// number of bytes the channel stack adds to each payload
    pub fn overhead(&self) -> usize {
        match self {
            ChannelKind::Unreliable => 0,
            ChannelKind::Reliable => 2,
            ChannelKind::Checksummed => 1,
            ChannelKind::Stream => 4,
        }
    }

    pub fn create(&self, config: &TeleportConfig) -> Arc<dyn Channel> {
        let simple = || SimpleChannel::new(config.queue_capacity);

        match self {
            ChannelKind::Unreliable => Arc::new(simple()),
            ChannelKind::Reliable => Arc::new(SequencedChannel::new(
                simple(),
                config.retransmit_policy.clone(),
                config.queue_capacity,
            )),
            ChannelKind::Checksummed => Arc::new(ChecksumChannel::new(simple())),
            ChannelKind::Stream => Arc::new(SequencedChannel::new(
                AggregatingChannel::new(simple()),
                config.retransmit_policy.clone(),
                config.queue_capacity,
            )),
        }
    }
}
