use std::time::Duration;
use anyhow::bail;
use crate::channel::ChannelKind;

/// The largest payload that fits into a frame: the length field has 12 bits.
pub const MAX_FRAME_PAYLOAD: usize = 0xFFF;

pub struct TeleportConfig {
    /// One entry per channel, the index being the channel id. All peers of a connection must use
    ///  the same list, there is no negotiation of channels.
    ///
    /// The frame header has two bits for the channel id, so there can be at most four channels.
    pub channels: Vec<ChannelKind>,

    /// An endpoint that was not heard from for longer than this is evicted from the endpoint table,
    ///  and its session (if any) is dropped.
    pub endpoint_timeout: Duration,

    /// The transport's worker task sleeps this long between send and receive cycles. This is
    ///  the main contributor to latency introduced by the transport itself.
    pub poll_interval: Duration,

    /// NB: Must not exceed [MAX_FRAME_PAYLOAD]. Payloads are never fragmented, so this must fit
    ///  into a single datagram on all routes between peers.
    pub max_frame_payload: usize,

    /// size of the per-endpoint buffer that accumulates raw reads until they contain complete
    ///  frames. If a read does not fit, the buffer's entire content is discarded.
    pub accumulation_buffer_size: usize,

    /// capacity of each channel's incoming and outgoing queue
    pub queue_capacity: usize,

    pub retransmit_policy: RetransmitPolicy,
    pub time_sync: TimeSyncConfig,

    /// Timed messages are played back when the estimated server time has advanced this far past
    ///  their timestamp. This gives messages that arrive out of order or late a chance to be
    ///  sorted in before they are due.
    pub playback_delay: Duration,

    /// A client re-sends its handshake with this interval until the server replies
    pub handshake_retry_interval: Duration,

    /// Message type ids up to and including this value are reserved for the session protocol
    pub reserved_msg_type_id_threshold: u8,
}

impl Default for TeleportConfig {
    fn default() -> Self {
        TeleportConfig {
            channels: vec![ChannelKind::Unreliable, ChannelKind::Reliable],
            endpoint_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            max_frame_payload: MAX_FRAME_PAYLOAD,
            accumulation_buffer_size: 8192,
            queue_capacity: 8096,
            retransmit_policy: RetransmitPolicy::default(),
            time_sync: TimeSyncConfig::default(),
            playback_delay: Duration::from_millis(80),
            handshake_retry_interval: Duration::from_secs(1),
            reserved_msg_type_id_threshold: 20,
        }
    }
}

impl TeleportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }
        if self.channels.len() > 4 {
            bail!("at most 4 channels are supported, {} were configured", self.channels.len());
        }
        if self.max_frame_payload > MAX_FRAME_PAYLOAD {
            bail!("max frame payload {} exceeds the protocol limit of {}", self.max_frame_payload, MAX_FRAME_PAYLOAD);
        }
        if self.accumulation_buffer_size < self.max_frame_payload + 3 {
            bail!("accumulation buffer must hold at least one maximum size frame");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        if self.endpoint_timeout.is_zero() {
            bail!("endpoint timeout must be positive");
        }
        self.retransmit_policy.validate()?;
        self.time_sync.validate()?;
        Ok(())
    }
}

/// Reliable channels re-send unacknowledged data with this interval. The interval grows with the
///  number of pending packets so that a peer that is falling behind is not flooded with
///  retransmissions: `base_interval * (1 + outbox_len / backlog_scaling)`
#[derive(Clone, Debug)]
pub struct RetransmitPolicy {
    pub base_interval: Duration,
    pub backlog_scaling: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        RetransmitPolicy {
            base_interval: Duration::from_secs(1),
            backlog_scaling: 64,
        }
    }
}

impl RetransmitPolicy {
    pub fn interval(&self, outbox_len: usize) -> Duration {
        let factor = 1 + outbox_len as u32 / self.backlog_scaling.max(1);
        self.base_interval * factor
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.base_interval.is_zero() {
            bail!("retransmit interval must be positive");
        }
        if self.backlog_scaling == 0 {
            bail!("retransmit backlog scaling must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TimeSyncConfig {
    /// how often a client sends a time sync request
    pub interval: Duration,
    /// If a new estimate differs from the current one by more than this, the client's clock
    ///  estimate jumps to the new value instead of being adjusted gradually
    pub hard_reset_threshold: Duration,
    /// differences below this are treated as noise and ignored
    pub min_correction: Duration,
    /// upper bound for a single gradual adjustment
    pub max_correction: Duration,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        TimeSyncConfig {
            interval: Duration::from_secs(10),
            hard_reset_threshold: Duration::from_secs(1),
            min_correction: Duration::from_millis(1),
            max_correction: Duration::from_millis(100),
        }
    }
}

impl TimeSyncConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.min_correction > self.max_correction {
            bail!("min time correction must not exceed max time correction");
        }
        if self.max_correction > self.hard_reset_threshold {
            bail!("max time correction must not exceed the hard reset threshold");
        }
        Ok(())
    }
}
