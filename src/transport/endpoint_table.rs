use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::config::TeleportConfig;
use crate::protocol::codec::PacketCodec;

struct EndpointRecord {
    last_seen: Instant,
    channels: Vec<Arc<dyn Channel>>,
    codec: PacketCodec,
}

/// Per-peer state of a transport: a set of channels (one per configured channel id) and a codec
///  for reassembling frames from raw reads.
///
/// Endpoints are created lazily when they are first contacted, and evicted when they were not
///  heard from for longer than the configured timeout. Eviction happens when the list of
///  endpoints is queried, so the table never exposes an endpoint that timed out.
pub struct EndpointTable {
    config: Arc<TeleportConfig>,
    records: FxHashMap<SocketAddr, EndpointRecord>,
}

impl EndpointTable {
    pub fn new(config: Arc<TeleportConfig>) -> EndpointTable {
        EndpointTable {
            config,
            records: Default::default(),
        }
    }

    /// registers contact with an endpoint, creating its state if it is not known yet
    pub fn ping(&mut self, endpoint: SocketAddr) {
        let now = Instant::now();
        match self.records.entry(endpoint) {
            Entry::Occupied(mut e) => {
                e.get_mut().last_seen = now;
            }
            Entry::Vacant(e) => {
                info!("new endpoint {:?}", endpoint);
                e.insert(EndpointRecord {
                    last_seen: now,
                    channels: self.config.channels.iter()
                        .map(|kind| kind.create(&self.config))
                        .collect(),
                    codec: PacketCodec::new(self.config.accumulation_buffer_size),
                });
            }
        }
    }

    /// evicts timed out endpoints, and returns the remaining ones
    pub fn endpoints(&mut self) -> Vec<SocketAddr> {
        let now = Instant::now();
        let timeout = self.config.endpoint_timeout;
        self.records.retain(|endpoint, record| {
            let is_alive = now.saturating_duration_since(record.last_seen) <= timeout;
            if !is_alive {
                debug!("endpoint {:?} timed out - evicting", endpoint);
            }
            is_alive
        });
        self.records.keys().cloned().collect()
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.records.contains_key(endpoint)
    }

    pub fn channel(&self, endpoint: &SocketAddr, channel_id: u8) -> anyhow::Result<Arc<dyn Channel>> {
        self.channels(endpoint)?
            .get(channel_id as usize)
            .cloned()
            .ok_or_else(|| anyhow!("channel {} is not configured", channel_id))
    }

    pub fn channels(&self, endpoint: &SocketAddr) -> anyhow::Result<&[Arc<dyn Channel>]> {
        self.records.get(endpoint)
            .map(|r| r.channels.as_slice())
            .ok_or_else(|| anyhow!("unknown endpoint {:?}", endpoint))
    }

    pub fn codec_mut(&mut self, endpoint: &SocketAddr) -> anyhow::Result<&mut PacketCodec> {
        self.records.get_mut(endpoint)
            .map(|r| &mut r.codec)
            .ok_or_else(|| anyhow!("unknown endpoint {:?}", endpoint))
    }

    /// Takes all data that is ready for sending from all channels of all endpoints, and returns it
    ///  framed, with the endpoint each frame should be sent to.
    pub fn take_outgoing_frames(&mut self) -> anyhow::Result<Vec<(SocketAddr, Bytes)>> {
        let mut result = Vec::new();
        for endpoint in self.endpoints() {
            for (channel_id, channel) in self.channels(&endpoint)?.iter().enumerate() {
                while let Some(data) = channel.pop_outgoing() {
                    result.push((endpoint, PacketCodec::encode_frame(channel_id as u8, &data)?));
                }
            }
        }
        Ok(result)
    }

    /// Takes all received payloads that are ready for the application, in channel order for each
    ///  endpoint
    pub fn take_incoming(&mut self) -> Vec<(SocketAddr, u8, Bytes)> {
        let mut result = Vec::new();
        for endpoint in self.endpoints() {
            if let Ok(channels) = self.channels(&endpoint) {
                for (channel_id, channel) in channels.iter().enumerate() {
                    while let Some(payload) = channel.pop_incoming() {
                        result.push((endpoint, channel_id as u8, payload));
                    }
                }
            }
        }
        result
    }

    pub fn upkeep(&mut self) -> anyhow::Result<()> {
        for record in self.records.values() {
            for channel in &record.channels {
                channel.upkeep()?;
            }
        }
        Ok(())
    }
}
