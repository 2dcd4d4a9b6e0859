pub mod endpoint_table;
pub mod udp;

use std::net::SocketAddr;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// The transport as seen by the session layer: payloads in and out, by endpoint and channel.
///
/// Payloads passed to `send_bytes` and `send_bytes_to` are raw application data: the transport
///  prepares them for the channel they are sent on.
#[cfg_attr(test, automock)]
pub trait MessageTransport: Send + Sync {
    fn is_running(&self) -> bool;

    /// sends to all known endpoints
    fn send_bytes(&self, channel_id: u8, payload: Bytes) -> anyhow::Result<()>;

    fn send_bytes_to(&self, channel_id: u8, payload: Bytes, endpoints: &[SocketAddr]) -> anyhow::Result<()>;

    /// takes every payload that was received and is ready for processing, with the endpoint it
    ///  came from
    fn drain_incoming(&self) -> anyhow::Result<Vec<(SocketAddr, Bytes)>>;

    /// the currently known endpoints, after evicting those that timed out
    fn endpoints(&self) -> Vec<SocketAddr>;
}
