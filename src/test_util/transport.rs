use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::bail;
use bytes::Bytes;
use parking_lot::Mutex;
use crate::transport::MessageTransport;

/// A [MessageTransport] that keeps everything in memory: sent payloads are recorded, and
///  incoming payloads are injected by test code or delivered from another in-memory transport.
///  There is no loss or reordering, and channel ids are recorded but have no other effect.
///
/// Like the UDP transport, it knows an endpoint once data was received from it (or it was added
///  explicitly), and sending to unknown endpoints fails.
pub struct InMemoryTransport {
    local_addr: SocketAddr,
    running: AtomicBool,
    known_endpoints: Mutex<Vec<SocketAddr>>,
    incoming: Mutex<VecDeque<(SocketAddr, Bytes)>>,
    sent: Mutex<Vec<(SocketAddr, u8, Bytes)>>,
}

impl InMemoryTransport {
    pub fn new(local_addr: SocketAddr) -> InMemoryTransport {
        InMemoryTransport {
            local_addr,
            running: AtomicBool::new(true),
            known_endpoints: Default::default(),
            incoming: Default::default(),
            sent: Default::default(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn add_endpoint(&self, endpoint: SocketAddr) {
        let mut known = self.known_endpoints.lock();
        if !known.contains(&endpoint) {
            known.push(endpoint);
        }
    }

    /// simulates the eviction of an endpoint after a timeout
    pub fn forget_endpoint(&self, endpoint: SocketAddr) {
        self.known_endpoints.lock().retain(|e| e != &endpoint);
    }

    pub fn inject(&self, from: SocketAddr, payload: &[u8]) {
        self.add_endpoint(from);
        self.incoming.lock().push_back((from, Bytes::copy_from_slice(payload)));
    }

    /// returns everything that was sent as `(to, channel_id, payload)`, clearing the record
    pub fn take_sent(&self) -> Vec<(SocketAddr, u8, Bytes)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Moves all recorded payloads for `other` to its incoming queue, returning their number.
    ///  Payloads for other endpoints remain recorded.
    pub fn deliver_to(&self, other: &InMemoryTransport) -> usize {
        let mut sent = self.sent.lock();
        let mut num_delivered = 0;
        sent.retain(|(to, _, payload)| {
            if *to == other.local_addr {
                other.inject(self.local_addr, payload);
                num_delivered += 1;
                false
            }
            else {
                true
            }
        });
        num_delivered
    }
}

impl MessageTransport for InMemoryTransport {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send_bytes(&self, channel_id: u8, payload: Bytes) -> anyhow::Result<()> {
        let endpoints = self.endpoints();
        self.send_bytes_to(channel_id, payload, &endpoints)
    }

    fn send_bytes_to(&self, channel_id: u8, payload: Bytes, endpoints: &[SocketAddr]) -> anyhow::Result<()> {
        let known = self.known_endpoints.lock();
        let mut sent = self.sent.lock();
        for endpoint in endpoints {
            if !known.contains(endpoint) {
                bail!("unknown endpoint {:?}", endpoint);
            }
            sent.push((*endpoint, channel_id, payload.clone()));
        }
        Ok(())
    }

    fn drain_incoming(&self) -> anyhow::Result<Vec<(SocketAddr, Bytes)>> {
        Ok(self.incoming.lock().drain(..).collect())
    }

    fn endpoints(&self) -> Vec<SocketAddr> {
        self.known_endpoints.lock().clone()
    }
}
