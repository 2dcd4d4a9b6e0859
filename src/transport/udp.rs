use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::config::TeleportConfig;
use crate::protocol::codec::Decoded;
use crate::transport::endpoint_table::EndpointTable;
use crate::transport::MessageTransport;

/// big enough for any UDP datagram
const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Copy, Clone, Debug)]
enum Role {
    /// the socket is connected to the server
    Client,
    Server,
}

/// A UDP socket with a worker task that moves data between the socket and the channels of all
///  endpoints.
///
/// The worker runs in cycles: it sends everything that is queued for sending, sleeps for the
///  configured poll interval, reads and dispatches every datagram that arrived in the meantime,
///  and finally gives all channels the chance to do housekeeping (e.g. retransmissions). The
///  application interacts with the transport concurrently, through the endpoint table that is
///  shared with the worker.
pub struct UdpTransport {
    config: Arc<TeleportConfig>,
    endpoints: Arc<Mutex<EndpointTable>>,
    stop_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    worker_handle: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl UdpTransport {
    pub fn new(config: Arc<TeleportConfig>) -> anyhow::Result<UdpTransport> {
        config.validate()?;

        Ok(UdpTransport {
            endpoints: Arc::new(Mutex::new(EndpointTable::new(config.clone()))),
            config,
            stop_requested: Default::default(),
            running: Default::default(),
            local_addr: Default::default(),
            worker_handle: Default::default(),
        })
    }

    pub fn config(&self) -> &TeleportConfig {
        &self.config
    }

    /// the address the socket is bound to, if the transport was started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub async fn start_client(&self, host: &str, port: u16) -> anyhow::Result<()> {
        self.check_not_started()?;

        let server_addr = lookup_host((host, port)).await?
            .next()
            .ok_or_else(|| anyhow!("could not resolve {}", host))?;

        let bind_addr = if server_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;
        info!("starting client on {:?} for server {:?}", socket.local_addr()?, server_addr);

        let mut table = EndpointTable::new(self.config.clone());
        table.ping(server_addr);
        self.spawn_worker(socket, Role::Client, table)?;
        Ok(())
    }

    /// binds to the given address and starts listening, returning the actual address the socket
    ///  is bound to
    pub async fn start_listener(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.check_not_started()?;

        let socket = UdpSocket::bind(addr).await?;
        info!("starting listener on {:?}", socket.local_addr()?);

        self.spawn_worker(socket, Role::Server, EndpointTable::new(self.config.clone()))
    }

    /// Signals the worker to stop, and waits for it to terminate. The worker sends whatever is
    ///  still queued before it exits. The worker's result is returned.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.stop_requested.store(true, Ordering::Release);

        let handle = self.worker_handle.lock().take();
        let result = match handle {
            Some(handle) => {
                info!("stopping transport");
                handle.await?
            }
            None => {
                debug!("stop requested for a transport that is not running");
                Ok(())
            }
        };

        *self.local_addr.lock() = None;
        result
    }

    /// serializes a payload and sends it to all endpoints
    pub fn send(&self, serializer: impl FnOnce(&mut BytesMut), channel_id: u8) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        serializer(&mut buf);
        self.send_bytes(channel_id, buf.freeze())
    }

    pub fn send_to(&self, serializer: impl FnOnce(&mut BytesMut), channel_id: u8, endpoints: &[SocketAddr]) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        serializer(&mut buf);
        self.send_bytes_to(channel_id, buf.freeze(), endpoints)
    }

    fn check_not_started(&self) -> anyhow::Result<()> {
        if self.worker_handle.lock().is_some() {
            bail!("transport is already running");
        }
        Ok(())
    }

    fn spawn_worker(&self, socket: UdpSocket, role: Role, table: EndpointTable) -> anyhow::Result<SocketAddr> {
        let local_addr = socket.local_addr()?;

        let mut worker_handle = self.worker_handle.lock();
        if worker_handle.is_some() {
            bail!("transport is already running");
        }

        *self.endpoints.lock() = table;
        *self.local_addr.lock() = Some(local_addr);
        self.stop_requested.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);

        let worker = Worker {
            socket,
            role,
            config: self.config.clone(),
            endpoints: self.endpoints.clone(),
            stop_requested: self.stop_requested.clone(),
        };
        *worker_handle = Some(tokio::spawn(worker.run(self.running.clone())));
        Ok(local_addr)
    }

    /// prepares and enqueues a payload on an endpoint's channel
    fn enqueue(&self, table: &EndpointTable, endpoint: &SocketAddr, channel_id: u8, payload: Bytes) -> anyhow::Result<()> {
        let channel = table.channel(endpoint, channel_id)?;
        channel.send(channel.prepare_to_send(payload)?)
    }

    fn check_payload_len(&self, channel_id: u8, payload: &Bytes) -> anyhow::Result<()> {
        let kind = self.config.channels.get(channel_id as usize)
            .ok_or_else(|| anyhow!("channel {} is not configured", channel_id))?;

        let max_len = self.config.max_frame_payload - kind.overhead();
        if payload.len() > max_len {
            bail!("payload of {} bytes exceeds the maximum of {} bytes for channel {}", payload.len(), max_len, channel_id);
        }
        Ok(())
    }
}

impl Drop for UdpTransport {
    /// NB: Dropping a running transport does not wait for the worker, and data that is still
    ///  queued may or may not be sent. Use [UdpTransport::stop] for an orderly shutdown.
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
    }
}

impl MessageTransport for UdpTransport {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send_bytes(&self, channel_id: u8, payload: Bytes) -> anyhow::Result<()> {
        self.check_payload_len(channel_id, &payload)?;

        let mut table = self.endpoints.lock();
        for endpoint in table.endpoints() {
            self.enqueue(&table, &endpoint, channel_id, payload.clone())?;
        }
        Ok(())
    }

    fn send_bytes_to(&self, channel_id: u8, payload: Bytes, endpoints: &[SocketAddr]) -> anyhow::Result<()> {
        self.check_payload_len(channel_id, &payload)?;

        let mut table = self.endpoints.lock();
        // evict first so that timed out endpoints are not resurrected
        let _ = table.endpoints();
        for endpoint in endpoints {
            self.enqueue(&table, endpoint, channel_id, payload.clone())?;
        }
        Ok(())
    }

    fn drain_incoming(&self) -> anyhow::Result<Vec<(SocketAddr, Bytes)>> {
        Ok(self.endpoints.lock()
            .take_incoming()
            .into_iter()
            .map(|(endpoint, _, payload)| (endpoint, payload))
            .collect())
    }

    fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoints.lock().endpoints()
    }
}

struct Worker {
    socket: UdpSocket,
    role: Role,
    config: Arc<TeleportConfig>,
    endpoints: Arc<Mutex<EndpointTable>>,
    stop_requested: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        debug!("worker started as {:?}", self.role);

        let result = self.do_loop().await;
        match &result {
            Ok(_) => info!("worker stopped"),
            Err(e) => error!("worker terminated with an error: {}", e),
        }

        running.store(false, Ordering::Release);
        result
    }

    async fn do_loop(&self) -> anyhow::Result<()> {
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while !self.stop_requested.load(Ordering::Acquire) {
            self.send_outgoing().await?;
            time::sleep(self.config.poll_interval).await;
            self.receive_available(&mut recv_buf)?;
            self.endpoints.lock().upkeep()?;
        }

        // flush whatever was enqueued until the stop request, e.g. disconnect notifications
        self.send_outgoing().await
    }

    async fn send_outgoing(&self) -> anyhow::Result<()> {
        // the lock must not be held across the awaits below
        let frames = self.endpoints.lock().take_outgoing_frames()?;

        for (to, frame) in frames {
            let result = match self.role {
                Role::Client => self.socket.send(&frame).await,
                Role::Server => self.socket.send_to(&frame, to).await,
            };
            if let Err(e) = result {
                error!("error sending {} bytes to {:?}: {}", frame.len(), to, e);
            }
        }
        Ok(())
    }

    fn receive_available(&self, recv_buf: &mut [u8]) -> anyhow::Result<()> {
        loop {
            match self.socket.try_recv_from(recv_buf) {
                Ok((num_read, from)) => {
                    trace!("received {} bytes from {:?}", num_read, from);
                    self.on_datagram(from, &recv_buf[..num_read])?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    // e.g. 'connection refused' on a client socket if the server is not running
                    warn!("socket error: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn on_datagram(&self, from: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let mut table = self.endpoints.lock();
        table.ping(from);

        let codec = table.codec_mut(&from)?;
        codec.receive_raw(data);

        let mut frames = Vec::new();
        loop {
            match codec.try_parse_next() {
                Decoded::Frame { channel_id, payload } => frames.push((channel_id, payload)),
                Decoded::Corrupt { discarded } => debug!("discarded {} corrupt bytes from {:?}", discarded, from),
                Decoded::Incomplete => break,
            }
        }

        for (channel_id, payload) in frames {
            match table.channel(&from, channel_id) {
                Ok(channel) => channel.receive(payload)?,
                Err(_) => warn!("received frame for unconfigured channel {} from {:?} - dropping", channel_id, from),
            }
        }
        Ok(())
    }
}
