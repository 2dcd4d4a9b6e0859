//! The session layer on top of the transport: handshake and authentication, disconnects, clock
//!  synchronization, and dispatch of typed application messages.
//!
//! Every payload starts with a one-byte message type id. Ids up to a configured threshold are
//!  reserved for the session protocol, and the rest identify application messages.
//!
//! ```ascii
//! client -> server, initial handshake:   [0] [0x00]
//! server -> client, handshake reply:     [0] [auth_key] [client_id: u32]
//! client -> server, everything else:     [type] [(auth_key << 1) | 1] [client_id: u32] [body]
//! server -> client, everything else:     [type] [body]
//!
//! disconnect:  client -> server  [1] [auth header] [reason]
//!              server -> client  [1] [reason]
//! time sync:   client -> server  [2] [auth header] [client_time: f64]
//!              server -> client  [2] [client_time: f64] [server_time: f64]
//! ```
//!
//! All numbers are big endian, times are seconds on the sender's local clock.

pub mod client;
pub mod clock_sync;
pub mod message;
pub mod registry;
pub mod server;
pub mod timed_queue;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// message type ids that are handled by the session layer itself
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MsgTypeId {
    Handshake = 0,
    Disconnect = 1,
    TimeSync = 2,
}

/// the low bit of the header byte that follows the message type id in client messages
const AUTHENTICATED_FLAG: u8 = 1;

/// why the server ended a client's session
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ServerDisconnectReason {
    ServerWantsToDisconnectClient = 0,
    ClientInitiatedDisconnect = 1,
    ServerShutdown = 2,
    /// the client's endpoint was evicted from the transport after not being heard from
    ClientTimeout = 3,
}

/// why a client's session ended
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ClientDisconnectReason {
    ClientSideDisconnectRequested = 0,
    ServerTimeout = 1,
    ServerRequestedDisconnect = 2,
}
