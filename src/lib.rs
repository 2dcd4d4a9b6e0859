//! A UDP transport for real-time applications, with a thin session layer on top.
//!
//! The [transport] moves payloads between endpoints over a single UDP socket. Payloads travel on
//!  numbered [channel]s, each of which can add its own guarantees (ordering, retransmission,
//!  checksums, reassembly), and are framed and checksummed by the packet [protocol::codec].
//!
//! The [session] layer adds client/server sessions with a lightweight authentication scheme,
//!  typed messages, clock synchronization and time-stamped playback of messages on the client.

pub mod channel;
pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
