//! This module contains utilities for testing code that is based on the session layer: an
//!  in-memory transport, listeners that record callbacks, and a simple message type. They are
//!  used for testing the crate itself, but they are also exported for application testing, so
//!  they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod listener;
pub mod message;
pub mod transport;
