//! Dazaar session protocol
//!
//! One session runs per authenticated connection. The driver in [`session`] is
//! shared by both roles: it owns the connection, the replication of at most one
//! feed, the pending validate call and the revalidation timer, and hands protocol
//! frames to the role (buyer or seller) that spawned it.

mod messages;
pub mod session;

/// ALPN identifier for the Dazaar protocol
pub const ALPN: &[u8] = b"/dazaar/1";

pub use messages::{parse_json, Channel, Message, SELLER_ID_SIZE};
pub use session::{Peer, SessionError, SessionHandle, Validation, OUTBOUND_CAPACITY};
