//! Shared service infrastructure for Dazaar peers.
//!
//! This crate provides what a running buyer or seller needs beyond the protocol itself:
//! - Database (SQLite implementation of the market `Store`)
//! - Transport (iroh QUIC connections carrying sessions)
//! - Node (endpoints authenticating as a seller or a buyer)
//! - Process (logging, panic hook, graceful shutdown, run loops)

pub mod config;
pub mod database;
pub mod node;
pub mod process;
pub mod state;
pub mod transport;

// Re-export key types for convenience
pub use config::Config as ServiceConfig;
pub use database::{Database, DatabaseSetupError};
pub use node::{BuyerNode, NodeError, SellerNode};
pub use process::{init_logging, run_buyer, run_seller, ProcessError};
pub use state::{State as ServiceState, StateSetupError};
pub use transport::IrohTransport;
