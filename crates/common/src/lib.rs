/**
 * Cryptographic types and operations.
 *  - Public and secret key implementations
 *  - Deterministic keypair derivation from a master key
 */
pub mod crypto;
/**
 * Append-only content log with re-keyed views
 *  and a minimal replication exchange.
 */
pub mod feed;
/**
 * Identity store, buyers and sellers.
 */
pub mod market;
/**
 * Session protocol shared by buyers and sellers:
 *  wire messages and the per-connection driver.
 */
pub mod protocol;
/**
 * Hierarchical JSON key-value storage.
 */
pub mod store;
/**
 * Peer discovery interface.
 */
pub mod swarm;
/**
 * In-process harness for buyer/seller tests.
 */
pub mod testkit;
/**
 * Authenticated frame transport interface.
 */
pub mod transport;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::crypto::{KeyPair, MasterKey, PublicKey, SecretKey};
    pub use crate::feed::Feed;
    pub use crate::market::{
        validator, Buyer, BuyerEvent, BuyerOptions, Market, MarketConfig, MarketError, Seller,
        SellerEvent, SellerOptions, Target,
    };
    pub use crate::protocol::{Peer, SessionError, SessionHandle};
    pub use crate::store::{PutCondition, Store};
    pub use crate::transport::Transport;
    pub use crate::version::build_info;
}
