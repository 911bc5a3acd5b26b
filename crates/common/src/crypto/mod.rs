//! Cryptographic primitives for Dazaar
//!
//! - **Identity & Authentication**: Ed25519 keypairs for market, seller and feed identities
//! - **Derivation**: every keypair a market uses is a pure function of its master key
//!   and a context string, so buyers get stable yet uncorrelatable feed identities
//! - **Discovery**: non-secret topic identifiers derived from public keys
//!
//! Feed entries are signed with the serving identity's secret key and verified by
//! replicas against the public key they expect.

mod derive;
mod keys;

pub use derive::{
    derive_key_pair, discovery_key, DiscoveryKey, MasterKey, MasterKeyError, MASTER_KEY_SIZE,
};
pub use ed25519_dalek::Signature;
pub use keys::{EncodedKeyPair, KeyError, KeyPair, PublicKey, SecretKey};
