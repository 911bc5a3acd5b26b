//! Deterministic keypair derivation
//!
//! Every identity a market uses is derived from one 32 byte master key and a
//! context string naming what the identity is for (`buys/key-pair`,
//! `sales/<feed>/key-pair`, `sales/<feed>/feeds/<buyer>`). Restoring the master
//! key therefore restores every identity the market ever issued.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use super::keys::{KeyPair, PublicKey, SecretKey};

/// Size of a master key in bytes
pub const MASTER_KEY_SIZE: usize = 32;

/// Domain tag mixed into every derivation
const DERIVE_TAG: &[u8] = b"dazaar";
/// Domain tag used for discovery keys
const DISCOVERY_TAG: &[u8] = b"hypercore";

#[derive(Debug, thiserror::Error)]
pub enum MasterKeyError {
    #[error("master key error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Root key material of one market
#[derive(PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MasterKey([u8; MASTER_KEY_SIZE]);

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl Deref for MasterKey {
    type Target = [u8; MASTER_KEY_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; MASTER_KEY_SIZE]> for MasterKey {
    fn from(bytes: [u8; MASTER_KEY_SIZE]) -> Self {
        MasterKey(bytes)
    }
}

impl MasterKey {
    /// Generate a new random master key using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut buff = [0; MASTER_KEY_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    /// Create a master key from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not exactly `MASTER_KEY_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, MasterKeyError> {
        if data.len() != MASTER_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid master key size, expected {}, got {}",
                MASTER_KEY_SIZE,
                data.len()
            )
            .into());
        }
        let mut buff = [0; MASTER_KEY_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    pub fn from_hex(hex: &str) -> Result<Self, MasterKeyError> {
        let bytes =
            hex::decode(hex).map_err(|e| anyhow::anyhow!("master key hex decode error: {}", e))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the keypair named by `context`
    pub fn derive(&self, context: &str) -> KeyPair {
        derive_key_pair(self, context)
    }
}

/// Derive a keypair from a master key and a context string.
///
/// The seed is a BLAKE3 keyed hash (keyed by the master key) over the domain tag
/// followed by the context bytes. The seed is used directly as an Ed25519 secret key.
pub fn derive_key_pair(master: &MasterKey, context: &str) -> KeyPair {
    let seed = blake3::Hasher::new_keyed(&master.0)
        .update(DERIVE_TAG)
        .update(context.as_bytes())
        .finalize();
    KeyPair::from(SecretKey::from(*seed.as_bytes()))
}

/// Non-secret topic identifier for a public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.to_hex())
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Discovery key for `key`: BLAKE3 keyed by the public key over a fixed tag
pub fn discovery_key(key: &PublicKey) -> DiscoveryKey {
    let hash = blake3::keyed_hash(&key.to_bytes(), DISCOVERY_TAG);
    DiscoveryKey(*hash.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let master = MasterKey::generate();
        let a = derive_key_pair(&master, "buys/key-pair");
        let b = master.derive("buys/key-pair");
        assert_eq!(a, b);

        let other = derive_key_pair(&master, "sales/00/key-pair");
        assert_ne!(a.public, other.public);
    }

    #[test]
    fn test_derivation_depends_on_master() {
        let a = derive_key_pair(&MasterKey::from([1u8; 32]), "buys/key-pair");
        let b = derive_key_pair(&MasterKey::from([2u8; 32]), "buys/key-pair");
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn test_derived_keys_sign() {
        let pair = MasterKey::generate().derive("ctx");
        let sig = pair.secret.sign(b"payload");
        assert!(pair.public.verify(b"payload", &sig).is_ok());
    }

    #[test]
    fn test_master_key_hex() {
        let master = MasterKey::generate();
        let recovered = MasterKey::from_hex(&master.to_hex()).unwrap();
        assert_eq!(master, recovered);
        assert!(MasterKey::from_hex("abcd").is_err());
        assert!(MasterKey::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_discovery_key() {
        let key = SecretKey::generate().public();
        assert_eq!(discovery_key(&key), discovery_key(&key));
        assert_ne!(discovery_key(&key).to_bytes(), key.to_bytes());
    }
}
