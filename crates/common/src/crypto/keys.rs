use std::fmt;

use iroh::{PublicKey as IrohPublicKey, SecretKey as IrohSecretKey};
use serde::{Deserialize, Serialize};

const SECRET_KEY_SIZE: usize = 32;
const PUBLIC_KEY_SIZE: usize = 32;
const PEM_TAG: &str = "PRIVATE KEY";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
}

// `anyhow::Error` is not `Clone`; the copy keeps the rendered chain
impl Clone for KeyError {
    fn clone(&self) -> Self {
        match self {
            KeyError::Default(e) => KeyError::Default(anyhow::anyhow!("{:#}", e)),
        }
    }
}

fn decode_hex<const N: usize>(hex: &str, what: &str) -> Result<[u8; N], KeyError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut buf = [0; N];
    hex::decode_to_slice(hex, &mut buf).map_err(|e| anyhow::anyhow!("bad {} hex: {}", what, e))?;
    Ok(buf)
}

/// Ed25519 public key naming a buyer, a seller or a feed
///
/// Wraps the iroh key so a seller's identity is also the endpoint id buyers dial.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(IrohPublicKey);

impl From<IrohPublicKey> for PublicKey {
    fn from(key: IrohPublicKey) -> Self {
        PublicKey(key)
    }
}

impl From<PublicKey> for IrohPublicKey {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, KeyError> {
        let key = IrohPublicKey::from_bytes(bytes)
            .map_err(|e| anyhow::anyhow!("invalid public key: {}", e))?;
        Ok(PublicKey(key))
    }

    /// Parse plain or `0x`-prefixed hex
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        Self::from_bytes(&decode_hex(hex, "public key")?)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Check a feed entry signature made by the matching secret key
    pub fn verify(
        &self,
        msg: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.to_bytes())?.verify_strict(msg, signature)
    }
}

/// Ed25519 secret key
///
/// Market identities are derived from the master key and never stored on their
/// own. Keys made by `keygen` are written as PEM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretKey(pub IrohSecretKey);

impl From<[u8; SECRET_KEY_SIZE]> for SecretKey {
    fn from(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(IrohSecretKey::from_bytes(&secret))
    }
}

impl SecretKey {
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        Ok(Self::from(decode_hex::<SECRET_KEY_SIZE>(hex, "secret key")?))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self::from(bytes)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public())
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_TAG, self.to_bytes()))
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        if pem.tag() != PEM_TAG {
            return Err(anyhow::anyhow!("unexpected PEM tag {}", pem.tag()).into());
        }
        let bytes: [u8; SECRET_KEY_SIZE] = pem.contents().try_into().map_err(|_| {
            anyhow::anyhow!("PEM holds {} bytes, not a secret key", pem.contents().len())
        })?;
        Ok(Self::from(bytes))
    }

    /// Detached signature over `msg`
    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        // iroh pins its own ed25519_dalek; both share the 64-byte encoding
        ed25519_dalek::Signature::from_bytes(&self.0.sign(msg).to_bytes())
    }
}

/// A public/secret keypair, as issued by key derivation
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl From<SecretKey> for KeyPair {
    fn from(secret: SecretKey) -> Self {
        Self {
            public: secret.public(),
            secret,
        }
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public && self.secret.to_bytes() == other.secret.to_bytes()
    }
}

impl Eq for KeyPair {}

/// Stored form of a keypair: both halves hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedKeyPair {
    pub public_key: String,
    pub secret_key: String,
}

impl From<&KeyPair> for EncodedKeyPair {
    fn from(key_pair: &KeyPair) -> Self {
        Self {
            public_key: key_pair.public.to_hex(),
            secret_key: key_pair.secret.to_hex(),
        }
    }
}

impl TryFrom<&EncodedKeyPair> for KeyPair {
    type Error = KeyError;
    fn try_from(encoded: &EncodedKeyPair) -> Result<Self, Self::Error> {
        let secret = SecretKey::from_hex(&encoded.secret_key)?;
        let public = PublicKey::from_hex(&encoded.public_key)?;
        if secret.public() != public {
            return Err(anyhow::anyhow!("stored public key does not match secret key").into());
        }
        Ok(Self { public, secret })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_accepts_prefix() {
        let secret = SecretKey::generate();
        let public = secret.public();

        let recovered = SecretKey::from_hex(&format!("0x{}", secret.to_hex())).unwrap();
        assert_eq!(recovered.to_bytes(), secret.to_bytes());
        assert_eq!(PublicKey::from_hex(&public.to_hex()).unwrap(), public);
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_pem_rejects_other_tags() {
        let secret = SecretKey::generate();
        let recovered = SecretKey::from_pem(&secret.to_pem()).unwrap();
        assert_eq!(recovered.public(), secret.public());

        let other = pem::encode(&pem::Pem::new("PUBLIC KEY", secret.public().to_bytes()));
        assert!(SecretKey::from_pem(&other).is_err());
        assert!(SecretKey::from_pem("not a pem").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();
        let message = b"entry 0";

        let signature = secret_key.sign(message);
        assert!(public_key.verify(message, &signature).is_ok());
        assert!(public_key.verify(b"entry 1", &signature).is_err());
        assert!(SecretKey::generate().public().verify(message, &signature).is_err());
    }

    #[test]
    fn test_encoded_key_pair_rejects_mismatch() {
        let a = KeyPair::from(SecretKey::generate());
        let b = KeyPair::from(SecretKey::generate());

        let mut encoded = EncodedKeyPair::from(&a);
        assert_eq!(KeyPair::try_from(&encoded).unwrap(), a);

        encoded.public_key = b.public.to_hex();
        assert!(KeyPair::try_from(&encoded).is_err());
    }
}
