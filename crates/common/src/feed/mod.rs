//! Append-only content log
//!
//! A [`Feed`] is a handle onto a shared log of entries, addressed by a public key.
//! Three kinds of handle exist:
//!
//! - **Origin**: created from a keypair, the only handle that can `append`
//! - **View**: created with [`Feed::rekey`], exposes the same entries under a
//!   different identity; entries it serves are signed by the view's key
//! - **Replica**: created with [`Feed::replica`], starts empty and is filled by
//!   replication; entries are verified against the replica's key
//!
//! Each handle carries its own uploading/downloading gates and close flag, so a
//! per-buyer view can be paused or closed without touching the content feed.

mod replicate;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::crypto::{discovery_key, DiscoveryKey, KeyPair, PublicKey, SecretKey, Signature};

pub use replicate::{FeedMessage, Replication};

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("feed is closed")]
    Closed,
    #[error("feed is not writable")]
    ReadOnly,
    #[error("entry {0} failed signature verification")]
    InvalidSignature(u64),
}

/// Replication gates of a single handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gates {
    pub uploading: bool,
    pub downloading: bool,
}

impl Default for Gates {
    fn default() -> Self {
        Self {
            uploading: true,
            downloading: true,
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: BTreeMap<u64, Bytes>,
    /// Length as far as this log knows: local appends or remote announcements
    length: u64,
    /// Indices a sparse reader is waiting on
    wanted: BTreeSet<u64>,
}

#[derive(Debug)]
struct Log {
    state: RwLock<LogState>,
    /// Bumped on every change to entries, length or wanted set
    version: watch::Sender<u64>,
    length: watch::Sender<u64>,
}

impl Log {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        let (length, _) = watch::channel(0);
        Self {
            state: RwLock::new(LogState::default()),
            version,
            length,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn publish_length(&self, length: u64) {
        self.length.send_if_modified(|current| {
            if *current < length {
                *current = length;
                true
            } else {
                false
            }
        });
    }
}

#[derive(Debug)]
struct FeedInner {
    key: PublicKey,
    secret: Option<SecretKey>,
    writable: bool,
    sparse: bool,
    log: Arc<Log>,
    gates: watch::Sender<Gates>,
    closed: AtomicBool,
}

/// Handle onto a content log
#[derive(Debug, Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl Feed {
    fn from_parts(
        key: PublicKey,
        secret: Option<SecretKey>,
        writable: bool,
        sparse: bool,
        log: Arc<Log>,
    ) -> Self {
        let (gates, _) = watch::channel(Gates::default());
        Self {
            inner: Arc::new(FeedInner {
                key,
                secret,
                writable,
                sparse,
                log,
                gates,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a new, empty, writable feed owned by `key_pair`
    pub fn new(key_pair: KeyPair) -> Self {
        Self::from_parts(
            key_pair.public,
            Some(key_pair.secret),
            true,
            false,
            Arc::new(Log::new()),
        )
    }

    /// Create a writable feed under a freshly generated keypair
    pub fn generate() -> Self {
        Self::new(KeyPair::from(SecretKey::generate()))
    }

    /// Create an empty replica of the feed addressed by `key`
    ///
    /// Sparse replicas only download entries someone asked to `read`.
    pub fn replica(key: PublicKey, sparse: bool) -> Self {
        Self::from_parts(key, None, false, sparse, Arc::new(Log::new()))
    }

    /// Expose the same entries under a different identity
    ///
    /// The returned view serves entries signed by `key_pair`. It shares the log
    /// with `self` but has its own gates and close flag.
    pub fn rekey(&self, key_pair: KeyPair) -> Self {
        Self::from_parts(
            key_pair.public,
            Some(key_pair.secret),
            false,
            self.inner.sparse,
            self.inner.log.clone(),
        )
    }

    pub fn key(&self) -> PublicKey {
        self.inner.key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        discovery_key(&self.inner.key)
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    pub fn is_sparse(&self) -> bool {
        self.inner.sparse
    }

    /// Whether this handle can sign entries it serves
    pub fn can_serve(&self) -> bool {
        self.inner.secret.is_some()
    }

    pub async fn ready(&self) -> Result<(), FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.inner.log.state.read().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries held locally
    pub fn downloaded(&self) -> u64 {
        self.inner.log.state.read().entries.len() as u64
    }

    /// Entry at `index` if it is held locally
    pub fn get(&self, index: u64) -> Option<Bytes> {
        self.inner.log.state.read().entries.get(&index).cloned()
    }

    /// Wait for the entry at `index`, marking it as wanted until it arrives
    pub async fn read(&self, index: u64) -> Result<Bytes, FeedError> {
        let mut version = self.inner.log.version.subscribe();
        let mut registered = false;
        loop {
            if self.is_closed() {
                return Err(FeedError::Closed);
            }
            if let Some(data) = self.get(index) {
                if registered {
                    self.inner.log.state.write().wanted.remove(&index);
                }
                return Ok(data);
            }
            if !registered {
                registered = true;
                self.inner.log.state.write().wanted.insert(index);
                self.inner.log.bump();
            }
            if version.changed().await.is_err() {
                return Err(FeedError::Closed);
            }
        }
    }

    /// Append an entry, returning its index
    pub fn append(&self, data: impl Into<Bytes>) -> Result<u64, FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        if !self.inner.writable {
            return Err(FeedError::ReadOnly);
        }
        let index = {
            let mut state = self.inner.log.state.write();
            let index = state.length;
            state.entries.insert(index, data.into());
            state.length = index + 1;
            index
        };
        tracing::debug!(feed = %self.inner.key, index, "appended entry");
        self.inner.log.publish_length(index + 1);
        self.inner.log.bump();
        Ok(index)
    }

    /// Live length notifications
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.log.length.subscribe()
    }

    pub fn gates(&self) -> Gates {
        *self.inner.gates.borrow()
    }

    pub fn uploading(&self) -> bool {
        self.gates().uploading
    }

    pub fn downloading(&self) -> bool {
        self.gates().downloading
    }

    pub fn set_uploading(&self, uploading: bool) {
        self.inner.gates.send_if_modified(|gates| {
            let changed = gates.uploading != uploading;
            gates.uploading = uploading;
            changed
        });
    }

    pub fn set_downloading(&self, downloading: bool) {
        self.inner.gates.send_if_modified(|gates| {
            let changed = gates.downloading != downloading;
            gates.downloading = downloading;
            changed
        });
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(feed = %self.inner.key, "closing feed handle");
            self.inner.gates.send_modify(|_| {});
            self.inner.log.bump();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether two handles are the same handle (not merely the same log)
    pub fn ptr_eq(&self, other: &Feed) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn subscribe_log(&self) -> watch::Receiver<u64> {
        self.inner.log.version.subscribe()
    }

    fn subscribe_gates(&self) -> watch::Receiver<Gates> {
        self.inner.gates.subscribe()
    }

    /// Entry at `index` with this handle's signature over it
    fn signed_entry(&self, index: u64) -> Option<(Bytes, Signature)> {
        let secret = self.inner.secret.as_ref()?;
        let data = self.get(index)?;
        let signature = secret.sign(&entry_digest(index, &data));
        Some((data, signature))
    }

    /// Verify and store an entry received from a peer
    fn put_verified(&self, index: u64, data: Bytes, signature: &Signature) -> Result<(), FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        self.inner
            .key
            .verify(&entry_digest(index, &data), signature)
            .map_err(|_| FeedError::InvalidSignature(index))?;
        let length = {
            let mut state = self.inner.log.state.write();
            state.entries.insert(index, data);
            state.wanted.remove(&index);
            state.length = state.length.max(index + 1);
            state.length
        };
        self.inner.log.publish_length(length);
        self.inner.log.bump();
        Ok(())
    }

    /// Record a length announced by a peer
    fn set_remote_length(&self, length: u64) {
        let changed = {
            let mut state = self.inner.log.state.write();
            if length > state.length {
                state.length = length;
                true
            } else {
                false
            }
        };
        if changed {
            self.inner.log.publish_length(length);
            self.inner.log.bump();
        }
    }

    /// Indices this handle should fetch, in order
    fn missing(&self) -> Vec<u64> {
        let state = self.inner.log.state.read();
        if self.inner.sparse {
            state
                .wanted
                .iter()
                .copied()
                .filter(|index| *index < state.length && !state.entries.contains_key(index))
                .collect()
        } else {
            (0..state.length)
                .filter(|index| !state.entries.contains_key(index))
                .collect()
        }
    }
}

/// Digest an entry is signed over: BLAKE3(index || data)
fn entry_digest(index: u64, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&index.to_be_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_append_and_get() {
        let feed = Feed::generate();
        assert!(feed.is_empty());
        assert_eq!(feed.append("hello").unwrap(), 0);
        assert_eq!(feed.append("world").unwrap(), 1);
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.get(1).unwrap(), Bytes::from("world"));
        assert_eq!(feed.read(0).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_rekey_shares_entries_not_identity() {
        let feed = Feed::generate();
        feed.append("a").unwrap();

        let view = feed.rekey(KeyPair::from(SecretKey::generate()));
        assert_ne!(view.key(), feed.key());
        assert_eq!(view.get(0).unwrap(), Bytes::from("a"));
        assert!(matches!(view.append("b"), Err(FeedError::ReadOnly)));

        feed.append("b").unwrap();
        assert_eq!(view.len(), 2);

        view.close();
        assert!(view.is_closed());
        assert!(!feed.is_closed());
        assert_eq!(feed.append("c").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replica_verifies_signatures() {
        let feed = Feed::generate();
        feed.append("data").unwrap();
        let view = feed.rekey(KeyPair::from(SecretKey::generate()));

        let (data, sig) = view.signed_entry(0).unwrap();
        let wrong = Feed::replica(feed.key(), false);
        assert!(matches!(
            wrong.put_verified(0, data.clone(), &sig),
            Err(FeedError::InvalidSignature(0))
        ));

        let replica = Feed::replica(view.key(), false);
        replica.put_verified(0, data, &sig).unwrap();
        assert_eq!(replica.get(0).unwrap(), Bytes::from("data"));
        assert_eq!(replica.len(), 1);
    }

    #[tokio::test]
    async fn test_read_waits_and_close_wakes() {
        let replica = Feed::replica(SecretKey::generate().public(), true);
        let reader = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.read(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        replica.set_remote_length(4);
        assert_eq!(replica.missing(), vec![3]);

        replica.close();
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(FeedError::Closed)));
    }

    #[test]
    fn test_gates() {
        let feed = Feed::generate();
        assert!(feed.uploading() && feed.downloading());
        feed.set_downloading(false);
        assert!(!feed.downloading());
        assert!(feed.uploading());
    }
}
