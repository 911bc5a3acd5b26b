use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{Feed, FeedError, Gates};
use crate::crypto::Signature;

/// Frames exchanged between a serving handle and a replica
///
/// This is a deliberately small request/data exchange: the server announces its
/// length, the replica requests indices, the server answers with signed data or
/// refuses while its uploading gate is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedMessage {
    Have {
        length: u64,
    },
    Request {
        index: u64,
    },
    Data {
        index: u64,
        data: Vec<u8>,
        signature: Signature,
    },
    Refused {
        index: u64,
    },
}

/// Live replication of one feed handle over one session
///
/// The session owns this and drives it: it forwards inbound [`FeedMessage`]s to
/// [`Replication::on_message`], and whenever [`Replication::changed`] resolves it
/// calls [`Replication::poll`] and sends whatever comes back.
#[derive(Debug)]
pub struct Replication {
    feed: Feed,
    log: watch::Receiver<u64>,
    gates: watch::Receiver<Gates>,
    /// Requests in flight
    requested: BTreeSet<u64>,
    /// Indices the server refused; retried on its next announcement
    refused: BTreeSet<u64>,
    /// Length last announced to the remote, None while not uploading
    announced: Option<u64>,
}

impl Replication {
    pub fn new(feed: Feed) -> Self {
        let log = feed.subscribe_log();
        let gates = feed.subscribe_gates();
        Self {
            feed,
            log,
            gates,
            requested: BTreeSet::new(),
            refused: BTreeSet::new(),
            announced: None,
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    /// Resolves when the log or the gates of the feed changed
    pub async fn changed(&mut self) {
        tokio::select! {
            res = self.log.changed() => {
                if res.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            res = self.gates.changed() => {
                if res.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    /// Frames to send given the current local state
    pub fn poll(&mut self) -> Vec<FeedMessage> {
        let mut out = Vec::new();
        if self.feed.is_closed() {
            return out;
        }

        if self.feed.can_serve() {
            if self.feed.uploading() {
                let length = self.feed.len();
                if self.announced != Some(length) {
                    self.announced = Some(length);
                    out.push(FeedMessage::Have { length });
                }
            } else {
                // re-announce once uploading resumes so the replica retries
                self.announced = None;
            }
        } else if self.feed.downloading() {
            for index in self.feed.missing() {
                if self.requested.contains(&index) || self.refused.contains(&index) {
                    continue;
                }
                self.requested.insert(index);
                out.push(FeedMessage::Request { index });
            }
        }

        out
    }

    /// Handle an inbound frame, returning the frames to answer with
    pub fn on_message(&mut self, msg: FeedMessage) -> Result<Vec<FeedMessage>, FeedError> {
        match msg {
            FeedMessage::Have { length } => {
                if self.feed.can_serve() {
                    return Ok(Vec::new());
                }
                self.refused.clear();
                self.feed.set_remote_length(length);
                Ok(self.poll())
            }
            FeedMessage::Request { index } => {
                if !self.feed.can_serve() || !self.feed.uploading() || self.feed.is_closed() {
                    return Ok(vec![FeedMessage::Refused { index }]);
                }
                match self.feed.signed_entry(index) {
                    Some((data, signature)) => Ok(vec![FeedMessage::Data {
                        index,
                        data: data.to_vec(),
                        signature,
                    }]),
                    None => Ok(vec![FeedMessage::Refused { index }]),
                }
            }
            FeedMessage::Data {
                index,
                data,
                signature,
            } => {
                self.requested.remove(&index);
                if self.feed.can_serve() {
                    return Ok(Vec::new());
                }
                if let Err(e) = self.feed.put_verified(index, data.into(), &signature) {
                    self.refused.insert(index);
                    return Err(e);
                }
                Ok(self.poll())
            }
            FeedMessage::Refused { index } => {
                self.requested.remove(&index);
                self.refused.insert(index);
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, SecretKey};

    /// Pump frames between two replications until both go quiet
    fn pump(server: &mut Replication, client: &mut Replication) {
        let mut to_client = server.poll();
        let mut to_server = client.poll();
        while !to_client.is_empty() || !to_server.is_empty() {
            let mut next_server = Vec::new();
            for msg in to_client.drain(..) {
                next_server.extend(client.on_message(msg).unwrap());
            }
            let mut next_client = Vec::new();
            for msg in to_server.drain(..) {
                next_client.extend(server.on_message(msg).unwrap());
            }
            to_server = next_server;
            to_client = next_client;
        }
    }

    #[test]
    fn test_full_replication() {
        let feed = Feed::generate();
        feed.append("a").unwrap();
        feed.append("b").unwrap();
        let view = feed.rekey(KeyPair::from(SecretKey::generate()));
        let replica = Feed::replica(view.key(), false);

        let mut server = Replication::new(view);
        let mut client = Replication::new(replica.clone());
        pump(&mut server, &mut client);

        assert_eq!(replica.downloaded(), 2);
        assert_eq!(replica.get(1).unwrap().as_ref(), b"b");

        feed.append("c").unwrap();
        pump(&mut server, &mut client);
        assert_eq!(replica.get(2).unwrap().as_ref(), b"c");
    }

    #[test]
    fn test_upload_gate_refuses_until_reopened() {
        let feed = Feed::generate();
        feed.append("a").unwrap();
        let view = feed.rekey(KeyPair::from(SecretKey::generate()));
        let replica = Feed::replica(view.key(), false);

        let mut server = Replication::new(view.clone());
        let mut client = Replication::new(replica.clone());

        // replica learns the length, then the server pauses before serving
        for msg in server.poll() {
            let requests = client.on_message(msg).unwrap();
            view.set_uploading(false);
            for req in requests {
                for answer in server.on_message(req).unwrap() {
                    assert!(matches!(answer, FeedMessage::Refused { index: 0 }));
                    client.on_message(answer).unwrap();
                }
            }
        }
        pump(&mut server, &mut client);
        assert_eq!(replica.downloaded(), 0);

        view.set_uploading(true);
        pump(&mut server, &mut client);
        assert_eq!(replica.downloaded(), 1);
    }

    #[test]
    fn test_download_gate_stops_requests() {
        let feed = Feed::generate();
        feed.append("a").unwrap();
        let replica = Feed::replica(feed.key(), false);
        replica.set_downloading(false);

        let mut server = Replication::new(feed);
        let mut client = Replication::new(replica.clone());
        pump(&mut server, &mut client);
        assert_eq!(replica.len(), 1);
        assert_eq!(replica.downloaded(), 0);

        replica.set_downloading(true);
        pump(&mut server, &mut client);
        assert_eq!(replica.downloaded(), 1);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let feed = Feed::generate();
        feed.append("a").unwrap();
        let view = feed.rekey(KeyPair::from(SecretKey::generate()));
        // replica expects the content key, but is served by the view
        let replica = Feed::replica(feed.key(), false);

        let mut server = Replication::new(view);
        let mut client = Replication::new(replica.clone());
        let have = server.poll();
        let requests = client.on_message(have[0].clone()).unwrap();
        let data = server.on_message(requests[0].clone()).unwrap();
        assert!(matches!(
            client.on_message(data[0].clone()),
            Err(FeedError::InvalidSignature(0))
        ));
        assert_eq!(replica.downloaded(), 0);
    }
}
