use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use super::messages::{parse_json, Message};
use crate::crypto::PublicKey;
use crate::feed::{Feed, Replication};
use crate::market::Messaging;
use crate::transport::{Transport, TransportError};

/// Outcome of one validate invocation: optional info object or an error text
pub type Validation = Result<Option<Value>, String>;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Frames other tasks may queue on one session before `Peer::send` refuses more
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("expected remote {expected} but {actual} authenticated")]
    AuthenticationMismatch {
        expected: PublicKey,
        actual: PublicKey,
    },
    #[error("subscription invalid: {0}")]
    SubscriptionInvalid(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("session closed: {0}")]
    Closed(String),
    #[error("remote closed session: {0}")]
    RemoteClosed(String),
    #[error("session task failed: {0}")]
    Task(String),
}

/// Handle onto a live session, shared with the messaging layer
#[derive(Clone)]
pub struct Peer {
    id: u64,
    remote: PublicKey,
    outbound: flume::Sender<Message>,
    close: flume::Sender<String>,
}

struct PeerQueues {
    outbound: flume::Receiver<Message>,
    close: flume::Receiver<String>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Peer {
    fn new(remote: PublicKey) -> (Self, PeerQueues) {
        let (outbound_tx, outbound) = flume::bounded(OUTBOUND_CAPACITY);
        let (close_tx, close) = flume::bounded(1);
        let peer = Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            outbound: outbound_tx,
            close: close_tx,
        };
        (peer, PeerQueues { outbound, close })
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote
    }

    /// Queue a frame without waiting
    ///
    /// Returns false once the session has ended, or while `OUTBOUND_CAPACITY`
    /// frames are still waiting on a slow transport.
    pub fn send(&self, msg: Message) -> bool {
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                tracing::warn!(peer = self.id, "outbound queue full, dropping frame");
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Ask the session to close, telling the remote why. The first reason wins.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.close.try_send(reason.into());
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_disconnected()
    }
}

/// Per-session state the driver owns and hands to role hooks
pub struct SessionCtx {
    peer: Peer,
    // written by the driver straight after the current hook returns
    pending: Vec<Message>,
    replication: Option<Replication>,
    validation: Option<BoxFuture<'static, Validation>>,
    wake: Option<BoxFuture<'static, ()>>,
    next_check: Option<Instant>,
}

impl SessionCtx {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            pending: Vec::new(),
            replication: None,
            validation: None,
            wake: None,
            next_check: None,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Send a frame ahead of anything else this session does next
    pub fn send(&mut self, msg: Message) {
        self.pending.push(msg);
    }

    /// Start live replication of `feed` on this session
    ///
    /// Only one feed is replicated per session; later calls are ignored.
    pub fn replicate(&mut self, feed: Feed) {
        if self.replication.is_some() {
            return;
        }
        let mut replication = Replication::new(feed);
        let frames = replication.poll();
        self.pending.extend(frames.into_iter().map(Message::Feed));
        self.replication = Some(replication);
    }

    pub fn replicated_feed(&self) -> Option<&Feed> {
        self.replication.as_ref().map(|r| r.feed())
    }

    /// Run a validate call; the result is delivered to `SessionRole::validated`
    pub fn validate(&mut self, fut: BoxFuture<'static, Validation>) {
        self.validation = Some(fut);
    }

    pub fn is_validating(&self) -> bool {
        self.validation.is_some()
    }

    /// Call `SessionRole::woken` once `fut` resolves
    pub fn wake_on(&mut self, fut: BoxFuture<'static, ()>) {
        self.wake = Some(fut);
    }

    /// Call `SessionRole::revalidate` after `interval`
    pub fn schedule(&mut self, interval: Duration) {
        self.next_check = Some(Instant::now() + interval);
    }

    pub fn cancel_timer(&mut self) {
        self.next_check = None;
    }
}

/// Role-specific behavior plugged into the session driver
#[async_trait]
pub trait SessionRole: Send + 'static {
    fn name(&self) -> &'static str;

    fn messaging(&self) -> &Messaging;

    /// Close reason once the owner is destroyed, `None` while it is live
    fn shutdown_reason(&self) -> Option<&'static str>;

    /// Wait until the owner can supply its identity
    async fn ready(&mut self) -> Result<(), SessionError>;

    /// Decide whether the authenticated remote may talk to us
    async fn authenticate(&mut self, remote: &PublicKey) -> Result<(), SessionError>;

    /// The session joined the sendable set
    async fn opened(&mut self, ctx: &mut SessionCtx);

    async fn handshake(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError>;

    /// A protocol frame other than user messages, replication and close
    async fn message(&mut self, ctx: &mut SessionCtx, msg: Message) -> Result<(), SessionError>;

    async fn validated(
        &mut self,
        ctx: &mut SessionCtx,
        result: Validation,
    ) -> Result<(), SessionError>;

    async fn revalidate(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError>;

    async fn woken(&mut self, _ctx: &mut SessionCtx) -> Result<(), SessionError> {
        Ok(())
    }

    /// The session ended. Called exactly once for sessions that got past authentication.
    async fn closed(&mut self, ctx: &mut SessionCtx, result: &Result<(), SessionError>);
}

/// Join handle for a running session
#[derive(Debug)]
pub struct SessionHandle {
    peer: Peer,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SessionHandle {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn close(&self, reason: impl Into<String>) {
        self.peer.close(reason);
    }

    /// Wait for the session to end
    pub async fn join(self) -> Result<(), SessionError> {
        self.task
            .await
            .map_err(|e| SessionError::Task(e.to_string()))?
    }
}

/// Spawn the driver for one connection
pub fn spawn<R: SessionRole>(role: R, transport: Arc<dyn Transport>) -> SessionHandle {
    let (peer, queues) = Peer::new(transport.remote_public_key());
    let span = tracing::debug_span!(
        "session",
        role = role.name(),
        id = peer.id(),
        remote = %peer.remote_public_key()
    );
    let task = tokio::spawn(run(role, peer.clone(), queues, transport).instrument(span));
    SessionHandle { peer, task }
}

async fn run<R: SessionRole>(
    mut role: R,
    peer: Peer,
    queues: PeerQueues,
    transport: Arc<dyn Transport>,
) -> Result<(), SessionError> {
    if let Err(e) = role.ready().await {
        transport.close(Some(e.to_string())).await;
        return Err(e);
    }

    let remote = peer.remote_public_key();
    if let Err(e) = role.authenticate(&remote).await {
        tracing::warn!("authentication failed: {}", e);
        let reason = e.to_string();
        if let Ok(frame) = (Message::Close {
            reason: reason.clone(),
        })
        .encode()
        {
            let _ = transport.send(frame).await;
        }
        transport.close(Some(reason)).await;
        return Err(e);
    }
    tracing::debug!("session authenticated");

    let (inbound_tx, inbound) = flume::unbounded();
    let reader = tokio::spawn(read_loop(transport.clone(), inbound_tx));

    let mut ctx = SessionCtx::new(peer);
    role.messaging().add(ctx.peer.clone());
    role.opened(&mut ctx).await;

    // the owner may have been destroyed while this session was authenticating,
    // after its teardown already walked the peer set
    let result = if let Some(reason) = role.shutdown_reason() {
        let _ = send_frame(
            transport.as_ref(),
            &Message::Close {
                reason: reason.to_string(),
            },
        )
        .await;
        Err(SessionError::Closed(reason.to_string()))
    } else {
        match role.handshake(&mut ctx).await {
            Ok(()) => drive(&mut role, &mut ctx, &inbound, &queues, transport.as_ref()).await,
            Err(e) => Err(e),
        }
    };
    reader.abort();

    match &result {
        Ok(()) => tracing::debug!("session ended"),
        Err(SessionError::Closed(reason)) | Err(SessionError::RemoteClosed(reason)) => {
            tracing::debug!(%reason, "session closed")
        }
        Err(e) => tracing::warn!("session failed: {}", e),
    }

    role.messaging().remove(&ctx.peer);
    role.closed(&mut ctx, &result).await;
    transport
        .close(result.as_ref().err().map(|e| e.to_string()))
        .await;
    result
}

async fn drive<R: SessionRole>(
    role: &mut R,
    ctx: &mut SessionCtx,
    inbound: &flume::Receiver<Result<Message, TransportError>>,
    queues: &PeerQueues,
    transport: &dyn Transport,
) -> Result<(), SessionError> {
    loop {
        // frames produced by the session itself wait on the transport, so a
        // slow remote holds replication back instead of growing a buffer
        for msg in std::mem::take(&mut ctx.pending) {
            send_frame(transport, &msg).await?;
        }

        tokio::select! {
            biased;

            reason = queues.close.recv_async() => {
                let reason = reason.unwrap_or_else(|_| "session dropped".to_string());
                let _ = send_frame(transport, &Message::Close { reason: reason.clone() }).await;
                return Err(SessionError::Closed(reason));
            }

            msg = queues.outbound.recv_async() => match msg {
                Ok(msg) => send_frame(transport, &msg).await?,
                Err(_) => return Err(SessionError::Closed("session dropped".to_string())),
            },

            msg = inbound.recv_async() => match msg {
                Ok(Ok(msg)) => handle_inbound(role, ctx, msg).await?,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            },

            result = next_validation(&mut ctx.validation) => {
                ctx.validation = None;
                role.validated(ctx, result).await?;
            }

            _ = next_wake(&mut ctx.wake) => {
                ctx.wake = None;
                role.woken(ctx).await?;
            }

            _ = next_check(ctx.next_check) => {
                ctx.next_check = None;
                role.revalidate(ctx).await?;
            }

            _ = replication_changed(&mut ctx.replication) => {
                if let Some(replication) = ctx.replication.as_mut() {
                    let frames = replication.poll();
                    ctx.pending.extend(frames.into_iter().map(Message::Feed));
                }
            }
        }
    }
}

async fn handle_inbound<R: SessionRole>(
    role: &mut R,
    ctx: &mut SessionCtx,
    msg: Message,
) -> Result<(), SessionError> {
    match msg {
        Message::UserMessage { name, message } => {
            match parse_json(&message) {
                Ok(value) => role.messaging().dispatch(&name, value, &ctx.peer),
                Err(e) => tracing::warn!(%name, "dropping malformed user message: {}", e),
            }
            Ok(())
        }
        Message::Feed(msg) => {
            let Some(replication) = ctx.replication.as_mut() else {
                tracing::debug!("replication frame before any feed, ignoring");
                return Ok(());
            };
            match replication.on_message(msg) {
                Ok(replies) => {
                    ctx.pending.extend(replies.into_iter().map(Message::Feed));
                }
                Err(e) => tracing::warn!("rejected replication frame: {}", e),
            }
            Ok(())
        }
        Message::Close { reason } => Err(SessionError::RemoteClosed(reason)),
        other => role.message(ctx, other).await,
    }
}

async fn send_frame(transport: &dyn Transport, msg: &Message) -> Result<(), SessionError> {
    transport.send(msg.encode()?).await?;
    Ok(())
}

async fn read_loop(
    transport: Arc<dyn Transport>,
    tx: flume::Sender<Result<Message, TransportError>>,
) {
    loop {
        match transport.recv().await {
            Ok(Some(frame)) => {
                let msg = Message::decode(&frame);
                let stop = msg.is_err();
                if tx.send_async(msg).await.is_err() || stop {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send_async(Err(e)).await;
                break;
            }
        }
    }
}

async fn next_validation(validation: &mut Option<BoxFuture<'static, Validation>>) -> Validation {
    match validation {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_wake(wake: &mut Option<BoxFuture<'static, ()>>) {
    match wake {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_check(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn replication_changed(replication: &mut Option<Replication>) {
    match replication {
        Some(replication) => replication.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_full_queue_refuses_frames_but_not_close() {
        let remote = SecretKey::generate().public();
        let (peer, queues) = Peer::new(remote);

        for n in 0..OUTBOUND_CAPACITY {
            assert!(peer.send(Message::user("tick", &serde_json::json!(n))));
        }
        assert!(!peer.send(Message::user("tick", &serde_json::json!("late"))));
        assert_eq!(queues.outbound.len(), OUTBOUND_CAPACITY);

        peer.close("first");
        peer.close("second");
        assert_eq!(queues.close.try_recv().unwrap(), "first");
        assert!(queues.close.try_recv().is_err());

        // draining makes room again
        queues.outbound.try_recv().unwrap();
        assert!(peer.send(Message::user("tick", &serde_json::json!("again"))));

        drop(queues);
        assert!(peer.is_closed());
        assert!(!peer.send(Message::user("tick", &serde_json::json!("gone"))));
    }
}
