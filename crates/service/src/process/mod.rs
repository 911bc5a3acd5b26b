pub mod utils;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::feed::FeedError;
use common::market::{Buyer, BuyerEvent, MarketError, Seller};
use common::protocol::SessionError;
use common::store::Store;
use common::version::BuildInfo;

use crate::config::Config;
use crate::node::{BuyerNode, NodeError, SellerNode};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("failed to shut down within {0} seconds")]
    ShutdownTimeout(u64),
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
pub fn init_logging(
    config: &Config,
    build: &BuildInfo,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stderr layer, stdout is left to command output
    let (stderr_writer, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    guards.push(stderr_guard);

    let stderr_env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stderr_writer)
        .with_filter(stderr_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "dazaar.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        let _ = tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
    }

    utils::register_panic_logger();
    utils::report_build_info(build);

    guards
}

/// Serve `seller` until SIGINT or SIGTERM, then destroy it
pub async fn run_seller<S: Store>(config: &Config, seller: Seller<S>) -> Result<(), ProcessError> {
    let (graceful_waiter, _shutdown_tx, _shutdown_rx) = utils::graceful_shutdown_blocker()?;
    let node = SellerNode::spawn(seller.clone(), config.peer_port).await?;
    tracing::info!(
        seller = %node.key(),
        feed = %seller.feed().key(),
        entries = seller.feed().len(),
        "selling"
    );

    let _ = graceful_waiter.await;
    tracing::info!("shutting down seller");

    seller.destroy().await?;
    match timeout(FINAL_SHUTDOWN_TIMEOUT, node.shutdown()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProcessError::ShutdownTimeout(
            FINAL_SHUTDOWN_TIMEOUT.as_secs(),
        )),
    }
}

/// Subscribe through `buyer` and hand every entry to `on_entry` in order
///
/// Runs until `limit` entries were read, the session ends or a shutdown
/// signal arrives. Returns how many entries were read.
pub async fn run_buyer<S, F>(
    config: &Config,
    buyer: Buyer<S>,
    limit: Option<u64>,
    mut on_entry: F,
) -> Result<u64, ProcessError>
where
    S: Store,
    F: FnMut(u64, Bytes) + Send,
{
    let (_graceful_waiter, _shutdown_tx, mut shutdown_rx) = utils::graceful_shutdown_blocker()?;
    let events = buyer.events().subscribe();
    let node = BuyerNode::bind(buyer.clone(), config.peer_port).await?;
    let handle = node.connect().await?;
    let peer = handle.peer().clone();
    let session = handle.join();
    tokio::pin!(session);

    let mut read = 0;
    let outcome = loop {
        if limit.is_some_and(|limit| read >= limit) {
            break Ok(());
        }
        let feed = buyer.feed();
        tokio::select! {
            _ = shutdown_rx.changed() => break Ok(()),
            result = &mut session => break match result {
                Ok(()) => Ok(()),
                Err(SessionError::RemoteClosed(reason)) => {
                    tracing::info!(%reason, "seller closed the session");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            event = events.recv_async() => match event {
                Ok(BuyerEvent::Invalid { error, .. }) => tracing::warn!("seller refused: {}", error),
                Ok(BuyerEvent::Valid { info, .. }) => tracing::info!(%info, "subscription valid"),
                Ok(_) => {}
                Err(_) => break Ok(()),
            },
            entry = async {
                match feed {
                    Some(feed) => feed.read(read).await,
                    None => std::future::pending().await,
                }
            } => match entry {
                Ok(data) => {
                    on_entry(read, data);
                    read += 1;
                }
                Err(e) => break Err(e.into()),
            },
        }
    };

    peer.close("Buyer is done");
    buyer.destroy().await?;
    node.close().await;
    outcome.map(|()| read)
}
