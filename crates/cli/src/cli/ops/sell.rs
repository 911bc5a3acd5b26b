use std::path::PathBuf;

use clap::Args;

use common::feed::{Feed, FeedError};
use common::market::{MarketError, SellerOptions};
use service::{init_logging, run_seller, ProcessError};

use crate::cli::op::OpenError;

/// Sell the lines of a file as a feed until interrupted
#[derive(Args, Debug, Clone)]
pub struct Sell {
    /// Name of the feed, its identity is derived from it
    pub name: String,

    /// File whose lines become the feed entries
    pub file: PathBuf,

    /// Share one feed with every buyer and skip validation
    #[arg(long)]
    pub free: bool,

    /// Close a session after this many consecutive failed checks
    #[arg(long)]
    pub close_after_invalid: Option<u32>,

    /// Override the peer port from the config
    #[arg(long)]
    pub peer_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum SellError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Derivation context of a named content feed
pub fn content_context(name: &str) -> String {
    format!("content/{}", name)
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Sell {
    type Error = SellError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let contents = tokio::fs::read_to_string(&self.file)
            .await
            .map_err(|e| SellError::Read(self.file.clone(), e))?;

        let (mut config, state) = ctx.open().await?;
        if self.peer_port.is_some() {
            config.peer_port = self.peer_port;
        }
        let _guards = init_logging(&config, &common::build_info!());

        let market = state.market();
        let feed = Feed::new(market.derive(&content_context(&self.name))?);
        for line in contents.lines() {
            feed.append(line.to_string())?;
        }

        let seller = market.sell(
            feed,
            SellerOptions {
                unique_feed: !self.free,
                close_after_invalid: self.close_after_invalid,
                ..Default::default()
            },
        );
        seller.ready().await?;
        let key = seller.key().map(|k| k.to_hex()).unwrap_or_default();
        println!("Selling {} as {}", self.name, key);

        run_seller(&config, seller).await?;
        state.close().await.map_err(OpenError::Service)?;
        Ok(format!("Stopped selling {}", self.name))
    }
}
