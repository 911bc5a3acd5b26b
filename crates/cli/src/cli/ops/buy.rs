use std::io::Write;

use clap::Args;

use common::crypto::{KeyError, PublicKey};
use common::market::BuyerOptions;
use service::{init_logging, run_buyer, ProcessError};

use crate::cli::op::OpenError;

/// Subscribe to a seller and print entries as they arrive
#[derive(Args, Debug, Clone)]
pub struct Buy {
    /// Seller key, hex encoded
    pub seller: String,

    /// Stop after this many entries
    #[arg(long)]
    pub limit: Option<u64>,

    /// Only fetch the entries that are printed
    #[arg(long)]
    pub sparse: bool,

    /// Override the peer port from the config
    #[arg(long)]
    pub peer_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuyError {
    #[error("invalid seller key: {0}")]
    InvalidSeller(#[from] KeyError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Buy {
    type Error = BuyError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let seller = PublicKey::from_hex(self.seller.trim())?;

        let (mut config, state) = ctx.open().await?;
        if self.peer_port.is_some() {
            config.peer_port = self.peer_port;
        }
        let _guards = init_logging(&config, &common::build_info!());

        let buyer = state.market().buy(
            seller,
            BuyerOptions {
                sparse: self.sparse,
                ..Default::default()
            },
        );

        let read = run_buyer(&config, buyer, self.limit, |index, data| {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}: {}", index, String::from_utf8_lossy(&data));
        })
        .await?;

        state.close().await.map_err(OpenError::Service)?;
        Ok(format!("Read {} entries from {}", read, seller))
    }
}
