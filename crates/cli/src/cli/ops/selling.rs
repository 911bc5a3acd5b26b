use clap::Args;

use common::market::MarketError;

use crate::cli::op::OpenError;

/// List the feeds this market sells
#[derive(Args, Debug, Clone)]
pub struct Selling;

#[derive(Debug, thiserror::Error)]
pub enum SellingError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("failed to list sales: {0}")]
    Market(#[from] MarketError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Selling {
    type Error = SellingError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (_, state) = ctx.open().await?;
        let records = state.market().list_selling().await?;

        if records.is_empty() {
            return Ok("Not selling anything".to_string());
        }
        let lines: Vec<String> = records
            .iter()
            .map(|r| format!("seller {} feed {}", r.seller, r.feed))
            .collect();
        Ok(lines.join("\n"))
    }
}
