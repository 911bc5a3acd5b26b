use clap::Args;

use common::market::MarketError;

use crate::cli::op::OpenError;

/// List the sellers this market has bought from
#[derive(Args, Debug, Clone)]
pub struct Buying;

#[derive(Debug, thiserror::Error)]
pub enum BuyingError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("failed to list purchases: {0}")]
    Market(#[from] MarketError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Buying {
    type Error = BuyingError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (_, state) = ctx.open().await?;
        let records = state.market().list_buying().await?;

        if records.is_empty() {
            return Ok("Not buying anything".to_string());
        }
        let lines: Vec<String> = records
            .iter()
            .map(|r| format!("seller {} feed {}", r.seller, r.unique_feed))
            .collect();
        Ok(lines.join("\n"))
    }
}
