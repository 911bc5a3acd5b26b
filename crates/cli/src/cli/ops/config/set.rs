use clap::Args;

use common::market::MarketError;

use crate::cli::op::OpenError;

#[derive(Args, Debug, Clone)]
pub struct Set {
    pub key: String,
    /// JSON value, or a plain string
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SetError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("failed to write config: {0}")]
    Market(#[from] MarketError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Set {
    type Error = SetError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (_, state) = ctx.open().await?;
        let value = super::parse_value(&self.value);
        let written = state.market().set_config(&self.key, &value).await?;

        Ok(if written {
            format!("{} = {}", self.key, value)
        } else {
            format!("{} unchanged", self.key)
        })
    }
}
