use clap::Args;
use serde_json::Value;

use common::market::MarketError;

use crate::cli::op::OpenError;

#[derive(Args, Debug, Clone)]
pub struct Get {
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GetError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("failed to read config: {0}")]
    Market(#[from] MarketError),
    #[error("no config value for {0}")]
    Missing(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Get {
    type Error = GetError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (_, state) = ctx.open().await?;
        let value: Value = state
            .market()
            .get_config(&self.key)
            .await?
            .ok_or_else(|| GetError::Missing(self.key.clone()))?;

        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}
