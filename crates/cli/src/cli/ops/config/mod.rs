use clap::{Args, Subcommand};
use serde_json::Value;

pub mod get;
pub mod set;

use crate::cli::op::Op;

crate::command_enum! {
    (Get, get::Get),
    (Set, set::Set),
}

// Rename the generated Command to ConfigCommand for clarity
pub type ConfigCommand = Command;

/// Read and write market configuration values kept in the store
#[derive(Args, Debug, Clone)]
pub struct Config {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[async_trait::async_trait]
impl Op for Config {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

/// Command line values are JSON when they parse as JSON, plain strings otherwise
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
