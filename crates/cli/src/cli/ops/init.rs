use clap::Args;

use service::{ServiceState, StateSetupError};

use crate::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Peer endpoint listen port (optional, defaults to ephemeral port if not specified)
    #[arg(long)]
    pub peer_port: Option<u16>,

    /// Milliseconds between two validate calls on one session
    #[arg(long, default_value_t = 1000)]
    pub revalidate_interval_ms: u64,

    /// Default log level
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write logs under <state dir>/logs
    #[arg(long)]
    pub log_to_file: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
    #[error("init failed: {0}")]
    ServiceFailed(#[from] StateSetupError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = AppConfig {
            log_level: self.log_level.clone(),
            peer_port: self.peer_port,
            revalidate_interval_ms: self.revalidate_interval_ms,
            log_to_file: self.log_to_file,
        };

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;

        // opening the service creates the database and the master key
        let service = ServiceState::from_config(&state.service_config()?).await?;
        let buyer = service
            .market()
            .buyer()
            .map(|key| key.to_hex())
            .unwrap_or_default();
        service.close().await?;

        let peer_port_str = match state.config.peer_port {
            Some(port) => format!("{}", port),
            None => "ephemeral (auto-assigned)".to_string(),
        };

        let output = format!(
            "Initialized dazaar directory at: {}\n\
             - Database: {}\n\
             - Config: {}\n\
             - Peer port: {}\n\
             - Buyer key: {}",
            state.dazaar_dir.display(),
            state.db_path.display(),
            state.config_path.display(),
            peer_port_str,
            buyer
        );

        Ok(output)
    }
}
