use common::market::{Market, MarketConfig, MarketError};
use common::store::Store;

use super::config::Config;
use super::database::{Database, DatabaseSetupError};

/// Main service state: the database and the market living on it
#[derive(Clone, Debug)]
pub struct State {
    database: Database,
    market: Market<Database>,
}

impl State {
    pub async fn from_config(config: &Config) -> Result<Self, StateSetupError> {
        // 1. Setup database
        let database = match config.sqlite_path {
            Some(ref path) => {
                tracing::info!("Database path: {}", path.display());
                Database::connect(path).await?
            }
            // otherwise just set up an in-memory database
            None => {
                tracing::warn!("no database path configured, identities will not persist");
                Database::in_memory().await?
            }
        };

        // 2. Load or create the master key
        let market = Market::new(
            database.clone(),
            MarketConfig {
                master_key: None,
                revalidate_interval: config.revalidate_interval,
            },
        );
        market.ready().await?;
        if let Some(buyer) = market.buyer() {
            tracing::info!("Buyer identity: {}", buyer);
        }

        Ok(Self { database, market })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn market(&self) -> &Market<Database> {
        &self.market
    }

    pub async fn close(&self) -> Result<(), StateSetupError> {
        self.database
            .close()
            .await
            .map_err(|e| StateSetupError::Market(MarketError::Storage(e.to_string())))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("failed to setup the database: {0}")]
    DatabaseSetupError(#[from] DatabaseSetupError),
    #[error("failed to load the market: {0}")]
    Market(#[from] MarketError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            sqlite_path: Some(dir.path().join("db.sqlite")),
            ..Default::default()
        };

        let state = State::from_config(&config).await.unwrap();
        let buyer = state.market().buyer();
        assert!(buyer.is_some());
        state.close().await.unwrap();

        let state = State::from_config(&config).await.unwrap();
        assert_eq!(state.market().buyer(), buyer);
    }
}
