use std::path::PathBuf;
use std::time::Duration;

use common::market::DEFAULT_REVALIDATE_INTERVAL;

#[derive(Debug, Clone)]
pub struct Config {
    // peer configuration
    /// port for our endpoint to listen on,
    ///  if not set then an ephemeral port will be used
    pub peer_port: Option<u16>,

    // data store configuration
    /// a path to a sqlite database, if not set then an
    ///  in-memory database will be used
    pub sqlite_path: Option<PathBuf>,

    // market configuration
    /// time between two validate calls on one session
    pub revalidate_interval: Duration,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_port: None,
            sqlite_path: None,
            revalidate_interval: DEFAULT_REVALIDATE_INTERVAL,
            log_level: tracing::Level::INFO,
            log_dir: None,
        }
    }
}
