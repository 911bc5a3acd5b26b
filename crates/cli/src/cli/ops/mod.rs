pub mod buy;
pub mod buying;
pub mod config;
pub mod init;
pub mod keygen;
pub mod sell;
pub mod selling;
pub mod version;

pub use buy::Buy;
pub use buying::Buying;
pub use config::Config;
pub use init::Init;
pub use keygen::Keygen;
pub use sell::Sell;
pub use selling::Selling;
pub use version::Version;
