pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dazaar")]
#[command(about = "Buy and sell access to append-only feeds", version)]
pub struct Args {
    /// Path to the dazaar state directory (defaults to $DAZAAR_PATH, then ~/.dazaar)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
