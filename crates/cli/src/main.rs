// CLI modules
mod cli;
mod state;

use clap::{Parser, Subcommand};
use cli::{
    args::Args, op::Op, Buy, Buying, Config, Init, Keygen, Sell, Selling, Version,
};

command_enum! {
    (Buy, Buy),
    (Buying, Buying),
    (Config, Config),
    (Init, Init),
    (Keygen, Keygen),
    (Sell, Sell),
    (Selling, Selling),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let ctx = cli::op::OpContext::new(args.config_path);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
