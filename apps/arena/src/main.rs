mod app;

use arena_lab::cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() {
    if let Err(err) = app::run(Cli::parse()).await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}
