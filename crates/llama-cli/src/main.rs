use std::io;

use clap::Parser;
use llama_cli::{run, Cli};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let stdin = io::stdin();
    if let Err(e) = run(cli, stdin.lock(), io::stdout()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
