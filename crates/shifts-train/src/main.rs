//! shifts-train CLI
//!
//! Usage: shifts-train --cfg <path/to/config.yaml>

use clap::Parser;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shifts-train", version, about = "Train a speaker-embedding model")]
struct Args {
    /// Path to the training config
    #[arg(long)]
    cfg: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = shifts_train::train(args.cfg.as_deref()) {
        tracing::error!("Training error: {:#}", e);
        std::process::exit(1);
    }
}
