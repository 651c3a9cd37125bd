//! Gantry CLI entry point.
//!
//! Exit codes:
//! - 0: success
//! - 1: internal or I/O error
//! - 2: configuration error
//! - 3: environment could not be resolved
//! - 4: one or more modules failed
//! - 5: run cancelled

use clap::Parser;
use gantry::cli::{self, Cli};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose, cli.log_json);

    match cli::dispatch(cli).await {
        Ok(category) => ExitCode::from(category.code()),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.category().code())
        }
    }
}
