//! `drove` - disaster-recovery orchestration validation engine.
//!
//! See `DESIGN.md` for architecture.

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use drove::cli::{Cli, Command};
use drove::exit_codes::{self, exit};

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let result = match cli.command {
        Command::Schema(args) => {
            let schema = if args.recording {
                drove::replay::generate_schema()
            } else {
                drove::model::generate_schema()
            };
            println!("{}", schema);
            Ok(exit::SUCCESS)
        }
        Command::Catalog(args) => drove::engine::show_catalog(args),
        Command::CheckTrace(args) => drove::engine::check_trace(args),
        Command::Replay(args) => drove::engine::replay(args),
    };
    let exit_code = result.unwrap_or_else(|e| {
        eprintln!("error: {e:#}");
        exit_codes::for_anyhow(&e)
    });
    std::process::exit(exit_code);
}
