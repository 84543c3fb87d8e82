//! synclane CLI
//!
//! Command-line tools for synclane.
//!
//! # Commands
//!
//! - `simulate` - Run random client workloads against an in-process server
//!   and check that every client converges
//! - `decode` - Decode and pretty-print a wire message
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// synclane command-line tools.
#[derive(Parser)]
#[command(name = "synclane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate clients against an in-process server
    Simulate {
        /// Random seed
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Number of clients
        #[arg(short, long, default_value = "3")]
        clients: usize,

        /// Number of random operations across all clients
        #[arg(long, default_value = "200")]
        steps: usize,

        /// Engine page size
        #[arg(long, default_value = "25")]
        page_size: u32,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a JSON wire message
    Decode {
        /// File holding the message, or `-` for stdin
        path: PathBuf,

        /// Decode as a server message instead of a client message
        #[arg(long)]
        server: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            seed,
            clients,
            steps,
            page_size,
            format,
        } => {
            let config = commands::simulate::SimulationConfig {
                seed,
                clients,
                steps,
                page_size,
            };
            commands::simulate::run(&config, &format)?;
        }
        Commands::Decode { path, server } => {
            commands::decode::run(&path, server)?;
        }
        Commands::Version => {
            println!("synclane CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
