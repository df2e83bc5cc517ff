//! droverd - on-host deployment agent.
//!
//! A narrow SSH server the controller pushes configuration through. See
//! [`server`] for the protocol surface.

use clap::Parser;
use drover_platform::DroverError;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod server;
mod sftp;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "droverd")]
#[command(version, about = "Drover deployment agent SSH server")]
struct Cli {
    /// Path to the agent configuration
    #[arg(short = 'c', long, default_value = "droverd.yaml")]
    config: PathBuf,

    /// Start the agent SSH server
    #[arg(short = 's', long)]
    start_server: bool,

    /// Test configuration syntax validity and exit
    #[arg(short = 't', long)]
    test_config: bool,

    /// Run through all startup checks without binding the socket
    #[arg(short = 'T', long)]
    dry_run: bool,
}

fn fatal(description: &str, error: &DroverError) -> ! {
    eprintln!("{}: {}", description, error);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => fatal("Error reading config file", &err),
    };

    if cli.test_config {
        println!(
            "droverd: configuration file {} test is successful",
            cli.config.display()
        );
        return;
    }

    if cli.dry_run {
        if let Err(err) = server::startup_check(&config) {
            fatal("Error during server startup test", &err);
        }
        println!("droverd: server startup test is successful");
        return;
    }

    if cli.start_server {
        if let Err(err) = server::run(config).await {
            fatal("Server error", &err);
        }
        return;
    }

    println!("No arguments specified! Use '-h' or '--help' to guide your way.");
}
