//! Command-line interface and argument parsing.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::scanner::Scanner;

#[derive(Parser)]
#[command(name = "treport")]
#[command(about = "Scans repository history through pipelines of external analyzers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every pipeline in the configuration
    Scan {
        /// Path to the pipeline configuration
        #[arg(short, long, default_value = "treport.yaml")]
        config: PathBuf,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("treport={log_level}"))
        .init();

    match cli.command {
        Commands::Scan { config } => {
            let config = Config::load(&config)?;
            Scanner::new(config).scan().await?;
        }
    }
    Ok(())
}
