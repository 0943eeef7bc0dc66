//! Margin-funding agent entry point.
//!
//! Run with no arguments to start the agent; `genpassword <file>`
//! interactively writes the hashed unlock password.

use anyhow::Result;
use bfx_bot::{auth, logging, Application, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Automatic borrow refinancer for the Bitfinex funding market")]
struct Args {
    /// Configuration file path.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a hashed unlock password to a file.
    Genpassword { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = Args::parse();
    if let Some(Command::Genpassword { file }) = args.command {
        auth::gen_password_file(&file)?;
        return Ok(());
    }

    info!(config = %args.config.display(), "starting funding agent");
    let config = Config::load(&args.config)?;
    let (api_key, api_secret) = auth::authenticate(&config)?;

    Application::new(config).run(api_key, api_secret).await?;
    Ok(())
}
