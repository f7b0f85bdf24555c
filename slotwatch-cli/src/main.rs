//! Command line runner that watches the appointment service for open slots.

mod cli;
mod commands;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use reqwest::Client;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level)?;

    let client = Client::builder().user_agent("slotwatch/0.1").build()?;

    match cli.command {
        Command::Search(args) => commands::search(client, args).await,
        Command::Code(args) => commands::code(client, args).await,
        Command::Verify(args) => commands::verify(client, args).await,
    }
}
