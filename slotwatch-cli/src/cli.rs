use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use slotwatch_core::config::DEFAULT_CONTACT_FILE;

#[derive(Parser, Debug)]
#[command(
    name = "slotwatch",
    about = "Watch the vaccination appointment service for open slots and get notified",
    version
)]
pub(crate) struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub(crate) log_level: String,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Poll for open slots until interrupted
    Search(SearchArgs),
    /// Request a new registration code
    Code(CodeArgs),
    /// Validate configured notification channels with a one-time code
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
pub(crate) struct FileArgs {
    /// Contact file
    #[arg(short = 'f', long = "file", default_value = DEFAULT_CONTACT_FILE)]
    pub(crate) path: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct SearchArgs {
    #[command(flatten)]
    pub(crate) file: FileArgs,
    /// Seconds between search cycles (at least 30)
    #[arg(short = 's', long = "retry-sec", default_value_t = 60)]
    pub(crate) retry_sec: u64,
    /// Search groups probed at the same time
    #[arg(long, default_value_t = 1)]
    pub(crate) concurrency: usize,
}

#[derive(Args, Debug)]
pub(crate) struct CodeArgs {
    #[command(flatten)]
    pub(crate) file: FileArgs,
    /// Birth date as DD.MM.YYYY
    #[arg(long)]
    pub(crate) birth_date: String,
}

#[derive(Args, Debug)]
pub(crate) struct VerifyArgs {
    #[command(flatten)]
    pub(crate) file: FileArgs,
}
