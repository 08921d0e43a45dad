use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "stratus",
    version,
    about = "A lazy-loading terminal browser for Google Cloud compute resources."
)]
pub struct CliArgs {
    /// Config file to use instead of the discovered one
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Track an extra project for this run (repeatable)
    #[arg(short, long = "project")]
    pub projects: Vec<String>,

    /// gcloud binary to shell out to
    #[arg(long)]
    pub gcloud_binary: Option<String>,

    /// Cloud console base url
    #[arg(long)]
    pub console_base: Option<String>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
