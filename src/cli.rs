use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kubesync",
    version,
    about = "Edit a Kubernetes manifest locally while staying in sync with the live cluster object."
)]
pub struct CliArgs {
    /// Manifest file describing exactly one resource
    pub manifest: PathBuf,

    /// kubeconfig context to connect through (defaults to the current context)
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace for manifests that do not name one
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// How often the manifest file is checked for edits, in milliseconds
    #[arg(long, default_value_t = 1_000)]
    pub refresh_ms: u64,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Write logs to this file instead of discarding them
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Runtime config file (overrides discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
