use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "A container engine checkpoint/restore core")]
pub struct Opts {
    #[command(flatten)]
    pub global: GlobalOpts,
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Directory holding the daemon's container records
    #[arg(long, default_value = "/var/lib/capstan/containers")]
    pub root: PathBuf,
    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,
    /// Set the log level; overrides --debug
    #[arg(long)]
    pub log_level: Option<String>,
    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log: Option<PathBuf>,
    /// Log output format (text or json)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    Checkpoint(Checkpoint),
    Restore(Restore),
}

/// Checkpoint one or more running containers
#[derive(Parser, Debug)]
pub struct Checkpoint {
    /// Directory for storing checkpoint image files
    #[arg(long = "image-dir")]
    pub image_dir: PathBuf,
    /// Directory for storing the dump log and work files
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,
    /// Leave the container running after checkpointing
    #[arg(long)]
    pub leave_running: bool,
    /// Allow checkpointing established tcp connections
    #[arg(long = "allow-tcp")]
    pub allow_tcp: bool,
    /// Allow checkpointing external unix connections
    #[arg(long = "allow-ext-unix")]
    pub allow_ext_unix: bool,
    /// Allow checkpointing shell jobs
    #[arg(long = "allow-shell")]
    pub allow_shell: bool,

    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub containers: Vec<String>,
}

/// Restore one or more checkpointed containers
#[derive(Parser, Debug)]
pub struct Restore {
    /// Directory to restore image files from
    #[arg(long = "image-dir")]
    pub image_dir: PathBuf,
    /// Directory for storing the restore log
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,
    /// Bypass checks for current container state
    #[arg(long)]
    pub force: bool,

    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub containers: Vec<String>,
}
