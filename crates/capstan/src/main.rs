mod cli;
mod commands;
mod observability;

use anyhow::Result;
use clap::Parser;
use libcapstan::daemon::Daemon;

use crate::cli::{Opts, SubCommand};

fn main() -> Result<()> {
    let opts = Opts::parse();

    observability::init(&opts)?;

    let daemon = Daemon::new(&opts.global.root);

    match opts.subcmd {
        SubCommand::Checkpoint(args) => commands::checkpoint::checkpoint(args, &daemon),
        SubCommand::Restore(args) => commands::restore::restore(args, &daemon),
    }
}
