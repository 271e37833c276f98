//! jty - render Jsonnet files to YAML

mod command;
mod config;
mod flags;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use command::Command;
use config::Config;
use flags::Cli;
use jty_core::{OsFs, SharedWriter};
use std::io::{self, BufReader};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "jty", &mut io::stdout());
        return Ok(());
    }
    if cli.manpage {
        let man = clap_mangen::Man::new(Cli::command());
        man.render(&mut io::stdout())?;
        return Ok(());
    }

    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from_path(Some(path.clone())),
        None => Config::load(),
    };
    let jsonnet_path = std::env::var_os("JSONNET_PATH");
    let flags = cli.into_flags(&config, jsonnet_path.as_deref());
    tracing::debug!(?flags, "resolved flags");

    let mut cmd = Command {
        stdin: Box::new(BufReader::new(io::stdin())),
        stdout: SharedWriter::stdout(),
        stderr: SharedWriter::stderr(),
        fs: Arc::new(OsFs::new()),
        evaluator: command::default_evaluator,
    };
    cmd.run(&flags)?;
    Ok(())
}

/// Log to stderr. `RUST_LOG` takes precedence over `-v`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}
