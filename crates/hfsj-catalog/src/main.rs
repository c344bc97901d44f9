#![warn(missing_docs)]

//! `hfsj-cat` binary entry point.

use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;
use hfsj_catalog::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, store = %cli.store.display(), "hfsj-cat starting");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    cli.run(&mut out)?;
    out.flush()?;
    Ok(())
}
