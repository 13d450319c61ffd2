/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{
    cli::{avb, completion, region},
    config::Config,
};

#[derive(Debug, Subcommand)]
pub enum Command {
    Avb(avb::AvbCli),
    Region(region::RegionCli),
    Completion(completion::CompletionCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the tabox configuration file.
    ///
    /// Without this option, the built-in defaults are used: a native
    /// `avbtool` in PATH and the stock test key table with keys resolved
    /// against the current directory.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t = Level::WARN)]
    pub log_level: Level,
}

pub fn init_logging(cli: &Cli) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(cli.log_level)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);
    logging_initialized.store(true, Ordering::SeqCst);

    let config = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("Failed to load config: {path:?}"))?
        }
        None => Config::default(),
    };

    match cli.command {
        Command::Avb(c) => avb::avb_main(&c, &config, cancel_signal),
        Command::Region(c) => region::region_main(&c, &config, cancel_signal),
        Command::Completion(c) => completion::completion_main(&c),
    }
}
