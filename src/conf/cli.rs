// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hymo", version, about = "Hymo systemless module coordinator")]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    #[arg(short = 'm', long = "moduledir")]
    pub moduledir: Option<PathBuf>,
    #[arg(short = 't', long = "tempdir")]
    pub tempdir: Option<PathBuf>,
    #[arg(short = 's', long = "mountsource")]
    pub mountsource: Option<String>,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(short = 'p', long = "partition", action = clap::ArgAction::Append)]
    pub partitions: Vec<String>,
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full mount pipeline (the default when no command is given).
    Mount,
    /// Write a default config file.
    GenConfig,
    /// Print the effective configuration as JSON.
    ShowConfig,
    /// Print storage backend status as JSON.
    Storage,
    /// List active modules as JSON.
    Modules,
    /// Regenerate and re-apply the HymoFS rule batch without re-syncing storage.
    Reload,
    /// Add HymoFS rules for a single module.
    Add { module_id: String },
    /// Delete HymoFS rules for a single module.
    Delete { module_id: String },
}
