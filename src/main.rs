// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

mod conf;
mod core;
mod defs;
mod mount;
mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use conf::{
    cli::{Cli, Commands},
    cli_handlers,
};
use crate::core::{MountController, inventory};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn run_mount_pipeline(cli: &Cli) -> Result<()> {
    let mut config = cli_handlers::load_config(cli)?;

    config.merge_with_cli(
        cli.moduledir.clone(),
        cli.tempdir.clone(),
        cli.mountsource.clone(),
        cli.verbose,
        cli.partitions.clone(),
    );

    utils::init_logging(config.verbose).context("Failed to initialize logging")?;

    let camouflage_name = utils::random_kworker_name();
    if let Err(e) = utils::camouflage_process(&camouflage_name) {
        log::warn!("Failed to camouflage process: {:#}", e);
    }

    log::info!(">> Hymo daemon starting...");
    log::debug!("Process camouflaged as: {}", camouflage_name);

    if config.disable_umount {
        log::warn!("!! Namespace detach (try_umount) is DISABLED via config.");
    }

    utils::ensure_dir_exists(defs::RUN_DIR)
        .with_context(|| format!("Failed to create run directory: {}", defs::RUN_DIR))?;

    let mnt_base = config
        .tempdir
        .clone()
        .unwrap_or_else(|| PathBuf::from(defs::FALLBACK_CONTENT_DIR));
    let img_path = PathBuf::from(defs::MODULES_IMG_FILE);

    MountController::new(config)
        .init_storage(&mnt_base, &img_path)
        .context("Failed to initialize storage")?
        .scan_and_sync()
        .context("Failed to scan and sync modules")?
        .generate_plan()
        .context("Failed to generate mount plan")?
        .execute()
        .context("Failed to execute mount plan")?
        .finalize()
        .context("Failed to finalize mount sequence")?;

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Some(Commands::GenConfig) => {
            cli_handlers::handle_gen_config(cli.output.as_deref())
        }
        Some(Commands::ShowConfig) => cli_handlers::handle_show_config(&cli),
        Some(Commands::Storage) => cli_handlers::handle_storage(),
        Some(Commands::Modules) => cli_handlers::handle_modules(&cli),
        Some(Commands::Reload) => cli_handlers::handle_reload(&cli),
        Some(Commands::Add { module_id }) => cli_handlers::handle_add(&cli, module_id),
        Some(Commands::Delete { module_id }) => cli_handlers::handle_delete(&cli, module_id),
        Some(Commands::Mount) | None => {
            let result = run_mount_pipeline(&cli);
            if let Err(e) = &result {
                log::error!("Fatal error: {:#}", e);
                inventory::update_description(false, "error", false, 0, 0, 0, None);
            }
            result
        }
    };

    if let Err(e) = result {
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
