// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::{
    conf::{
        cli::Cli,
        config::Config,
    },
    core::{inventory, manager, planner, state::RuntimeState, storage},
    defs,
    mount::hymofs::HymoFs,
    utils,
};

pub fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(config_path) = &cli.config {
        return Config::from_file(config_path).with_context(|| {
            format!(
                "Failed to load config from custom path: {}",
                config_path.display()
            )
        });
    }

    match Config::load_default() {
        Ok(config) => Ok(config),
        Err(e) => {
            let is_not_found = e
                .root_cause()
                .downcast_ref::<std::io::Error>()
                .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                .unwrap_or(false);

            if is_not_found {
                Ok(Config::default())
            } else {
                Err(e).context(format!(
                    "Failed to load default config from {}",
                    defs::CONFIG_FILE
                ))
            }
        }
    }
}

pub fn handle_gen_config(output: Option<&Path>) -> Result<()> {
    let output = output.unwrap_or_else(|| Path::new(defs::CONFIG_FILE));

    Config::default()
        .save_to_file(output)
        .with_context(|| format!("Failed to save generated config to {}", output.display()))?;

    println!("Generated config: {}", output.display());
    Ok(())
}

pub fn handle_show_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    let json =
        serde_json::to_string_pretty(&config).context("Failed to serialize config to JSON")?;

    println!("{}", json);

    Ok(())
}

pub fn handle_storage() -> Result<()> {
    storage::print_status()
}

pub fn handle_modules(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    inventory::print_module_list(&config).context("Failed to list modules")
}

/// Rebuild and re-apply the HymoFS rule batch against the last run's mirror
/// without touching storage or re-syncing module content.
pub fn handle_reload(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let mut state = RuntimeState::load().unwrap_or_default();

    let (hymofs_active, hymofs_mismatch, mismatch_message) =
        manager::resolve_hymofs_policy(&config);
    if !hymofs_active {
        bail!("HymoFS is not usable; reload only applies to redirector mode");
    }

    let storage_root = reload_storage_root(&config, &state);
    log::info!("Reloading plan against {}", storage_root.display());

    let modules = inventory::scan(&config.moduledir, &config)?;
    let plan = planner::generate(&config, &modules, &storage_root, true)?;

    HymoFs::apply_batch(&plan.rules).context("Failed to apply HymoFS rule batch")?;

    state.hymofs_module_ids = plan.hymofs_module_ids.clone();
    state.hymofs_mismatch = hymofs_mismatch;
    state.mismatch_message = mismatch_message;
    if state.storage_mode.is_empty() {
        state.storage_mode = storage::StorageMode::HymofsDirect.as_str().to_string();
        state.mount_point = storage_root;
    }
    if let Err(e) = state.save() {
        log::error!("Failed to save runtime state: {:#}", e);
    }

    println!("Reloaded {} HymoFS modules.", plan.hymofs_module_ids.len());
    Ok(())
}

pub fn handle_add(cli: &Cli, module_id: &str) -> Result<()> {
    utils::validate_module_id(module_id)?;

    let config = load_config(cli)?;
    let state = RuntimeState::load().unwrap_or_default();
    let module_dir = module_content_dir(&config, &state, module_id)?;

    for partition in config.all_partitions() {
        let part_dir = module_dir.join(&partition);
        if part_dir.is_dir() {
            HymoFs::add_rules_from_directory(&Path::new("/").join(&partition), &part_dir)?;
        }
    }

    println!("Added HymoFS rules for {}", module_id);
    Ok(())
}

pub fn handle_delete(cli: &Cli, module_id: &str) -> Result<()> {
    utils::validate_module_id(module_id)?;

    let config = load_config(cli)?;
    let state = RuntimeState::load().unwrap_or_default();
    let module_dir = module_content_dir(&config, &state, module_id)?;

    for partition in config.all_partitions() {
        let part_dir = module_dir.join(&partition);
        if part_dir.is_dir() {
            HymoFs::remove_rules_from_directory(&Path::new("/").join(&partition), &part_dir)?;
        }
    }

    println!("Deleted HymoFS rules for {}", module_id);
    Ok(())
}

/// Prefer the synced mirror copy of a module; fall back to its source tree.
fn module_content_dir(config: &Config, state: &RuntimeState, module_id: &str) -> Result<PathBuf> {
    let mirror = state.mount_point.join(module_id);
    if mirror.is_dir() {
        return Ok(mirror);
    }

    let source = config.moduledir.join(module_id);
    if source.is_dir() {
        return Ok(source);
    }

    bail!("Module '{}' not found in mirror or module directory", module_id)
}

fn reload_storage_root(config: &Config, state: &RuntimeState) -> PathBuf {
    if !state.mount_point.as_os_str().is_empty() && state.mount_point.is_dir() {
        return state.mount_point.clone();
    }

    let fallback = PathBuf::from(defs::FALLBACK_CONTENT_DIR);
    if fallback.is_dir() {
        return fallback;
    }

    config.moduledir.clone()
}
