// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::BTreeSet, path::Path};

use anyhow::Result;

use crate::{
    conf::config::Config,
    core::{
        executor::{self, ExecutionResult},
        inventory::{self, Module},
        planner::{self, MountPlan},
        state::RuntimeState,
        storage::{self, StorageHandle},
        sync,
    },
    defs,
    mount::hymofs::{HymoFs, HymoFsStatus, HymoRule},
};

pub struct Init;

pub struct StorageReady {
    handle: StorageHandle,
}

pub struct ModulesReady {
    handle: StorageHandle,
    modules: Vec<Module>,
}

pub struct Planned {
    handle: StorageHandle,
    plan: MountPlan,
    hymofs_mismatch: bool,
    mismatch_message: String,
}

pub struct Executed {
    handle: StorageHandle,
    plan: MountPlan,
    result: ExecutionResult,
    hymofs_mismatch: bool,
    mismatch_message: String,
}

/// Typestate pipeline: Init -> StorageReady -> ModulesReady -> Planned ->
/// Executed. Each step consumes the previous one, so phases cannot run out
/// of order.
pub struct MountController<S> {
    config: Config,
    state: S,
}

impl MountController<Init> {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Init,
        }
    }

    pub fn init_storage(
        self,
        mnt_base: &Path,
        img_path: &Path,
    ) -> Result<MountController<StorageReady>> {
        let handle = storage::setup(mnt_base, img_path, self.config.force_ext4)?;

        log::info!(">> Storage backend: [{}]", handle.mode.as_str().to_uppercase());

        Ok(MountController {
            config: self.config,
            state: StorageReady { handle },
        })
    }
}

impl MountController<StorageReady> {
    pub fn scan_and_sync(self) -> Result<MountController<ModulesReady>> {
        let modules = inventory::scan(&self.config.moduledir, &self.config)?;

        log::info!(">> Inventory scan: found {} enabled modules.", modules.len());

        sync::perform_sync(&modules, &self.state.handle.mount_point, &self.config)?;

        storage::finalize_permissions(&self.state.handle)?;

        Ok(MountController {
            config: self.config,
            state: ModulesReady {
                handle: self.state.handle,
                modules,
            },
        })
    }
}

impl MountController<ModulesReady> {
    pub fn generate_plan(self) -> Result<MountController<Planned>> {
        let (hymofs_active, hymofs_mismatch, mismatch_message) =
            resolve_hymofs_policy(&self.config);

        let plan = planner::generate(
            &self.config,
            &self.state.modules,
            &self.state.handle.mount_point,
            hymofs_active,
        )?;

        log::info!(
            "Plan: {} overlay ops, {} magic modules, {} HymoFS modules",
            plan.overlay_ops.len(),
            plan.magic_module_paths.len(),
            plan.hymofs_module_ids.len()
        );

        Ok(MountController {
            config: self.config,
            state: Planned {
                handle: self.state.handle,
                plan,
                hymofs_mismatch,
                mismatch_message,
            },
        })
    }
}

impl MountController<Planned> {
    pub fn execute(self) -> Result<MountController<Executed>> {
        log::info!(">> Executing mount plan...");

        let result = executor::execute(&self.state.plan, &self.config)?;

        Ok(MountController {
            config: self.config,
            state: Executed {
                handle: self.state.handle,
                plan: self.state.plan,
                result,
                hymofs_mismatch: self.state.hymofs_mismatch,
                mismatch_message: self.state.mismatch_message,
            },
        })
    }
}

impl MountController<Executed> {
    pub fn finalize(self) -> Result<()> {
        let state = self.state;

        let nuke_active = if self.config.enable_nuke
            && state.handle.mode == storage::StorageMode::Ext4
        {
            log::info!("Deploying ext4 sysfs trace scrub...");
            try_nuke(&state.handle.mount_point)
        } else {
            false
        };

        inventory::update_description(
            true,
            state.handle.mode.as_str(),
            nuke_active,
            state.result.hymofs_module_ids.len(),
            state.result.overlay_module_ids.len(),
            state.result.magic_module_ids.len(),
            if state.hymofs_mismatch {
                Some(state.mismatch_message.as_str())
            } else {
                None
            },
        );

        let runtime_state = RuntimeState {
            storage_mode: state.handle.mode.as_str().to_string(),
            mount_point: state.handle.mount_point.clone(),
            overlay_module_ids: state.result.overlay_module_ids,
            magic_module_ids: state.result.magic_module_ids,
            hymofs_module_ids: state.result.hymofs_module_ids,
            active_mounts: active_partitions(&state.plan),
            nuke_active,
            hymofs_mismatch: state.hymofs_mismatch,
            mismatch_message: state.mismatch_message,
        };

        if let Err(e) = runtime_state.save() {
            log::error!("Failed to save runtime state: {:#}", e);
        }

        log::info!(">> Mount sequence complete.");

        Ok(())
    }
}

/// Decide whether the redirector carries this run. A protocol mismatch
/// falls back to the overlay path unless the user opted out of the check.
pub fn resolve_hymofs_policy(config: &Config) -> (bool, bool, String) {
    match HymoFs::check_status() {
        HymoFsStatus::Available => (true, false, String::new()),
        HymoFsStatus::NotPresent => {
            log::info!("HymoFS control device absent; using overlay path.");
            (false, false, String::new())
        }
        status @ (HymoFsStatus::KernelTooOld | HymoFsStatus::ModuleTooOld) => {
            let kernel_version = HymoFs::get_version().unwrap_or(-1);
            let message = match status {
                HymoFsStatus::KernelTooOld => format!(
                    "HymoFS kernel driver too old (v{} < v{})",
                    kernel_version,
                    defs::HYMOFS_PROTOCOL_VERSION
                ),
                _ => format!(
                    "HymoFS module too old (kernel v{} > v{})",
                    kernel_version,
                    defs::HYMOFS_PROTOCOL_VERSION
                ),
            };

            if config.ignore_protocol_mismatch {
                log::warn!("{}; proceeding anyway (ignore_protocol_mismatch).", message);
                (true, true, message)
            } else {
                log::warn!("{}; falling back to overlay path.", message);
                (false, true, message)
            }
        }
    }
}

/// Partition names under which any content went live.
fn active_partitions(plan: &MountPlan) -> Vec<String> {
    let mut parts: BTreeSet<String> = BTreeSet::new();

    for op in &plan.overlay_ops {
        if let Some(part) = partition_of(&op.target) {
            parts.insert(part);
        }
    }

    for rule in &plan.rules {
        if let HymoRule::Add { src, .. } | HymoRule::Hide { path: src } = rule
            && let Some(part) = partition_of(src)
        {
            parts.insert(part);
        }
    }

    parts.into_iter().collect()
}

fn partition_of(path: &Path) -> Option<String> {
    path.iter()
        .nth(1)
        .map(|s| s.to_string_lossy().to_string())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn try_nuke(path: &Path) -> bool {
    match crate::mount::try_umount::nuke_ext4_sysfs(path) {
        Ok(active) => active,
        Err(e) => {
            log::warn!("Trace scrub failed: {:#}", e);
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn try_nuke(_path: &Path) -> bool {
    false
}
