// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::HashSet, env};

use anyhow::Result;

use crate::{
    conf::config::Config,
    core::planner::MountPlan,
    mount::{hymofs::HymoFs, magic, overlay},
};

pub struct ExecutionResult {
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
    pub hymofs_module_ids: Vec<String>,
}

/// Apply a mount plan. Every per-target failure is local: the result only
/// reports modules whose delivery actually went through.
pub fn execute(plan: &MountPlan, config: &Config) -> Result<ExecutionResult> {
    let mut overlay_ids: HashSet<String> = HashSet::new();
    let mut magic_ids: HashSet<String> = HashSet::new();
    let mut hymofs_ids: Vec<String> = Vec::new();

    if !plan.rules.is_empty() {
        log::info!(
            ">> Phase 1: HymoFS rule batch ({} rules)...",
            plan.rules.len()
        );

        match HymoFs::apply_batch(&plan.rules) {
            Ok(()) => hymofs_ids = plan.hymofs_module_ids.clone(),
            Err(e) => {
                log::error!("HymoFS batch application failed: {:#}", e);
            }
        }
    }

    if !plan.overlay_ops.is_empty() {
        log::info!(
            ">> Phase 2: OverlayFS execution ({} targets)...",
            plan.overlay_ops.len()
        );
    }

    for op in &plan.overlay_ops {
        log::info!(
            "Mounting {} [OVERLAY] ({} layers)",
            op.target.display(),
            op.lowerdirs.len()
        );

        match overlay::mount_overlay(
            &op.target,
            &op.lowerdirs,
            &config.mountsource,
            config.disable_umount,
        ) {
            Ok(()) => {
                for layer in &op.lowerdirs {
                    if let Some(id) = plan.module_id_for_layer(layer) {
                        overlay_ids.insert(id);
                    }
                }
            }
            Err(e) => {
                log::error!("OverlayFS failed for {}: {:#}", op.target.display(), e);
            }
        }
    }

    // Release the chdir pin left by the last overlay op.
    let _ = env::set_current_dir("/");

    if !plan.magic_module_paths.is_empty() {
        log::info!(
            ">> Phase 3: Magic mount ({} modules)...",
            plan.magic_module_paths.len()
        );

        match magic::mount_modules(&plan.magic_module_paths, config) {
            Ok(()) => {
                magic_ids.extend(plan.magic_module_ids.iter().cloned());
            }
            Err(e) => {
                log::error!("Magic mount failed: {:#}", e);
            }
        }
    }

    // Hybrid modules legitimately sit in both the hymofs and overlay sets;
    // overlay and magic membership stays disjoint.
    let mut result_overlay: Vec<String> = overlay_ids
        .into_iter()
        .filter(|id| !magic_ids.contains(id))
        .collect();
    let mut result_magic: Vec<String> = magic_ids.into_iter().collect();

    result_overlay.sort();
    result_magic.sort();
    hymofs_ids.sort();

    Ok(ExecutionResult {
        overlay_module_ids: result_overlay,
        magic_module_ids: result_magic,
        hymofs_module_ids: hymofs_ids,
    })
}
