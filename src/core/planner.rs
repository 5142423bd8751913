// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use anyhow::Result;
use walkdir::WalkDir;

use crate::{
    conf::config::{Config, ModuleMode},
    core::inventory::Module,
    defs,
    mount::hymofs::{self, HymoRule},
};

#[derive(Debug, Clone)]
pub struct OverlayOperation {
    /// Resolved mount target; exists and is a directory at plan time.
    pub target: PathBuf,
    /// Lower layers in priority order, highest first. The executor appends
    /// the stock target itself as the lowest layer.
    pub lowerdirs: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub overlay_ops: Vec<OverlayOperation>,
    pub magic_module_paths: Vec<PathBuf>,
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
    pub hymofs_module_ids: Vec<String>,
    /// Redirector batch: ClearAll, then InjectDirs, then Adds, then Hides.
    pub rules: Vec<HymoRule>,
    pub storage_root: PathBuf,
}

fn covered_by_ops(ops: &[OverlayOperation], path: &Path) -> bool {
    ops.iter().any(|op| path.starts_with(&op.target))
}

impl MountPlan {
    /// True iff `path` equals or lies beneath some overlay target.
    pub fn is_covered_by_overlay(&self, path: &Path) -> bool {
        covered_by_ops(&self.overlay_ops, path)
    }

    /// Module id owning a lower layer, derived from its position in the
    /// mirror (`storage_root/<id>/...`).
    pub fn module_id_for_layer(&self, layer: &Path) -> Option<String> {
        layer
            .strip_prefix(&self.storage_root)
            .ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str().to_string_lossy().to_string())
    }
}

/// Generate the mount plan against the live root filesystem.
pub fn generate(
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    hymofs_active: bool,
) -> Result<MountPlan> {
    generate_at(Path::new("/"), config, modules, storage_root, hymofs_active)
}

/// Internal entry point with an explicit system root so the planner can be
/// exercised against fixture trees.
pub(crate) fn generate_at(
    system_root: &Path,
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    hymofs_active: bool,
) -> Result<MountPlan> {
    let all_partitions = config.all_partitions();

    // Step 1: directories whose semantics cannot be expressed as pointwise
    // redirection (additions, whiteouts, .replace markers) force overlay.
    let mut required_overlays: BTreeSet<PathBuf> = BTreeSet::new();
    for module in modules {
        if module.mode == ModuleMode::Magic {
            continue;
        }
        let content_path = storage_root.join(&module.id);
        if content_path.exists() {
            scan_overlay_requirements(
                system_root,
                &content_path,
                &all_partitions,
                &mut required_overlays,
            );
        }
    }

    // Step 2: classify each module. Modules iterate in priority order, so
    // layer lists come out highest-priority-first.
    let mut overlay_groups: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    let mut overlay_ids: HashSet<String> = HashSet::new();
    let mut hymofs_ids: HashSet<String> = HashSet::new();
    let mut magic_ids: HashSet<String> = HashSet::new();
    let mut magic_paths: Vec<PathBuf> = Vec::new();

    for module in modules {
        let content_path = storage_root.join(&module.id);
        if !content_path.exists() {
            log::debug!("Planner: module {} content missing, skipping", module.id);
            continue;
        }

        let parts_with_content: Vec<&String> = all_partitions
            .iter()
            .filter(|p| partition_has_content(&content_path.join(p.as_str())))
            .collect();

        if parts_with_content.is_empty() {
            log::debug!("Planner: module {} has no partition content", module.id);
            continue;
        }

        match module.mode {
            ModuleMode::Magic => {
                magic_paths.push(content_path);
                magic_ids.insert(module.id.clone());
            }
            ModuleMode::Overlay => {
                for part in &parts_with_content {
                    overlay_groups
                        .entry(system_root.join(part.as_str()))
                        .or_default()
                        .push(content_path.join(part.as_str()));
                }
                overlay_ids.insert(module.id.clone());
            }
            ModuleMode::Auto if !hymofs_active => {
                for part in &parts_with_content {
                    overlay_groups
                        .entry(system_root.join(part.as_str()))
                        .or_default()
                        .push(content_path.join(part.as_str()));
                }
                overlay_ids.insert(module.id.clone());
            }
            ModuleMode::Auto => {
                hymofs_ids.insert(module.id.clone());

                // Hybrid participation: content under a forced-overlay
                // directory rides that overlay instead of the redirector.
                for target in &required_overlays {
                    let Ok(rel) = target.strip_prefix(system_root) else {
                        continue;
                    };
                    let sub = content_path.join(rel);
                    if sub.is_dir() {
                        overlay_groups
                            .entry(target.clone())
                            .or_default()
                            .push(sub);
                    }
                }
            }
        }
    }

    // Step 3: materialize overlay operations.
    let mut plan = MountPlan {
        storage_root: storage_root.to_path_buf(),
        ..Default::default()
    };

    for (target, layers) in overlay_groups {
        let Some(resolved) = resolve_target(&target) else {
            log::debug!("Planner: target {} unresolvable, skipping", target.display());
            continue;
        };

        if !resolved.is_dir() {
            log::warn!(
                "Planner: target {} is not a directory, skipping",
                resolved.display()
            );
            continue;
        }

        let layers: Vec<PathBuf> = layers.into_iter().filter(|l| l.is_dir()).collect();
        if layers.is_empty() {
            continue;
        }

        plan.overlay_ops.push(OverlayOperation {
            target: resolved,
            lowerdirs: layers,
        });
    }

    plan.overlay_ops
        .sort_by_key(|op| (op.target.components().count(), op.target.clone()));

    // Step 4: redirector batch, reverse priority so higher-priority adds
    // land last (the kernel table is last-write-wins per key).
    if hymofs_active {
        plan.rules = build_rule_batch(
            system_root,
            storage_root,
            modules,
            &hymofs_ids,
            &all_partitions,
            &plan.overlay_ops,
        );
    }

    plan.magic_module_paths = magic_paths;
    plan.overlay_module_ids = overlay_ids.into_iter().collect();
    plan.magic_module_ids = magic_ids.into_iter().collect();
    plan.hymofs_module_ids = hymofs_ids.into_iter().collect();
    plan.overlay_module_ids.sort();
    plan.magic_module_ids.sort();
    plan.hymofs_module_ids.sort();

    Ok(plan)
}

fn is_whiteout(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// A partition participates only when it is a real, non-empty directory;
/// a symlink at the partition root does not count as content.
fn partition_has_content(dir: &Path) -> bool {
    if dir.is_symlink() || !dir.is_dir() {
        return false;
    }
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn scan_overlay_requirements(
    system_root: &Path,
    content_path: &Path,
    all_partitions: &[String],
    required: &mut BTreeSet<PathBuf>,
) {
    for part in all_partitions {
        let part_root = content_path.join(part);
        if !part_root.is_dir() || part_root.is_symlink() {
            continue;
        }

        for entry in WalkDir::new(&part_root).min_depth(1).into_iter().flatten() {
            let Ok(rel) = entry.path().strip_prefix(content_path) else {
                continue;
            };
            let virtual_path = system_root.join(rel);

            if entry.file_type().is_file() && entry.file_name() == defs::REPLACE_DIR_FILE_NAME {
                if let Some(parent) = virtual_path.parent()
                    && parent != system_root
                {
                    required.insert(parent.to_path_buf());
                }
                continue;
            }

            if let Ok(meta) = entry.metadata()
                && is_whiteout(&meta)
            {
                if let Some(parent) = virtual_path.parent()
                    && parent != system_root
                {
                    required.insert(parent.to_path_buf());
                }
                continue;
            }

            if virtual_path.symlink_metadata().is_err()
                && let Some(anchor) = nearest_existing_ancestor(system_root, &virtual_path)
            {
                required.insert(anchor);
            }
        }
    }
}

/// Deepest existing ancestor of `path`, never the root itself: an addition
/// whose anchor would be `/` cannot be served and is silently dropped.
fn nearest_existing_ancestor(system_root: &Path, path: &Path) -> Option<PathBuf> {
    let mut current = path.parent()?;
    while current != system_root {
        if current.symlink_metadata().is_ok() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
    None
}

/// Fully resolve a mount target, following symlink chains of any length.
fn resolve_target(target: &Path) -> Option<PathBuf> {
    if target.symlink_metadata().is_err() {
        return None;
    }

    match fs::canonicalize(target) {
        Ok(resolved) => Some(resolved),
        Err(e) => {
            log::warn!(
                "Planner: failed to resolve {}: {}",
                target.display(),
                e
            );
            None
        }
    }
}

fn build_rule_batch(
    system_root: &Path,
    storage_root: &Path,
    modules: &[Module],
    hymofs_ids: &HashSet<String>,
    all_partitions: &[String],
    overlay_ops: &[OverlayOperation],
) -> Vec<HymoRule> {
    let mut adds: Vec<HymoRule> = Vec::new();
    let mut hides: Vec<HymoRule> = Vec::new();
    let mut injected_dirs: BTreeSet<PathBuf> = BTreeSet::new();

    for module in modules.iter().rev() {
        if !hymofs_ids.contains(&module.id) {
            continue;
        }

        let content_path = storage_root.join(&module.id);

        for part in all_partitions {
            let part_root = content_path.join(part);
            if !part_root.is_dir() || part_root.is_symlink() {
                continue;
            }

            for entry in WalkDir::new(&part_root).min_depth(1).into_iter().flatten() {
                let Ok(rel) = entry.path().strip_prefix(&content_path) else {
                    continue;
                };
                let virtual_path = system_root.join(rel);

                if covered_by_ops(overlay_ops, &virtual_path) {
                    continue;
                }

                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let ft = meta.file_type();

                if is_whiteout(&meta) {
                    hides.push(HymoRule::Hide { path: virtual_path });
                    continue;
                }

                if !ft.is_file() && !ft.is_symlink() {
                    continue;
                }

                // Marker files describe the tree, they are not content.
                if ft.is_file() && entry.file_name() == defs::REPLACE_DIR_FILE_NAME {
                    continue;
                }

                // Never shadow a real directory with a symlink.
                if ft.is_symlink()
                    && let Ok(target_meta) = virtual_path.symlink_metadata()
                    && target_meta.is_dir()
                {
                    log::warn!(
                        "HymoFS: refusing to replace directory {} with a symlink from {}",
                        virtual_path.display(),
                        module.id
                    );
                    continue;
                }

                if let Some(parent) = virtual_path.parent() {
                    injected_dirs.insert(parent.to_path_buf());
                }

                adds.push(HymoRule::Add {
                    src: virtual_path,
                    target: entry.path().to_path_buf(),
                    dtype: hymofs::dtype_of(&ft),
                });
            }
        }
    }

    // Dirs first so lookups resolve, adds next, hides last. Intermediate
    // kernel states stay consistent while the batch streams in.
    let mut rules = Vec::with_capacity(1 + injected_dirs.len() + adds.len() + hides.len());
    rules.push(HymoRule::ClearAll);
    rules.extend(
        injected_dirs
            .into_iter()
            .map(|path| HymoRule::InjectDir { path }),
    );
    rules.extend(adds);
    rules.extend(hides);
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        system_root: PathBuf,
        storage_root: PathBuf,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            // Op targets come back canonicalized; anchor the fixture on a
            // canonical base so path assertions compare like with like.
            let base = fs::canonicalize(dir.path()).unwrap();
            let system_root = base.join("root");
            let storage_root = base.join("mirror");
            fs::create_dir_all(&system_root).unwrap();
            fs::create_dir_all(&storage_root).unwrap();
            Fixture {
                _dir: dir,
                system_root,
                storage_root,
                config: Config::default(),
            }
        }

        fn system_dir(&self, rel: &str) {
            fs::create_dir_all(self.system_root.join(rel)).unwrap();
        }

        fn system_file(&self, rel: &str) {
            let path = self.system_root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"stock").unwrap();
        }

        fn module(&self, id: &str, mode: ModuleMode) -> Module {
            let path = self.storage_root.join(id);
            fs::create_dir_all(&path).unwrap();
            Module {
                id: id.to_string(),
                source_path: path,
                mode,
                name: String::new(),
                version: String::new(),
                author: String::new(),
                description: String::new(),
            }
        }

        fn module_file(&self, id: &str, rel: &str, content: &[u8]) {
            let path = self.storage_root.join(id).join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn generate(&self, modules: &[Module], hymofs_active: bool) -> MountPlan {
            generate_at(
                &self.system_root,
                &self.config,
                modules,
                &self.storage_root,
                hymofs_active,
            )
            .unwrap()
        }
    }

    fn sorted_desc(mut modules: Vec<Module>) -> Vec<Module> {
        modules.sort_by(|a, b| b.id.cmp(&a.id));
        modules
    }

    #[test]
    fn empty_module_lands_in_no_set() {
        let fx = Fixture::new();
        let m = fx.module("m1", ModuleMode::Auto);

        let plan = fx.generate(&[m], true);

        assert!(plan.overlay_ops.is_empty());
        assert!(plan.overlay_module_ids.is_empty());
        assert!(plan.magic_module_ids.is_empty());
        assert!(plan.hymofs_module_ids.is_empty());
    }

    #[test]
    fn pure_addition_forces_overlay_at_existing_ancestor() {
        let fx = Fixture::new();
        fx.system_dir("system/app");

        let m = fx.module("m1", ModuleMode::Auto);
        fx.module_file("m1", "system/app/Foo/Foo.apk", b"apk");

        let plan = fx.generate(&[m], true);

        assert_eq!(plan.overlay_ops.len(), 1);
        let op = &plan.overlay_ops[0];
        assert_eq!(op.target, fx.system_root.join("system/app"));
        assert_eq!(op.lowerdirs, vec![fx.storage_root.join("m1/system/app")]);
        assert_eq!(plan.hymofs_module_ids, vec!["m1".to_string()]);

        // everything the module ships is covered; no Add leaks through
        assert!(
            plan.rules
                .iter()
                .all(|r| !matches!(r, HymoRule::Add { .. }))
        );
    }

    #[test]
    fn replace_marker_forces_overlay_on_parent() {
        let fx = Fixture::new();
        fx.system_dir("system/fonts");
        fx.system_file("system/fonts/Roboto.ttf");

        let m = fx.module("m1", ModuleMode::Auto);
        fx.module_file("m1", "system/fonts/.replace", b"");
        fx.module_file("m1", "system/fonts/Custom.ttf", b"font");

        let plan = fx.generate(&[m], true);

        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(plan.overlay_ops[0].target, fx.system_root.join("system/fonts"));
        // the marker itself never becomes a redirector rule
        assert!(
            plan.rules
                .iter()
                .all(|r| !matches!(r, HymoRule::Add { .. }))
        );
    }

    #[test]
    fn priority_orders_layers_and_rule_batch() {
        let fx = Fixture::new();
        fx.system_file("system/lib/libx.so");

        let m_a = fx.module("mA", ModuleMode::Auto);
        let m_b = fx.module("mB", ModuleMode::Auto);
        fx.module_file("mA", "system/lib/libx.so", b"A");
        fx.module_file("mB", "system/lib/libx.so", b"B");

        // overlay path: descending sort puts mB first in the layer stack
        let modules = sorted_desc(vec![m_a.clone(), m_b.clone()]);
        let plan = fx.generate(&modules, false);

        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(
            plan.overlay_ops[0].lowerdirs,
            vec![
                fx.storage_root.join("mB/system"),
                fx.storage_root.join("mA/system"),
            ]
        );
        assert_eq!(
            plan.overlay_module_ids,
            vec!["mA".to_string(), "mB".to_string()]
        );

        // redirector path: rules written in reverse so mB wins per key
        let plan = fx.generate(&modules, true);
        let add_targets: Vec<&PathBuf> = plan
            .rules
            .iter()
            .filter_map(|r| match r {
                HymoRule::Add { target, .. } => Some(target),
                _ => None,
            })
            .collect();

        assert_eq!(
            add_targets,
            vec![
                &fx.storage_root.join("mA/system/lib/libx.so"),
                &fx.storage_root.join("mB/system/lib/libx.so"),
            ]
        );
    }

    #[test]
    fn magic_mode_bypasses_overlay_and_rules() {
        let fx = Fixture::new();
        fx.system_dir("system");

        let m = fx.module("m1", ModuleMode::Magic);
        fx.module_file("m1", "system/bin/tool", b"bin");

        let plan = fx.generate(&[m], true);

        assert!(plan.overlay_ops.is_empty());
        assert_eq!(plan.magic_module_ids, vec!["m1".to_string()]);
        assert_eq!(plan.magic_module_paths, vec![fx.storage_root.join("m1")]);
        assert!(plan.hymofs_module_ids.is_empty());
        // magic and overlay membership stay disjoint
        assert!(
            plan.magic_module_ids
                .iter()
                .all(|id| !plan.overlay_module_ids.contains(id))
        );
    }

    #[test]
    fn overlay_mode_groups_by_partition_roots() {
        let fx = Fixture::new();
        fx.system_dir("system");
        fx.system_dir("vendor");

        let m = fx.module("m1", ModuleMode::Overlay);
        fx.module_file("m1", "system/etc/hosts", b"h");
        fx.module_file("m1", "vendor/etc/fstab", b"f");

        let plan = fx.generate(&[m], true);

        let targets: Vec<&PathBuf> = plan.overlay_ops.iter().map(|op| &op.target).collect();
        assert!(targets.contains(&&fx.system_root.join("system")));
        assert!(targets.contains(&&fx.system_root.join("vendor")));
        assert_eq!(plan.overlay_module_ids, vec!["m1".to_string()]);
    }

    #[test]
    fn is_covered_by_overlay_matches_target_and_descendants() {
        let fx = Fixture::new();
        let target = fx.system_root.join("system/app");
        let plan = MountPlan {
            overlay_ops: vec![OverlayOperation {
                target: target.clone(),
                lowerdirs: vec![],
            }],
            ..Default::default()
        };

        assert!(plan.is_covered_by_overlay(&target));
        assert!(plan.is_covered_by_overlay(&target.join("Foo/Foo.apk")));
        assert!(!plan.is_covered_by_overlay(&fx.system_root.join("system/apples")));
        assert!(!plan.is_covered_by_overlay(&fx.system_root.join("system")));
    }

    #[test]
    fn rule_batch_is_ordered_and_injects_parents() {
        let fx = Fixture::new();
        fx.system_file("system/lib/libx.so");
        fx.system_file("system/bin/tool");

        let m = fx.module("m1", ModuleMode::Auto);
        fx.module_file("m1", "system/lib/libx.so", b"x");
        fx.module_file("m1", "system/bin/tool", b"t");

        let plan = fx.generate(&[m], true);

        assert_eq!(plan.rules.first(), Some(&HymoRule::ClearAll));

        let kind_rank = |r: &HymoRule| match r {
            HymoRule::ClearAll => 0,
            HymoRule::InjectDir { .. } => 1,
            HymoRule::Add { .. } => 2,
            HymoRule::Hide { .. } => 3,
            HymoRule::Delete { .. } => 4,
        };
        let ranks: Vec<u8> = plan.rules.iter().map(kind_rank).collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted, "batch must be dirs, adds, hides in order");

        let injected: Vec<&PathBuf> = plan
            .rules
            .iter()
            .filter_map(|r| match r {
                HymoRule::InjectDir { path } => Some(path),
                _ => None,
            })
            .collect();

        for rule in &plan.rules {
            if let HymoRule::Add { src, target, .. } = rule {
                let parent = src.parent().unwrap().to_path_buf();
                assert!(injected.contains(&&parent), "missing InjectDir for {:?}", src);
                assert!(
                    target.starts_with(&fx.storage_root),
                    "rule target escapes the mirror: {:?}",
                    target
                );
            }
        }
    }

    #[test]
    fn symlink_never_replaces_real_directory() {
        let fx = Fixture::new();
        fx.system_dir("system/bin");
        fx.system_file("system/bin/keep");

        let m = fx.module("m1", ModuleMode::Auto);
        let link = fx.storage_root.join("m1/system/bin");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        fs::create_dir_all(fx.storage_root.join("m1/system/xbin")).unwrap();
        fs::write(fx.storage_root.join("m1/system/xbin/tool"), b"t").unwrap();
        symlink("xbin", &link).unwrap();
        fx.system_dir("system/xbin");
        fx.system_file("system/xbin/tool");

        let plan = fx.generate(&[m], true);

        assert!(plan.rules.iter().all(|r| {
            !matches!(r, HymoRule::Add { src, .. } if src == &fx.system_root.join("system/bin"))
        }));
    }

    #[test]
    fn hybrid_module_keeps_uncovered_adds() {
        let fx = Fixture::new();
        fx.system_dir("system/app");
        fx.system_file("system/etc/hosts");

        let m = fx.module("m1", ModuleMode::Auto);
        fx.module_file("m1", "system/app/Foo/Foo.apk", b"apk");
        fx.module_file("m1", "system/etc/hosts", b"mod");

        let plan = fx.generate(&[m], true);

        // forced op for the addition, plain rule for the replacement
        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(plan.overlay_ops[0].target, fx.system_root.join("system/app"));

        let adds: Vec<&PathBuf> = plan
            .rules
            .iter()
            .filter_map(|r| match r {
                HymoRule::Add { src, .. } => Some(src),
                _ => None,
            })
            .collect();

        assert_eq!(adds, vec![&fx.system_root.join("system/etc/hosts")]);
        assert!(
            adds.iter().all(|src| !plan.is_covered_by_overlay(src)),
            "covered paths must never be redirected"
        );
    }

    #[test]
    fn symlinked_target_resolves_through_chain() {
        let fx = Fixture::new();
        fx.system_dir("system_real/etc");
        symlink("system_mid", fx.system_root.join("system")).unwrap();
        symlink("system_real", fx.system_root.join("system_mid")).unwrap();

        let m = fx.module("m1", ModuleMode::Overlay);
        fx.module_file("m1", "system/etc/hosts", b"h");

        let plan = fx.generate(&[m], false);

        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(
            plan.overlay_ops[0].target,
            fx.system_root.join("system_real")
        );
    }

    #[test]
    fn unresolvable_target_is_dropped() {
        let fx = Fixture::new();
        // no system/mi_ext on the host at all

        let m = fx.module("m1", ModuleMode::Overlay);
        fx.module_file("m1", "mi_ext/etc/conf", b"c");

        let mut config = Config::default();
        config.partitions = vec!["mi_ext".to_string()];
        let plan = generate_at(
            &fx.system_root,
            &config,
            &[m],
            &fx.storage_root,
            false,
        )
        .unwrap();

        assert!(plan.overlay_ops.is_empty());
    }
}
