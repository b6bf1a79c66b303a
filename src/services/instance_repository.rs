use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::LauncherConfig;
use crate::errors::{LauncherError, Result};
use crate::models::{Branch, LatestCheckpoint, LATEST_VERSION};
use crate::utils::file::{
    dir_is_empty, move_path, remove_dir_if_exists, remove_file_if_exists, write_atomic,
};
use crate::utils::platform::client_executable_relative;

const LATEST_DIR_NAME: &str = "latest";
const CHECKPOINT_FILE: &str = "latest.json";

fn version_dir_name(version: u32) -> String {
    if version == LATEST_VERSION {
        LATEST_DIR_NAME.to_string()
    } else {
        version.to_string()
    }
}

/// One way of naming an instance directory on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceLayout {
    /// `<root>/<branch>/<version>`
    Primary,
    /// `<root>/<branch>-<version>`
    LegacyDash,
    /// `<root>/<branch>-v<version>`
    LegacyDashV,
}

/// Read lookup order. Writes only ever use the first entry.
pub const READ_LAYOUTS: [InstanceLayout; 3] = [
    InstanceLayout::Primary,
    InstanceLayout::LegacyDash,
    InstanceLayout::LegacyDashV,
];

impl InstanceLayout {
    pub fn locate(&self, root: &Path, branch: Branch, version: u32) -> PathBuf {
        let name = version_dir_name(version);
        match self {
            InstanceLayout::Primary => root.join(branch.as_str()).join(name),
            InstanceLayout::LegacyDash => root.join(format!("{}-{}", branch.as_str(), name)),
            InstanceLayout::LegacyDashV => root.join(format!("{}-v{}", branch.as_str(), name)),
        }
    }

    fn parse_dir_name(&self, branch: Branch, name: &str) -> Option<u32> {
        let rest = match self {
            InstanceLayout::Primary => name,
            InstanceLayout::LegacyDash => name.strip_prefix(branch.as_str())?.strip_prefix('-')?,
            InstanceLayout::LegacyDashV => name.strip_prefix(branch.as_str())?.strip_prefix("-v")?,
        };
        if rest == LATEST_DIR_NAME {
            return Some(LATEST_VERSION);
        }
        rest.parse::<u32>().ok().filter(|version| *version != LATEST_VERSION)
    }
}

#[derive(Clone, Debug)]
pub struct InstanceRepository {
    root: PathBuf,
    client_relative: PathBuf,
    preserved_subtrees: Vec<String>,
    user_data_dir: String,
}

impl InstanceRepository {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            root: config.instances_dir(),
            client_relative: client_executable_relative(),
            preserved_subtrees: config.preserved_subtrees.clone(),
            user_data_dir: config.user_data_dir.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Instance directory for (branch, version), falling back to legacy names when
    /// `prefer_existing` is set and the primary location holds no client.
    pub fn resolve_path(&self, branch: Branch, version: u32, prefer_existing: bool) -> PathBuf {
        let primary = InstanceLayout::Primary.locate(&self.root, branch, version);
        if !prefer_existing || self.is_installed(&primary) {
            return primary;
        }
        for layout in READ_LAYOUTS.iter().skip(1) {
            let candidate = layout.locate(&self.root, branch, version);
            if self.is_installed(&candidate) {
                tracing::debug!(
                    "using legacy instance layout {:?} at {}",
                    layout,
                    candidate.display()
                );
                return candidate;
            }
        }
        primary
    }

    /// Moves an instance found under a legacy name to its primary location so it
    /// can be written to. Returns the primary path.
    pub fn migrate_to_primary(
        &self,
        branch: Branch,
        version: u32,
        instance_dir: &Path,
    ) -> Result<PathBuf> {
        let primary = InstanceLayout::Primary.locate(&self.root, branch, version);
        if instance_dir == primary {
            return Ok(primary);
        }
        if primary.exists() {
            if !dir_is_empty(&primary) {
                return Err(LauncherError::Config(format!(
                    "cannot migrate {}: {} is not empty",
                    instance_dir.display(),
                    primary.display()
                )));
            }
            std::fs::remove_dir(&primary)?;
        }
        move_path(instance_dir, &primary)?;
        tracing::info!(
            "migrated legacy instance {} to {}",
            instance_dir.display(),
            primary.display()
        );
        Ok(primary)
    }

    pub fn client_executable(&self, instance_dir: &Path) -> PathBuf {
        instance_dir.join(&self.client_relative)
    }

    /// The client binary is the only evidence of an installed instance.
    pub fn is_installed(&self, instance_dir: &Path) -> bool {
        self.client_executable(instance_dir).is_file()
    }

    pub fn user_data_dir(&self, instance_dir: &Path) -> PathBuf {
        instance_dir.join(&self.user_data_dir)
    }

    pub fn checkpoint_path(&self, branch: Branch) -> PathBuf {
        self.root.join(branch.as_str()).join(CHECKPOINT_FILE)
    }

    pub fn load_latest_checkpoint(&self, branch: Branch) -> Result<Option<LatestCheckpoint>> {
        let path = self.checkpoint_path(branch);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let checkpoint: LatestCheckpoint = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("unreadable checkpoint {}: {}", path.display(), err);
                return Ok(None);
            }
        };
        if checkpoint.branch != branch {
            tracing::warn!(
                "checkpoint {} names branch {} instead of {}",
                path.display(),
                checkpoint.branch,
                branch
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// Durably records that the latest slot of `branch` now holds `version`.
    pub fn save_latest_checkpoint(&self, branch: Branch, version: u32) -> Result<()> {
        let checkpoint = LatestCheckpoint { version, branch };
        let payload = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.checkpoint_path(branch), &payload)?;
        tracing::info!("checkpoint saved branch={} version={}", branch, version);
        Ok(())
    }

    pub fn clear_latest_checkpoint(&self, branch: Branch) -> Result<()> {
        remove_file_if_exists(&self.checkpoint_path(branch))?;
        Ok(())
    }

    /// Wipes an instance but keeps the configured subtrees. Returns how many were kept.
    pub fn recover_corrupted_install(&self, instance_dir: &Path) -> Result<usize> {
        let holding = self.root.join(format!(".recovery-{}", Uuid::new_v4().simple()));
        let mut moved: Vec<&str> = Vec::new();

        for name in &self.preserved_subtrees {
            let source = instance_dir.join(name);
            if !source.exists() {
                continue;
            }
            if let Err(err) = move_path(&source, &holding.join(name)) {
                self.restore_preserved(&holding, instance_dir, &moved);
                return Err(err.into());
            }
            moved.push(name.as_str());
        }

        if let Err(err) = remove_dir_if_exists(instance_dir)
            .and_then(|_| std::fs::create_dir_all(instance_dir))
        {
            let _ = std::fs::create_dir_all(instance_dir);
            self.restore_preserved(&holding, instance_dir, &moved);
            return Err(err.into());
        }

        self.restore_preserved(&holding, instance_dir, &moved);
        tracing::warn!(
            "recovered corrupted instance {} preserved={:?}",
            instance_dir.display(),
            moved
        );
        Ok(moved.len())
    }

    fn restore_preserved(&self, holding: &Path, instance_dir: &Path, names: &[&str]) {
        for name in names {
            if let Err(err) = move_path(&holding.join(name), &instance_dir.join(name)) {
                tracing::error!(
                    "failed to restore {} into {}: {} (left at {})",
                    name,
                    instance_dir.display(),
                    err,
                    holding.display()
                );
                return;
            }
        }
        let _ = remove_dir_if_exists(holding);
    }

    /// Installed versions of `branch`, `LATEST_VERSION` included, across all layouts.
    pub fn list_installed(&self, branch: Branch) -> Vec<u32> {
        let mut found = Vec::new();
        for layout in READ_LAYOUTS {
            let scan_dir = match layout {
                InstanceLayout::Primary => self.root.join(branch.as_str()),
                _ => self.root.clone(),
            };
            let Ok(entries) = std::fs::read_dir(&scan_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(version) = layout.parse_dir_name(branch, &name) else {
                    continue;
                };
                if self.is_installed(&entry.path()) && !found.contains(&version) {
                    found.push(version);
                }
            }
        }
        found.sort_unstable();
        found
    }

    /// Removes an instance directory. Deleting the latest slot also drops its checkpoint.
    pub fn delete_instance(&self, branch: Branch, version: u32) -> Result<bool> {
        let path = self.resolve_path(branch, version, true);
        let existed = path.exists();
        remove_dir_if_exists(&path)?;
        if version == LATEST_VERSION {
            self.clear_latest_checkpoint(branch)?;
        }
        tracing::info!(
            "deleted instance branch={} version={} path={} existed={}",
            branch,
            version,
            path.display(),
            existed
        );
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::TempRoot;

    fn repository() -> (TempRoot, InstanceRepository) {
        let root = TempRoot::new("game-updater-instances");
        let repo = InstanceRepository::new(&LauncherConfig {
            root_dir: root.path().to_path_buf(),
            ..LauncherConfig::default()
        });
        (root, repo)
    }

    fn install_client(repo: &InstanceRepository, dir: &Path) {
        let exe = repo.client_executable(dir);
        std::fs::create_dir_all(exe.parent().expect("client parent")).expect("client dir");
        std::fs::write(exe, b"bin").expect("write client");
    }

    #[test]
    fn primary_layout_maps_sentinel_to_latest() {
        let (_root, repo) = repository();
        assert_eq!(
            repo.resolve_path(Branch::Release, 0, false),
            repo.root().join("release").join("latest")
        );
        assert_eq!(
            repo.resolve_path(Branch::PreRelease, 4, false),
            repo.root().join("pre-release").join("4")
        );
    }

    #[test]
    fn falls_back_to_legacy_layouts_in_order() {
        let (_root, repo) = repository();
        let dash = repo.root().join("release-3");
        let dash_v = repo.root().join("release-v3");
        install_client(&repo, &dash_v);
        assert_eq!(repo.resolve_path(Branch::Release, 3, true), dash_v);

        install_client(&repo, &dash);
        assert_eq!(repo.resolve_path(Branch::Release, 3, true), dash);

        let primary = repo.root().join("release").join("3");
        install_client(&repo, &primary);
        assert_eq!(repo.resolve_path(Branch::Release, 3, true), primary);
    }

    #[test]
    fn writes_ignore_legacy_locations() {
        let (_root, repo) = repository();
        install_client(&repo, &repo.root().join("release-3"));
        assert_eq!(
            repo.resolve_path(Branch::Release, 3, false),
            repo.root().join("release").join("3")
        );
    }

    #[test]
    fn installed_means_client_binary_present() {
        let (_root, repo) = repository();
        let dir = repo.resolve_path(Branch::Release, 0, false);
        std::fs::create_dir_all(dir.join("UserData")).expect("create dir");
        assert!(!repo.is_installed(&dir));
        install_client(&repo, &dir);
        assert!(repo.is_installed(&dir));
    }

    #[test]
    fn checkpoint_round_trips_and_is_absent_by_default() {
        let (_root, repo) = repository();
        assert_eq!(
            repo.load_latest_checkpoint(Branch::Release).expect("load"),
            None
        );

        repo.save_latest_checkpoint(Branch::Release, 4).expect("save");
        let loaded = repo
            .load_latest_checkpoint(Branch::Release)
            .expect("load")
            .expect("checkpoint present");
        assert_eq!(loaded.version, 4);
        assert_eq!(loaded.branch, Branch::Release);
        assert!(!repo.checkpoint_path(Branch::Release).with_extension("tmp").exists());
        assert_eq!(
            repo.load_latest_checkpoint(Branch::PreRelease).expect("load"),
            None
        );
    }

    #[test]
    fn corrupt_checkpoint_is_treated_as_unknown() {
        let (_root, repo) = repository();
        let path = repo.checkpoint_path(Branch::Release);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        std::fs::write(&path, b"{\"Version\":").expect("write junk");
        assert_eq!(repo.load_latest_checkpoint(Branch::Release).expect("load"), None);
    }

    #[test]
    fn recovery_keeps_only_preserved_subtrees() {
        let (_root, repo) = repository();
        let dir = repo.resolve_path(Branch::Release, 0, false);
        install_client(&repo, &dir);
        std::fs::create_dir_all(dir.join("UserData").join("Saves")).expect("saves");
        std::fs::write(dir.join("UserData").join("Saves").join("world.dat"), b"w").expect("save");
        std::fs::write(dir.join("Assets.zip"), b"assets").expect("assets");
        std::fs::write(dir.join("broken.bin"), b"junk").expect("junk");

        let kept = repo.recover_corrupted_install(&dir).expect("recover");

        assert_eq!(kept, 2);
        assert!(dir.is_dir());
        assert!(!repo.is_installed(&dir));
        assert!(!dir.join("broken.bin").exists());
        assert_eq!(
            std::fs::read(dir.join("UserData").join("Saves").join("world.dat")).expect("read"),
            b"w"
        );
        assert_eq!(std::fs::read(dir.join("Assets.zip")).expect("read"), b"assets");
        let leftovers: Vec<_> = std::fs::read_dir(repo.root())
            .expect("read root")
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".recovery-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn lists_and_deletes_instances() {
        let (_root, repo) = repository();
        install_client(&repo, &repo.resolve_path(Branch::Release, 0, false));
        install_client(&repo, &repo.resolve_path(Branch::Release, 2, false));
        install_client(&repo, &repo.root().join("release-v5"));
        std::fs::create_dir_all(repo.root().join("release").join("7")).expect("empty dir");
        repo.save_latest_checkpoint(Branch::Release, 9).expect("save");

        assert_eq!(repo.list_installed(Branch::Release), vec![0, 2, 5]);
        assert!(repo.list_installed(Branch::PreRelease).is_empty());

        assert!(repo.delete_instance(Branch::Release, 0).expect("delete latest"));
        assert_eq!(repo.load_latest_checkpoint(Branch::Release).expect("load"), None);
        assert!(repo.delete_instance(Branch::Release, 5).expect("delete legacy"));
        assert_eq!(repo.list_installed(Branch::Release), vec![2]);
    }

    #[test]
    fn migration_moves_legacy_instance_to_primary() {
        let (_root, repo) = repository();
        let legacy = repo.root().join("release-latest");
        install_client(&repo, &legacy);
        std::fs::create_dir_all(legacy.join("UserData")).expect("user data");
        let primary = repo.resolve_path(Branch::Release, 0, false);
        std::fs::create_dir_all(&primary).expect("empty primary");

        let moved = repo
            .migrate_to_primary(Branch::Release, 0, &legacy)
            .expect("migrate");

        assert_eq!(moved, primary);
        assert!(repo.is_installed(&primary));
        assert!(primary.join("UserData").is_dir());
        assert!(!legacy.exists());
        assert_eq!(repo.resolve_path(Branch::Release, 0, true), primary);
    }

    #[test]
    fn migration_refuses_to_overwrite_populated_primary() {
        let (_root, repo) = repository();
        let legacy = repo.root().join("release-latest");
        install_client(&repo, &legacy);
        let primary = repo.resolve_path(Branch::Release, 0, false);
        std::fs::create_dir_all(primary.join("UserData")).expect("populated primary");

        assert!(repo.migrate_to_primary(Branch::Release, 0, &legacy).is_err());
        assert!(repo.is_installed(&legacy));
        assert!(primary.join("UserData").is_dir());
    }
}
