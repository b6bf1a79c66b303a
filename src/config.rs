use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub const CONFIG_FILE: &str = "launcher.config.json";

const DEFAULT_PATCH_SERVER: &str = "https://game-patches.example.net/patches";
const DEFAULT_TOOL_ARCHIVE_URL: &str =
    "https://broth.itch.ovh/butler/{os}-{arch}/LATEST/archive/default";
const DEFAULT_JAVA_RUNTIME_URL: &str =
    "https://runtime.example.net/jre/{os}-{arch}/jre.zip";
const DEFAULT_VC_REDIST_URL: &str = "https://aka.ms/vs/17/release/vc_redist.x64.exe";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherConfig {
    /// Root for instances, tools, runtimes and persisted state.
    pub root_dir: PathBuf,
    pub patch_server_base: String,
    pub patch_tool_archive_url: String,
    pub patch_tool_extra_args: Vec<String>,
    pub java_runtime_url: String,
    pub java_path: Option<PathBuf>,
    pub vc_redist_url: String,
    /// Sanity ceiling for a single update hop's artifact.
    pub max_patch_bytes: u64,
    pub apply_timeout_secs: u64,
    pub liveness_timeout_secs: u64,
    pub probe_miss_tolerance: u32,
    pub probe_window: u32,
    /// Instance subtrees kept across a corruption wipe.
    pub preserved_subtrees: Vec<String>,
    pub user_data_dir: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            patch_server_base: DEFAULT_PATCH_SERVER.to_string(),
            patch_tool_archive_url: DEFAULT_TOOL_ARCHIVE_URL.to_string(),
            patch_tool_extra_args: Vec::new(),
            java_runtime_url: DEFAULT_JAVA_RUNTIME_URL.to_string(),
            java_path: None,
            vc_redist_url: DEFAULT_VC_REDIST_URL.to_string(),
            max_patch_bytes: 500 * 1024 * 1024,
            apply_timeout_secs: 8 * 60,
            liveness_timeout_secs: 10,
            probe_miss_tolerance: 2,
            probe_window: 4,
            preserved_subtrees: vec!["UserData".to_string(), "Assets.zip".to_string()],
            user_data_dir: "UserData".to_string(),
        }
    }
}

impl LauncherConfig {
    /// Reads `launcher.config.json` under `root` when present, then applies env overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<LauncherConfig>(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LauncherConfig::default(),
            Err(err) => return Err(err.into()),
        };
        config.root_dir = root.to_path_buf();
        config.apply_env_overrides();
        tracing::debug!("launcher config loaded from {}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_string("LAUNCHER_PATCH_SERVER") {
            self.patch_server_base = value;
        }
        if let Some(value) = env_string("LAUNCHER_PATCH_TOOL_URL") {
            self.patch_tool_archive_url = value;
        }
        if let Some(value) = env_string("LAUNCHER_JAVA_RUNTIME_URL") {
            self.java_runtime_url = value;
        }
        if let Some(value) = env_string("LAUNCHER_JAVA_PATH") {
            self.java_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_u64("LAUNCHER_MAX_PATCH_MB") {
            self.max_patch_bytes = value.clamp(1, 64 * 1024) * 1024 * 1024;
        }
        if let Some(value) = env_u64("LAUNCHER_APPLY_TIMEOUT_SECS") {
            self.apply_timeout_secs = value.clamp(1, 6 * 3600);
        }
        if let Some(value) = env_u64("LAUNCHER_PROBE_MISS_TOLERANCE") {
            self.probe_miss_tolerance = value.clamp(1, 16) as u32;
        }
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root_dir.join("instances")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root_dir.join("tools").join("butler")
    }

    pub fn runtimes_dir(&self) -> PathBuf {
        self.root_dir.join("jre")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join("cache")
    }
}

/// Substitutes `{os}` and `{arch}` placeholders in a download template.
pub fn expand_platform_template(template: &str, os: &str, arch: &str) -> String {
    template.replace("{os}", os).replace("{arch}", arch)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::TempRoot;

    #[test]
    fn missing_file_yields_defaults_rooted_at_dir() {
        let temp = TempRoot::new("game-updater-config");
        let root = temp.path().to_path_buf();
        let config = LauncherConfig::load(&root).expect("load config");
        assert_eq!(config.root_dir, root);
        assert_eq!(config.apply_timeout_secs, 480);
        assert_eq!(config.max_patch_bytes, 500 * 1024 * 1024);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = TempRoot::new("game-updater-config");
        let root = temp.path().to_path_buf();
        std::fs::write(
            root.join(CONFIG_FILE),
            r#"{"patchServerBase":"http://localhost:9000/p","preservedSubtrees":["Saves"]}"#,
        )
        .expect("write config");

        let config = LauncherConfig::load(&root).expect("load config");
        assert_eq!(config.patch_server_base, "http://localhost:9000/p");
        assert_eq!(config.preserved_subtrees, vec!["Saves".to_string()]);
        assert_eq!(config.liveness_timeout_secs, 10);
    }

    #[test]
    fn template_expansion_fills_platform() {
        assert_eq!(
            expand_platform_template("https://x/{os}-{arch}/tool", "linux", "amd64"),
            "https://x/linux-amd64/tool"
        );
    }
}
