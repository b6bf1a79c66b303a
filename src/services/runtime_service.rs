use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{expand_platform_template, LauncherConfig};
use crate::errors::{LauncherError, Result};
use crate::services::patch_tool::PercentProgress;
use crate::services::transfer::ArtifactTransport;
use crate::utils::archive::extract_zip_archive;
use crate::utils::file::{mark_executable, remove_dir_if_exists, remove_file_if_exists};
use crate::utils::platform::{
    arch_name, executable_name, hide_console_window, os_name, trim_output_snippet,
};

const JAVA_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const RUNTIME_ARCHIVE_NAME: &str = "jre-download.zip";

#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    /// Makes sure the game's runtime prerequisites exist and returns the Java executable.
    async fn ensure_runtime(
        &self,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

pub struct RuntimeService {
    runtimes_dir: PathBuf,
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    cache_dir: PathBuf,
    java_url: String,
    java_override: Option<PathBuf>,
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    vc_redist_url: String,
    transport: Arc<dyn ArtifactTransport>,
}

impl RuntimeService {
    pub fn new(config: &LauncherConfig, transport: Arc<dyn ArtifactTransport>) -> Self {
        Self {
            runtimes_dir: config.runtimes_dir(),
            cache_dir: config.cache_dir(),
            java_url: expand_platform_template(&config.java_runtime_url, os_name(), arch_name()),
            java_override: config.java_path.clone(),
            vc_redist_url: config.vc_redist_url.clone(),
            transport,
        }
    }

    fn java_home(&self) -> PathBuf {
        self.runtimes_dir.join(format!("{}-{}", os_name(), arch_name()))
    }

    fn find_java(&self, home: &Path) -> Option<PathBuf> {
        let java = executable_name("java");
        let candidates = [
            home.join("bin").join(&java),
            home.join("Contents").join("Home").join("bin").join(&java),
        ];
        candidates.into_iter().find(|candidate| candidate.is_file())
    }

    async fn install_java(
        &self,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let home = self.java_home();
        remove_dir_if_exists(&home)?;
        std::fs::create_dir_all(&home)?;
        let archive = self.runtimes_dir.join(RUNTIME_ARCHIVE_NAME);

        tracing::info!("downloading java runtime from {}", self.java_url);
        let download_progress = |done: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|value| *value > 0) {
                on_progress(((done as f64 / total as f64).min(1.0) * 60.0) as u8);
            }
        };
        self.transport
            .download(&self.java_url, &archive, &download_progress, cancel)
            .await
            .map_err(|err| match err {
                LauncherError::Cancelled => LauncherError::Cancelled,
                other => LauncherError::RuntimeInstall(format!("java download: {other}")),
            })?;

        let archive_for_extract = archive.clone();
        let dest = home.clone();
        tokio::task::spawn_blocking(move || extract_zip_archive(&archive_for_extract, &dest))
            .await
            .map_err(|err| LauncherError::RuntimeInstall(format!("extract worker failed: {err}")))?
            .map_err(|err| LauncherError::RuntimeInstall(format!("java extract: {err}")))?;
        let _ = remove_file_if_exists(&archive);
        on_progress(75);

        let java = self.find_java(&home).ok_or_else(|| {
            LauncherError::RuntimeInstall(format!("no java executable under {}", home.display()))
        })?;
        mark_executable(&java)
            .map_err(|err| LauncherError::RuntimeInstall(format!("chmod java: {err}")))?;
        verify_java(&java).await?;
        Ok(java)
    }

    #[cfg(target_os = "windows")]
    async fn ensure_vc_redist(&self, cancel: &CancellationToken) -> Result<()> {
        let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
        let system32 = PathBuf::from(system_root).join("System32");
        let present = ["vcruntime140.dll", "msvcp140.dll"]
            .iter()
            .all(|dll| system32.join(dll).is_file());
        if present {
            return Ok(());
        }

        let installer = self.cache_dir.join("vc_redist.x64.exe");
        tracing::info!("installing VC++ redistributable from {}", self.vc_redist_url);
        self.transport
            .download(&self.vc_redist_url, &installer, &|_, _| {}, cancel)
            .await
            .map_err(|err| match err {
                LauncherError::Cancelled => LauncherError::Cancelled,
                other => LauncherError::RuntimeInstall(format!("vc redist download: {other}")),
            })?;

        let mut command = Command::new(&installer);
        command.args(["/install", "/quiet", "/norestart"]);
        let status = command
            .status()
            .await
            .map_err(|err| LauncherError::RuntimeInstall(format!("vc redist start: {err}")))?;
        let _ = remove_file_if_exists(&installer);
        // 1638: newer version already present, 3010: reboot pending.
        match status.code() {
            Some(0) | Some(1638) | Some(3010) => Ok(()),
            other => Err(LauncherError::RuntimeInstall(format!(
                "vc redist installer exited with {other:?}"
            ))),
        }
    }

    #[cfg(not(target_os = "windows"))]
    async fn ensure_vc_redist(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RuntimeProvisioner for RuntimeService {
    async fn ensure_runtime(
        &self,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let java = match self.java_override.as_ref().filter(|path| path.is_file()) {
            Some(path) => path.clone(),
            None => match self.find_java(&self.java_home()) {
                Some(path) => path,
                None => self.install_java(on_progress, cancel).await?,
            },
        };
        on_progress(80);

        self.ensure_vc_redist(cancel).await?;
        on_progress(100);
        tracing::debug!("runtime ready java={}", java.display());
        Ok(java)
    }
}

async fn verify_java(java: &Path) -> Result<()> {
    let mut command = Command::new(java);
    hide_console_window(&mut command);
    command
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = tokio::time::timeout(JAVA_CHECK_TIMEOUT, command.output())
        .await
        .map_err(|_| LauncherError::RuntimeInstall("java -version timed out".to_string()))?
        .map_err(|err| LauncherError::RuntimeInstall(format!("java -version: {err}")))?;
    if !output.status.success() {
        return Err(LauncherError::RuntimeInstall(format!(
            "java -version exited with {}: {}",
            output.status,
            trim_output_snippet(&output.stderr)
        )));
    }
    Ok(())
}
