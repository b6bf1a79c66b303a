use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{expand_platform_template, LauncherConfig};
use crate::errors::{LauncherError, Result};
use crate::services::transfer::ArtifactTransport;
use crate::utils::archive::extract_zip_archive;
use crate::utils::file::{mark_executable, remove_dir_if_exists, remove_file_if_exists};
use crate::utils::platform::{
    arch_name, executable_name, hide_console_window, os_name, trim_output_snippet,
};

const TOOL_STEM: &str = "butler";
const TOOL_ARCHIVE_NAME: &str = "butler-download.zip";
const STAGING_PREFIX: &str = ".staging-";
const PROGRESS_TICK: Duration = Duration::from_secs(2);
const SYNTHETIC_STEP: f64 = 3.0;
const SYNTHETIC_CAP: f64 = 90.0;

static PERCENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").expect("percent pattern compiles"));

/// Percent callback on the caller-private 0..=100 scale.
pub type PercentProgress<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[async_trait]
pub trait DiffApplier: Send + Sync {
    /// Returns the path of a working tool binary, installing it when needed.
    async fn ensure_installed(
        &self,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;

    /// Applies `patch_file` into `target_dir`.
    async fn apply_diff(
        &self,
        patch_file: &Path,
        target_dir: &Path,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

pub struct PatchToolManager {
    tool_dir: PathBuf,
    archive_url: String,
    extra_apply_args: Vec<String>,
    liveness_timeout: Duration,
    apply_timeout: Duration,
    transport: Arc<dyn ArtifactTransport>,
    install_lock: Mutex<()>,
}

enum ApplyExit {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// Staging directory removed on every exit path, including panics.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(target_dir: &Path) -> Result<Self> {
        let path = target_dir.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn cleanup(&self) {
        if let Err(err) = remove_dir_if_exists(&self.path) {
            tracing::warn!("failed to remove staging dir {}: {}", self.path.display(), err);
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl PatchToolManager {
    pub fn new(config: &LauncherConfig, transport: Arc<dyn ArtifactTransport>) -> Self {
        Self {
            tool_dir: config.tools_dir(),
            archive_url: expand_platform_template(
                &config.patch_tool_archive_url,
                os_name(),
                arch_name(),
            ),
            extra_apply_args: config.patch_tool_extra_args.clone(),
            liveness_timeout: config.liveness_timeout(),
            apply_timeout: config.apply_timeout(),
            transport,
            install_lock: Mutex::new(()),
        }
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn binary_path(&self) -> PathBuf {
        self.tool_dir.join(executable_name(TOOL_STEM))
    }

    /// Runs `<tool> version` and requires a zero exit within the liveness timeout.
    pub async fn check_liveness(&self, binary: &Path) -> Result<String> {
        let mut command = Command::new(binary);
        hide_console_window(&mut command);
        command
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.liveness_timeout, command.output())
            .await
            .map_err(|_| {
                LauncherError::ToolVerification(format!(
                    "{} version did not answer within {:?}",
                    binary.display(),
                    self.liveness_timeout
                ))
            })?
            .map_err(|err| {
                LauncherError::ToolVerification(format!("{}: {}", binary.display(), err))
            })?;

        if !output.status.success() {
            return Err(LauncherError::ToolVerification(format!(
                "{} version exited with {}: {}",
                binary.display(),
                output.status,
                trim_output_snippet(&output.stderr)
            )));
        }
        let mut reported = trim_output_snippet(&output.stdout);
        if reported.is_empty() {
            reported = trim_output_snippet(&output.stderr);
        }
        Ok(reported)
    }

    async fn reinstall(
        &self,
        binary: &Path,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        remove_dir_if_exists(&self.tool_dir)
            .map_err(|err| LauncherError::ToolInstall(format!("clearing tool dir: {err}")))?;
        std::fs::create_dir_all(&self.tool_dir)
            .map_err(|err| LauncherError::ToolInstall(format!("creating tool dir: {err}")))?;

        let archive_path = self.tool_dir.join(TOOL_ARCHIVE_NAME);
        let download_progress = |done: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|value| *value > 0) {
                let ratio = (done as f64 / total as f64).min(1.0);
                on_progress((ratio * 80.0) as u8);
            }
        };
        tracing::info!("downloading patch tool from {}", self.archive_url);
        self.transport
            .download(&self.archive_url, &archive_path, &download_progress, cancel)
            .await
            .map_err(|err| match err {
                LauncherError::Cancelled => LauncherError::Cancelled,
                other => LauncherError::ToolInstall(other.to_string()),
            })?;
        on_progress(80);

        let archive_for_extract = archive_path.clone();
        let dest = self.tool_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_zip_archive(&archive_for_extract, &dest)
        })
        .await
        .map_err(|err| LauncherError::ToolInstall(format!("extract worker failed: {err}")))?
        .map_err(|err| LauncherError::ToolInstall(format!("extracting tool archive: {err}")))?;
        let _ = remove_file_if_exists(&archive_path);
        on_progress(95);

        if !binary.exists() {
            return Err(LauncherError::ToolInstall(format!(
                "archive ({} files) did not contain {}",
                extracted,
                binary.display()
            )));
        }
        mark_executable(binary)
            .map_err(|err| LauncherError::ToolInstall(format!("chmod tool binary: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl DiffApplier for PatchToolManager {
    async fn ensure_installed(
        &self,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let _guard = self.install_lock.lock().await;
        let binary = self.binary_path();

        if binary.exists() {
            match self.check_liveness(&binary).await {
                Ok(version) => {
                    tracing::debug!("patch tool ready path={} version={}", binary.display(), version);
                    on_progress(100);
                    return Ok(binary);
                }
                Err(err) => {
                    tracing::warn!("patch tool failed liveness check, reinstalling: {}", err);
                }
            }
        } else {
            tracing::info!("patch tool missing at {}, installing", binary.display());
        }

        self.reinstall(&binary, on_progress, cancel).await?;
        let version = self.check_liveness(&binary).await?;
        tracing::info!("patch tool installed path={} version={}", binary.display(), version);
        on_progress(100);
        Ok(binary)
    }

    async fn apply_diff(
        &self,
        patch_file: &Path,
        target_dir: &Path,
        on_progress: PercentProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }
        std::fs::create_dir_all(target_dir)?;
        let staging = StagingDir::create(target_dir)?;

        let mut command = Command::new(self.binary_path());
        hide_console_window(&mut command);
        command
            .arg("apply")
            .arg("--staging-dir")
            .arg(&staging.path)
            .args(&self.extra_apply_args)
            .arg(patch_file)
            .arg(target_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            "applying patch file={} target={}",
            patch_file.display(),
            target_dir.display()
        );
        let mut child = command.spawn().map_err(|err| LauncherError::Apply {
            exit_code: None,
            stderr: format!("failed to start patch tool: {err}"),
        })?;

        let (percent_tx, mut percent_rx) = mpsc::unbounded_channel::<f64>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(percent) = parse_percent(&line) {
                        if percent_tx.send(percent).is_err() {
                            break;
                        }
                    }
                }
            });
        }
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let deadline = tokio::time::sleep(self.apply_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.tick().await;
        let mut reported = 0.0f64;
        let mut real_this_tick = false;

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ApplyExit::Cancelled,
                _ = &mut deadline => break ApplyExit::TimedOut,
                status = child.wait() => break ApplyExit::Exited(status?),
                Some(percent) = percent_rx.recv() => {
                    real_this_tick = true;
                    if percent > reported {
                        reported = percent;
                        on_progress(reported as u8);
                    }
                }
                _ = ticker.tick() => {
                    if !real_this_tick && reported < SYNTHETIC_CAP {
                        reported = (reported + SYNTHETIC_STEP).min(SYNTHETIC_CAP);
                        on_progress(reported as u8);
                    }
                    real_this_tick = false;
                }
            }
        };

        match exit {
            ApplyExit::Exited(status) if status.success() => {
                staging.cleanup();
                on_progress(100);
                tracing::info!("patch applied target={}", target_dir.display());
                Ok(())
            }
            ApplyExit::Exited(status) => {
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => Vec::new(),
                };
                staging.cleanup();
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                tracing::error!("patch tool exited with {}: {}", status, stderr);
                Err(LauncherError::Apply {
                    exit_code: status.code(),
                    stderr,
                })
            }
            ApplyExit::Cancelled => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                staging.cleanup();
                tracing::info!("patch apply cancelled target={}", target_dir.display());
                Err(LauncherError::Cancelled)
            }
            ApplyExit::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                staging.cleanup();
                tracing::error!("patch apply exceeded {:?}", self.apply_timeout);
                Err(LauncherError::Timeout(format!(
                    "patch apply exceeded {} seconds",
                    self.apply_timeout.as_secs()
                )))
            }
        }
    }
}

/// Last `NN(.N)?%` value on a tool output line.
pub fn parse_percent(line: &str) -> Option<f64> {
    PERCENT_PATTERN
        .captures_iter(line)
        .filter_map(|caps| caps.get(1))
        .filter_map(|value| value.as_str().parse::<f64>().ok())
        .filter(|value| *value <= 100.0)
        .last()
}
