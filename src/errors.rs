use std::io;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Patch tool install failed: {0}")]
    ToolInstall(String),
    #[error("Patch tool verification failed: {0}")]
    ToolVerification(String),
    #[error("Download failed: {0}")]
    Download(String),
    #[error("Patch for version {version} is {size} bytes, above the {limit} byte ceiling")]
    PatchSizeAnomaly { version: u32, size: u64, limit: u64 },
    #[error("Patch apply failed (exit {exit_code:?}): {stderr}")]
    Apply {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Runtime install failed: {0}")]
    RuntimeInstall(String),
    #[error("Launch failed: {0}")]
    Launch(String),
    #[error("Another operation is already running")]
    Busy,
}

/// Stable classification carried by error events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Io,
    Config,
    ToolInstall,
    ToolVerification,
    Download,
    PatchSizeAnomaly,
    Apply,
    Timeout,
    Cancelled,
    RuntimeInstall,
    Launch,
    Busy,
}

impl LauncherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::Network(_) | LauncherError::Http(_) => ErrorKind::Network,
            LauncherError::Io(_) => ErrorKind::Io,
            LauncherError::Serde(_) | LauncherError::Config(_) | LauncherError::NotFound(_) => {
                ErrorKind::Config
            }
            LauncherError::ToolInstall(_) => ErrorKind::ToolInstall,
            LauncherError::ToolVerification(_) => ErrorKind::ToolVerification,
            LauncherError::Download(_) => ErrorKind::Download,
            LauncherError::PatchSizeAnomaly { .. } => ErrorKind::PatchSizeAnomaly,
            LauncherError::Apply { .. } => ErrorKind::Apply,
            LauncherError::Timeout(_) => ErrorKind::Timeout,
            LauncherError::Cancelled => ErrorKind::Cancelled,
            LauncherError::RuntimeInstall(_) => ErrorKind::RuntimeInstall,
            LauncherError::Launch(_) => ErrorKind::Launch,
            LauncherError::Busy => ErrorKind::Busy,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LauncherError::Cancelled)
    }

    /// Extra detail for the error event, when the short message hides it.
    pub fn technical_detail(&self) -> Option<String> {
        match self {
            LauncherError::Apply { stderr, .. } if !stderr.trim().is_empty() => {
                Some(stderr.trim().to_string())
            }
            LauncherError::Network(err) => Some(format!("{err:?}")),
            LauncherError::Io(err) => Some(format!("{:?}", err.kind())),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
