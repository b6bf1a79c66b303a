use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, LauncherError};

/// Version number reserved for the auto-tracking latest instance.
pub const LATEST_VERSION: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    #[serde(rename = "release")]
    Release,
    #[serde(rename = "pre-release")]
    PreRelease,
}

impl Branch {
    pub const ALL: [Branch; 2] = [Branch::Release, Branch::PreRelease];

    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Release => "release",
            Branch::PreRelease => "pre-release",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Branch {
    type Err = LauncherError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(Branch::Release),
            "pre-release" | "prerelease" | "pre_release" => Ok(Branch::PreRelease),
            other => Err(LauncherError::Config(format!("unknown branch: {other}"))),
        }
    }
}

/// Which published version currently occupies a branch's latest slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestCheckpoint {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "Branch")]
    pub branch: Branch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Resolving,
    PatchTool,
    Download,
    Apply,
    Runtime,
    Launch,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub stage: ProgressStage,
    pub percent: u8,
    pub message: String,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    Started,
    Stopped,
}

/// Messages the orchestrator pushes to whatever UI sits on the other end.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LauncherEvent {
    Progress(ProgressState),
    State {
        state: GameState,
        exit_code: Option<i32>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        technical_detail: Option<String>,
    },
}

impl LauncherEvent {
    pub fn from_error(err: &LauncherError) -> Self {
        LauncherEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
            technical_detail: err.technical_detail(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMode {
    Offline,
    Authenticated {
        identity_token: String,
        session_token: String,
    },
}

#[derive(Clone, Debug)]
pub struct LaunchIdentity {
    pub uuid: String,
    pub auth: AuthMode,
}

impl LaunchIdentity {
    pub fn offline(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            auth: AuthMode::Offline,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub display_name: String,
    pub branch: Branch,
    /// `LATEST_VERSION` selects the auto-tracking instance.
    pub version: u32,
    pub identity: LaunchIdentity,
}

impl LaunchRequest {
    pub fn latest(display_name: impl Into<String>, branch: Branch, identity: LaunchIdentity) -> Self {
        Self {
            display_name: display_name.into(),
            branch,
            version: LATEST_VERSION,
            identity,
        }
    }

    pub fn targets_latest(&self) -> bool {
        self.version == LATEST_VERSION
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    ResolvingState,
    Installing,
    ApplyingHops,
    UpToDate,
    VerifyingRuntime,
    Launching,
    Running,
    Stopped,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Stopped | OperationState::Cancelled | OperationState::Failed
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchedGame {
    pub pid: u32,
    pub instance_dir: std::path::PathBuf,
    /// Version recorded in the checkpoint when known.
    pub version: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationOutcome {
    Launched(LaunchedGame),
    Failed { kind: ErrorKind, message: String },
    Cancelled,
    Busy,
}

impl OperationOutcome {
    pub fn is_launched(&self) -> bool {
        matches!(self, OperationOutcome::Launched(_))
    }
}
