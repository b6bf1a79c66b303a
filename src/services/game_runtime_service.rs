use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::errors::{LauncherError, Result};
use crate::models::Branch;
use crate::utils::platform::hide_console_window;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// A started client process. `exit` resolves with the exit code once it terminates.
pub struct SpawnedGame {
    pub pid: u32,
    pub exit: BoxFuture<'static, Option<i32>>,
    pub kill: Option<oneshot::Sender<()>>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &LaunchCommand) -> Result<SpawnedGame>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioProcessSpawner;

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, launch: &LaunchCommand) -> Result<SpawnedGame> {
        let mut command = Command::new(&launch.program);
        hide_console_window(&mut command);
        command
            .args(&launch.args)
            .current_dir(&launch.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|err| {
            LauncherError::Launch(format!("failed to start {}: {err}", launch.program.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| LauncherError::Launch("client exited before reporting a pid".to_string()))?;

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exit = async move {
            tokio::select! {
                status = child.wait() => status.ok().and_then(|status| status.code()),
                Ok(()) = &mut kill_rx => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!("failed to kill client pid={}: {}", pid, err);
                    }
                    child.wait().await.ok().and_then(|status| status.code())
                }
            }
        }
        .boxed();

        Ok(SpawnedGame {
            pid,
            exit,
            kill: Some(kill_tx),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningGame {
    pub session_id: String,
    pub display_name: String,
    pub branch: Branch,
    pub version: Option<u32>,
    pub pid: u32,
    pub started_at: i64,
    pub instance_dir: PathBuf,
}

struct Slot {
    running: RunningGame,
    kill: Option<oneshot::Sender<()>>,
}

/// Tracks the one client process this launcher is allowed to have running.
#[derive(Clone, Default)]
pub struct GameRuntimeService {
    inner: Arc<Mutex<Option<Slot>>>,
}

impl GameRuntimeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<RunningGame> {
        self.lock().as_ref().map(|slot| slot.running.clone())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn register(
        &self,
        running: RunningGame,
        kill: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let mut slot = self.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(LauncherError::Launch(format!(
                "a client is already running (pid {})",
                existing.running.pid
            )));
        }
        *slot = Some(Slot { running, kill });
        Ok(())
    }

    pub fn take_if_pid_matches(&self, pid: u32) -> Option<RunningGame> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(current) if current.running.pid == pid => slot.take().map(|slot| slot.running),
            _ => None,
        }
    }

    /// Asks the running client to terminate. Returns false when nothing is running.
    pub fn stop(&self) -> bool {
        let mut slot = self.lock();
        let Some(current) = slot.as_mut() else {
            return false;
        };
        match current.kill.take() {
            Some(kill) => {
                tracing::info!("stopping client pid={}", current.running.pid);
                kill.send(()).is_ok()
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Slot>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(pid: u32) -> RunningGame {
        RunningGame {
            session_id: format!("session-{pid}"),
            display_name: "Player".to_string(),
            branch: Branch::Release,
            version: Some(4),
            pid,
            started_at: chrono::Utc::now().timestamp(),
            instance_dir: PathBuf::from("instances/release/latest"),
        }
    }

    #[test]
    fn only_one_client_can_be_registered() {
        let runtime = GameRuntimeService::new();
        runtime.register(running(10), None).expect("first register");
        let second = runtime.register(running(11), None);
        assert!(matches!(second, Err(LauncherError::Launch(_))));
        assert_eq!(runtime.current().map(|game| game.pid), Some(10));
    }

    #[test]
    fn take_requires_matching_pid() {
        let runtime = GameRuntimeService::new();
        runtime.register(running(10), None).expect("register");
        assert!(runtime.take_if_pid_matches(99).is_none());
        assert!(runtime.is_running());
        assert_eq!(runtime.take_if_pid_matches(10).map(|game| game.pid), Some(10));
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn stop_signals_the_kill_channel_once() {
        let runtime = GameRuntimeService::new();
        let (kill_tx, kill_rx) = oneshot::channel();
        runtime.register(running(10), Some(kill_tx)).expect("register");

        assert!(runtime.stop());
        assert!(!runtime.stop());
        assert!(kill_rx.await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_spawner_reports_exit_code() {
        let spawner = TokioProcessSpawner;
        let game = spawner
            .spawn(&LaunchCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "exit 7".to_string()],
                working_dir: std::env::temp_dir(),
            })
            .expect("spawn shell");
        assert!(game.pid > 0);
        assert_eq!(game.exit.await, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_spawner_kill_ends_the_process() {
        let spawner = TokioProcessSpawner;
        let mut game = spawner
            .spawn(&LaunchCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "exec sleep 30".to_string()],
                working_dir: std::env::temp_dir(),
            })
            .expect("spawn sleeper");
        let kill = game.kill.take().expect("kill handle");
        kill.send(()).expect("send kill");
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), game.exit)
            .await
            .expect("process exits after kill");
        assert_eq!(code, None);
    }
}
