use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LauncherConfig;
use crate::errors::{ErrorKind, LauncherError, Result};
use crate::models::{
    AuthMode, GameState, LaunchRequest, LaunchedGame, LauncherEvent, OperationOutcome,
    OperationState, ProgressStage, ProgressState,
};
use crate::services::game_runtime_service::{
    GameRuntimeService, LaunchCommand, ProcessSpawner, RunningGame, SpawnedGame,
    TokioProcessSpawner,
};
use crate::services::instance_repository::InstanceRepository;
use crate::services::patch_tool::{DiffApplier, PatchToolManager};
use crate::services::runtime_service::{RuntimeProvisioner, RuntimeService};
use crate::services::session_hooks::{GameSession, NoopSessionHooks, SessionHooks};
use crate::services::transfer::{ArtifactTransport, HttpTransfer, ProbeResult};
use crate::services::version_resolver::{get_patch_sequence, VersionResolver};
use crate::utils::file::{dir_is_empty, remove_file_if_exists};
use crate::utils::platform::CLIENT_DIR;

const ARTIFACTS_DIR: &str = "artifacts";

const TOOL_RANGE: (f64, f64) = (0.0, 5.0);
const FRESH_DOWNLOAD_RANGE: (f64, f64) = (5.0, 65.0);
const FRESH_APPLY_RANGE: (f64, f64) = (65.0, 85.0);
const HOPS_RANGE: (f64, f64) = (5.0, 85.0);
const HOP_DOWNLOAD_SHARE: f64 = 0.75;
const RUNTIME_RANGE: (f64, f64) = (85.0, 95.0);
const LAUNCH_START: f64 = 95.0;

/// The collaborators an orchestrator drives. Swapped for fakes in tests.
pub struct OrchestratorDeps {
    pub transport: Arc<dyn ArtifactTransport>,
    pub patch_tool: Arc<dyn DiffApplier>,
    pub runtime: Arc<dyn RuntimeProvisioner>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub hooks: Arc<dyn SessionHooks>,
}

impl OrchestratorDeps {
    pub fn production(config: &LauncherConfig) -> Self {
        let transport: Arc<dyn ArtifactTransport> = Arc::new(HttpTransfer::new());
        Self {
            patch_tool: Arc::new(PatchToolManager::new(config, transport.clone())),
            runtime: Arc::new(RuntimeService::new(config, transport.clone())),
            spawner: Arc::new(TokioProcessSpawner),
            hooks: Arc::new(NoopSessionHooks),
            transport,
        }
    }
}

struct ActiveOperation {
    id: Uuid,
    cancel: CancellationToken,
    status: watch::Receiver<OperationState>,
}

struct Shared {
    resolver: VersionResolver,
    instances: InstanceRepository,
    games: GameRuntimeService,
    deps: OrchestratorDeps,
    artifacts_dir: PathBuf,
    max_patch_bytes: u64,
    events: mpsc::UnboundedSender<LauncherEvent>,
    active: Mutex<Option<ActiveOperation>>,
}

impl Shared {
    fn emit(&self, event: LauncherEvent) {
        // A closed receiver only means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveOperation>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases the single operation slot when dropped.
struct SlotGuard {
    shared: Arc<Shared>,
    id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.shared.active();
        if active.as_ref().map(|operation| operation.id) == Some(self.id) {
            *active = None;
        }
    }
}

/// Caller-side view of one `download_and_launch` run.
pub struct OperationHandle {
    id: Uuid,
    cancel: CancellationToken,
    status: watch::Receiver<OperationState>,
    task: JoinHandle<OperationOutcome>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> OperationState {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<OperationState> {
        self.status.clone()
    }

    /// Resolves once the game has been handed off, or the run failed or was cancelled.
    pub async fn wait(self) -> OperationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => OperationOutcome::Failed {
                kind: ErrorKind::Launch,
                message: format!("operation task ended abnormally: {err}"),
            },
        }
    }
}

#[derive(Clone)]
pub struct UpdateOrchestrator {
    shared: Arc<Shared>,
}

impl UpdateOrchestrator {
    pub fn new(
        config: &LauncherConfig,
        deps: OrchestratorDeps,
    ) -> (Self, mpsc::UnboundedReceiver<LauncherEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Shared {
            resolver: VersionResolver::new(config, deps.transport.clone()),
            instances: InstanceRepository::new(config),
            games: GameRuntimeService::new(),
            deps,
            artifacts_dir: config.cache_dir().join(ARTIFACTS_DIR),
            max_patch_bytes: config.max_patch_bytes,
            events,
            active: Mutex::new(None),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            receiver,
        )
    }

    pub fn instances(&self) -> &InstanceRepository {
        &self.shared.instances
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.shared.resolver
    }

    pub fn running_game(&self) -> Option<RunningGame> {
        self.shared.games.current()
    }

    pub fn stop_game(&self) -> bool {
        self.shared.games.stop()
    }

    pub fn active_status(&self) -> Option<OperationState> {
        self.shared
            .active()
            .as_ref()
            .map(|operation| *operation.status.borrow())
    }

    pub fn cancel_active(&self) -> bool {
        match self.shared.active().as_ref() {
            Some(operation) => {
                operation.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Starts an operation in the background. Fails with `Busy` while another one
    /// holds the slot, including while its game is still running.
    pub fn start(&self, request: LaunchRequest) -> Result<OperationHandle> {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(OperationState::Idle);
        {
            let mut active = self.shared.active();
            if active.is_some() {
                return Err(LauncherError::Busy);
            }
            *active = Some(ActiveOperation {
                id,
                cancel: cancel.clone(),
                status: status_rx.clone(),
            });
        }

        let guard = SlotGuard {
            shared: self.shared.clone(),
            id,
        };
        let operation = Operation {
            progress: ProgressReporter::new(self.shared.events.clone()),
            shared: self.shared.clone(),
            request,
            cancel: cancel.clone(),
            status: Arc::new(status_tx),
        };
        let task = tokio::spawn(operation.run(guard));
        Ok(OperationHandle {
            id,
            cancel,
            status: status_rx,
            task,
        })
    }

    pub async fn download_and_launch(&self, request: LaunchRequest) -> OperationOutcome {
        match self.start(request) {
            Ok(handle) => handle.wait().await,
            Err(err) => {
                tracing::warn!("rejected launch request: {}", err);
                self.shared.emit(LauncherEvent::from_error(&err));
                match err {
                    LauncherError::Busy => OperationOutcome::Busy,
                    other => OperationOutcome::Failed {
                        kind: other.kind(),
                        message: other.to_string(),
                    },
                }
            }
        }
    }
}

/// Emits progress events on one 0..=100 scale that never moves backwards.
struct ProgressReporter {
    events: mpsc::UnboundedSender<LauncherEvent>,
    last: AtomicU8,
}

impl ProgressReporter {
    fn new(events: mpsc::UnboundedSender<LauncherEvent>) -> Self {
        Self {
            events,
            last: AtomicU8::new(0),
        }
    }

    fn report(&self, stage: ProgressStage, percent: f64, message: impl Into<String>) {
        self.report_bytes(stage, percent, message, 0, 0);
    }

    fn report_bytes(
        &self,
        stage: ProgressStage,
        percent: f64,
        message: impl Into<String>,
        bytes_downloaded: u64,
        bytes_total: u64,
    ) {
        let percent = percent.clamp(0.0, 100.0) as u8;
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        let _ = self.events.send(LauncherEvent::Progress(ProgressState {
            stage,
            percent: previous.max(percent),
            message: message.into(),
            bytes_downloaded,
            bytes_total,
        }));
    }
}

fn within(range: (f64, f64), fraction: f64) -> f64 {
    range.0 + (range.1 - range.0) * fraction.clamp(0.0, 1.0)
}

/// Deletes a downloaded artifact once it has been consumed or abandoned.
struct ArtifactFile {
    path: PathBuf,
}

impl Drop for ArtifactFile {
    fn drop(&mut self) {
        if let Err(err) = remove_file_if_exists(&self.path) {
            tracing::warn!("failed to remove artifact {}: {}", self.path.display(), err);
        }
    }
}

struct Prepared {
    dir: PathBuf,
    version: Option<u32>,
}

struct Operation {
    shared: Arc<Shared>,
    request: LaunchRequest,
    cancel: CancellationToken,
    status: Arc<watch::Sender<OperationState>>,
    progress: ProgressReporter,
}

impl Operation {
    async fn run(self, guard: SlotGuard) -> OperationOutcome {
        tracing::info!(
            "operation start name={} branch={} version={}",
            self.request.display_name,
            self.request.branch,
            self.request.version
        );
        let mut slot = Some(guard);
        let result = match self.prepare().await {
            Ok(prepared) => self.launch(prepared, &mut slot).await,
            Err(err) => Err(err),
        };
        let outcome = match result {
            Ok(game) => OperationOutcome::Launched(game),
            Err(err) => self.finish_with_error(err),
        };
        drop(slot);
        outcome
    }

    fn finish_with_error(&self, err: LauncherError) -> OperationOutcome {
        self.shared.emit(LauncherEvent::from_error(&err));
        if err.is_cancelled() {
            tracing::info!("operation cancelled branch={}", self.request.branch);
            self.set_state(OperationState::Cancelled);
            return OperationOutcome::Cancelled;
        }
        tracing::error!("operation failed branch={}: {}", self.request.branch, err);
        self.set_state(OperationState::Failed);
        OperationOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn set_state(&self, state: OperationState) {
        tracing::debug!("operation state -> {:?}", state);
        self.status.send_replace(state);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }
        Ok(())
    }

    async fn cancellable<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LauncherError::Cancelled),
            result = work => result,
        }
    }

    async fn prepare(&self) -> Result<Prepared> {
        self.set_state(OperationState::ResolvingState);
        self.progress
            .report(ProgressStage::Resolving, 0.0, "Checking installed game");
        self.check_cancelled()?;

        let branch = self.request.branch;
        if self.request.targets_latest() {
            // Pick up versions published since the last operation.
            self.shared.resolver.invalidate(branch).await;
        }

        let instances = &self.shared.instances;
        let existing = instances.resolve_path(branch, self.request.version, true);
        if instances.is_installed(&existing) {
            return self.update_installed(existing).await;
        }

        self.set_state(OperationState::Installing);
        let dir = instances.resolve_path(branch, self.request.version, false);
        let version = self.install_fresh(&dir).await?;
        Ok(Prepared {
            dir,
            version: Some(version),
        })
    }

    async fn update_installed(&self, dir: PathBuf) -> Result<Prepared> {
        let branch = self.request.branch;
        if !self.request.targets_latest() {
            self.set_state(OperationState::UpToDate);
            return Ok(Prepared {
                dir,
                version: Some(self.request.version),
            });
        }

        let Some(checkpoint) = self.shared.instances.load_latest_checkpoint(branch)? else {
            tracing::info!(
                "no checkpoint for {} latest instance, launching without updating",
                branch
            );
            self.set_state(OperationState::UpToDate);
            return Ok(Prepared { dir, version: None });
        };
        let unchanged = |dir: PathBuf| Prepared {
            dir,
            version: Some(checkpoint.version),
        };

        let remote = match self
            .cancellable(self.shared.resolver.get_latest_version(branch))
            .await
        {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                self.set_state(OperationState::UpToDate);
                return Ok(unchanged(dir));
            }
            Err(LauncherError::Cancelled) => return Err(LauncherError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    "remote version lookup failed, launching installed v{}: {}",
                    checkpoint.version,
                    err
                );
                self.set_state(OperationState::UpToDate);
                return Ok(unchanged(dir));
            }
        };

        let hops = get_patch_sequence(checkpoint.version, remote);
        if hops.is_empty() {
            self.set_state(OperationState::UpToDate);
            return Ok(unchanged(dir));
        }

        // Legacy directories are read-only; patches land in the primary layout.
        let dir = match self
            .shared
            .instances
            .migrate_to_primary(branch, self.request.version, &dir)
        {
            Ok(primary) => primary,
            Err(err) => {
                tracing::warn!(
                    "cannot move {} to the primary layout, launching v{} unpatched: {}",
                    dir.display(),
                    checkpoint.version,
                    err
                );
                self.set_state(OperationState::UpToDate);
                return Ok(unchanged(dir));
            }
        };

        self.set_state(OperationState::ApplyingHops);
        tracing::info!(
            "updating {} latest from v{} to v{} hops={:?}",
            branch,
            checkpoint.version,
            remote,
            hops
        );
        let version = self.apply_hops(&dir, checkpoint.version, &hops).await?;
        Ok(Prepared {
            dir,
            version: Some(version),
        })
    }

    /// Applies each hop in order, committing the checkpoint after every one.
    /// Returns the version the instance ended up at.
    async fn apply_hops(&self, dir: &Path, installed: u32, hops: &[u32]) -> Result<u32> {
        if let Err(err) = self.ensure_tool().await {
            if err.is_cancelled() {
                return Err(err);
            }
            self.report_hop_failure(installed, &err);
            return Ok(installed);
        }

        let span = (HOPS_RANGE.1 - HOPS_RANGE.0) / hops.len() as f64;
        let mut current = installed;
        for (index, version) in hops.iter().copied().enumerate() {
            let start = HOPS_RANGE.0 + span * index as f64;
            let split = start + span * HOP_DOWNLOAD_SHARE;
            let result = match self
                .fetch_and_apply(dir, version, (start, split), (split, start + span), true)
                .await
            {
                Ok(()) => self
                    .shared
                    .instances
                    .save_latest_checkpoint(self.request.branch, version),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    tracing::info!("hop v{} committed", version);
                    current = version;
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    self.report_hop_failure(current, &err);
                    break;
                }
            }
        }
        Ok(current)
    }

    fn report_hop_failure(&self, kept: u32, err: &LauncherError) {
        tracing::warn!("update stopped, keeping v{}: {}", kept, err);
        self.shared.emit(LauncherEvent::from_error(err));
    }

    async fn install_fresh(&self, dir: &Path) -> Result<u32> {
        let branch = self.request.branch;
        let instances = &self.shared.instances;
        if dir.exists() && !dir_is_empty(dir) {
            tracing::warn!(
                "instance {} has no client, recovering before reinstall",
                dir.display()
            );
            instances.recover_corrupted_install(dir)?;
        }
        tokio::fs::create_dir_all(dir).await?;

        self.ensure_tool().await?;

        let target = if self.request.targets_latest() {
            self.cancellable(self.shared.resolver.get_latest_version(branch))
                .await?
                .ok_or_else(|| {
                    LauncherError::NotFound(format!("no published versions on {branch}"))
                })?
        } else {
            self.request.version
        };

        tracing::info!(
            "fresh install branch={} version={} into {}",
            branch,
            target,
            dir.display()
        );
        self.fetch_and_apply(dir, target, FRESH_DOWNLOAD_RANGE, FRESH_APPLY_RANGE, false)
            .await?;
        if !instances.is_installed(dir) {
            return Err(LauncherError::NotFound(format!(
                "client executable missing after installing version {target}"
            )));
        }
        if self.request.targets_latest() {
            instances.save_latest_checkpoint(branch, target)?;
        }
        Ok(target)
    }

    async fn ensure_tool(&self) -> Result<PathBuf> {
        let progress = &self.progress;
        progress.report(ProgressStage::PatchTool, TOOL_RANGE.0, "Checking patch tool");
        let on_percent = |percent: u8| {
            progress.report(
                ProgressStage::PatchTool,
                within(TOOL_RANGE, f64::from(percent) / 100.0),
                "Installing patch tool",
            );
        };
        self.shared
            .deps
            .patch_tool
            .ensure_installed(&on_percent, &self.cancel)
            .await
    }

    /// Downloads the artifact for `version` and applies it into `dir`. The ceiling
    /// check only guards incremental hops; a full package may legitimately be large.
    async fn fetch_and_apply(
        &self,
        dir: &Path,
        version: u32,
        download: (f64, f64),
        apply: (f64, f64),
        enforce_ceiling: bool,
    ) -> Result<()> {
        let branch = self.request.branch;
        let url = self.shared.resolver.patch_url(branch, version);
        let advertised = match self.cancellable(self.shared.deps.transport.probe(&url)).await? {
            ProbeResult::Missing => {
                return Err(LauncherError::Download(format!(
                    "version {version} is not published at {url}"
                )))
            }
            ProbeResult::Present { size } => size,
        };
        if enforce_ceiling {
            if let Some(size) = advertised.filter(|size| *size > self.shared.max_patch_bytes) {
                return Err(LauncherError::PatchSizeAnomaly {
                    version,
                    size,
                    limit: self.shared.max_patch_bytes,
                });
            }
        }

        let artifact = ArtifactFile {
            path: self
                .shared
                .artifacts_dir
                .join(format!("{}-{}.pwr", branch, version)),
        };
        let progress = &self.progress;
        let on_bytes = |done: u64, total: Option<u64>| {
            let total = total.or(advertised).unwrap_or(0);
            let fraction = if total > 0 {
                done as f64 / total as f64
            } else {
                0.0
            };
            progress.report_bytes(
                ProgressStage::Download,
                within(download, fraction),
                format!("Downloading version {version}"),
                done,
                total,
            );
        };
        self.shared
            .deps
            .transport
            .download(&url, &artifact.path, &on_bytes, &self.cancel)
            .await?;

        let on_percent = |percent: u8| {
            progress.report(
                ProgressStage::Apply,
                within(apply, f64::from(percent) / 100.0),
                format!("Applying version {version}"),
            );
        };
        self.shared
            .deps
            .patch_tool
            .apply_diff(&artifact.path, dir, &on_percent, &self.cancel)
            .await
    }

    async fn launch(
        &self,
        prepared: Prepared,
        slot: &mut Option<SlotGuard>,
    ) -> Result<LaunchedGame> {
        self.set_state(OperationState::VerifyingRuntime);
        let progress = &self.progress;
        progress.report(ProgressStage::Runtime, RUNTIME_RANGE.0, "Verifying runtime");
        let on_percent = |percent: u8| {
            progress.report(
                ProgressStage::Runtime,
                within(RUNTIME_RANGE, f64::from(percent) / 100.0),
                "Preparing Java runtime",
            );
        };
        let java = self
            .shared
            .deps
            .runtime
            .ensure_runtime(&on_percent, &self.cancel)
            .await?;
        self.check_cancelled()?;

        self.set_state(OperationState::Launching);
        progress.report(ProgressStage::Launch, LAUNCH_START, "Launching game");
        let instances = &self.shared.instances;
        let session = GameSession {
            session_id: Uuid::new_v4().to_string(),
            display_name: self.request.display_name.clone(),
            branch: self.request.branch,
            version: prepared.version,
            instance_dir: prepared.dir.clone(),
            user_data_dir: instances.user_data_dir(&prepared.dir),
        };
        tokio::fs::create_dir_all(&session.user_data_dir).await?;
        if let Err(err) = self.shared.deps.hooks.before_launch(&session).await {
            tracing::warn!("before-launch hook failed: {}", err);
        }

        let command = build_launch_command(instances, &prepared.dir, &java, &self.request);
        self.check_cancelled()?;
        let SpawnedGame { pid, exit, kill } = self.shared.deps.spawner.spawn(&command)?;
        self.shared.games.register(
            RunningGame {
                session_id: session.session_id.clone(),
                display_name: session.display_name.clone(),
                branch: session.branch,
                version: session.version,
                pid,
                started_at: chrono::Utc::now().timestamp(),
                instance_dir: session.instance_dir.clone(),
            },
            kill,
        )?;
        tracing::info!(
            "client started pid={} dir={}",
            pid,
            prepared.dir.display()
        );
        self.shared.emit(LauncherEvent::State {
            state: GameState::Started,
            exit_code: None,
        });
        self.set_state(OperationState::Running);
        progress.report(ProgressStage::Launch, 100.0, "Game started");

        let shared = self.shared.clone();
        let status = self.status.clone();
        let guard = slot.take();
        tokio::spawn(async move {
            let exit_code = exit.await;
            shared.games.take_if_pid_matches(pid);
            tracing::info!("client exited pid={} code={:?}", pid, exit_code);
            shared.emit(LauncherEvent::State {
                state: GameState::Stopped,
                exit_code,
            });
            shared.deps.hooks.after_exit(&session, exit_code).await;
            drop(guard);
            status.send_replace(OperationState::Stopped);
        });

        Ok(LaunchedGame {
            pid,
            instance_dir: prepared.dir,
            version: prepared.version,
        })
    }
}

pub fn build_launch_command(
    instances: &InstanceRepository,
    instance_dir: &Path,
    java: &Path,
    request: &LaunchRequest,
) -> LaunchCommand {
    let mut args = vec![
        "--app-dir".to_string(),
        instance_dir.join(CLIENT_DIR).display().to_string(),
        "--user-dir".to_string(),
        instances.user_data_dir(instance_dir).display().to_string(),
        "--java-exec".to_string(),
        java.display().to_string(),
        "--name".to_string(),
        request.display_name.clone(),
    ];
    match &request.identity.auth {
        AuthMode::Offline => {
            args.extend([
                "--auth-mode".to_string(),
                "offline".to_string(),
                "--uuid".to_string(),
                request.identity.uuid.clone(),
            ]);
        }
        AuthMode::Authenticated {
            identity_token,
            session_token,
        } => {
            args.extend([
                "--auth-mode".to_string(),
                "authenticated".to_string(),
                "--uuid".to_string(),
                request.identity.uuid.clone(),
                "--identity-token".to_string(),
                identity_token.clone(),
                "--session-token".to_string(),
                session_token.clone(),
            ]);
        }
    }

    LaunchCommand {
        program: instances.client_executable(instance_dir),
        args,
        working_dir: instance_dir.to_path_buf(),
    }
}
