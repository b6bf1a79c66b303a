pub mod game_runtime_service;
pub mod instance_repository;
pub mod orchestrator;
pub mod patch_tool;
pub mod runtime_service;
pub mod session_hooks;
pub mod transfer;
pub mod version_resolver;

pub use game_runtime_service::{
    GameRuntimeService, LaunchCommand, ProcessSpawner, RunningGame, SpawnedGame,
    TokioProcessSpawner,
};
pub use instance_repository::{InstanceLayout, InstanceRepository};
pub use orchestrator::{OperationHandle, OrchestratorDeps, UpdateOrchestrator};
pub use patch_tool::{DiffApplier, PatchToolManager};
pub use runtime_service::{RuntimeProvisioner, RuntimeService};
pub use session_hooks::{GameSession, NoopSessionHooks, SessionHooks};
pub use transfer::{ArtifactTransport, HttpTransfer, ProbeResult};
pub use version_resolver::{get_patch_sequence, VersionResolver};
