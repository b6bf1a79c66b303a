pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::LauncherConfig;
pub use errors::{ErrorKind, LauncherError, Result};
pub use services::{OperationHandle, OrchestratorDeps, UpdateOrchestrator};
