use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::Branch;

/// What collaborators get to see about a game session.
#[derive(Clone, Debug)]
pub struct GameSession {
    pub session_id: String,
    pub display_name: String,
    pub branch: Branch,
    pub version: Option<u32>,
    pub instance_dir: PathBuf,
    pub user_data_dir: PathBuf,
}

/// Extension points around the client process, e.g. save backup and restore.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn before_launch(&self, _session: &GameSession) -> Result<()> {
        Ok(())
    }

    async fn after_exit(&self, _session: &GameSession, _exit_code: Option<i32>) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSessionHooks;

impl SessionHooks for NoopSessionHooks {}
