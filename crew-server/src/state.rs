//! Shared application state for the worktree server.

use std::sync::Arc;

use crew::error::WorktreeError;
use crew::io::worktree::WorktreeManager;

use crate::error::ApiError;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WorktreeManager>,
}

impl AppState {
    pub fn new(manager: WorktreeManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// Run a manager operation on the blocking pool; it shells out to git.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(&WorktreeManager) -> Result<T, WorktreeError> + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || op(&manager))
            .await
            .map_err(|err| ApiError::internal(format!("worktree task failed: {err}")))?
            .map_err(ApiError::from)
    }
}
