//! HTTP route handlers mirroring the `crew wt` verbs.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use crew::io::worktree::{CreateWorktree, GcReport, ReconcileReport, WorktreeState};
use serde::Deserialize;
use tracing::info;

use crate::error::ApiError;
use crate::sse;
use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/worktrees", get(list_worktrees).post(create_worktree))
        .route("/worktrees/events", get(sse::events_handler))
        .route("/worktrees/gc", post(gc_worktrees))
        .route("/worktrees/repair", post(repair_worktrees))
        .route("/worktrees/{id}", delete(remove_worktree))
        .route("/worktrees/{id}/lock", post(lock_worktree))
        .route("/worktrees/{id}/unlock", post(unlock_worktree))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub run_id: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default = "default_base")]
    pub base: String,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub no_checkout: bool,
    #[serde(default)]
    pub lock: bool,
    #[serde(default)]
    pub lock_reason: Option<String>,
}

fn default_base() -> String {
    "HEAD".to_string()
}

impl From<CreateBody> for CreateWorktree {
    fn from(body: CreateBody) -> Self {
        CreateWorktree {
            run_id: body.run_id,
            task: body.task,
            base: body.base,
            detach: body.detach,
            no_checkout: body.no_checkout,
            lock: body.lock || body.lock_reason.is_some(),
            lock_reason: body.lock_reason,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LockBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GcBody {
    #[serde(default)]
    pub expire: Option<String>,
}

/// GET /api/worktrees
async fn list_worktrees(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorktreeState>>, ApiError> {
    state.blocking(|m| m.list()).await.map(Json)
}

/// POST /api/worktrees
async fn create_worktree(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<WorktreeState>), ApiError> {
    let req = CreateWorktree::from(body);
    let created = state.blocking(move |m| m.create(req)).await?;
    info!(id = %created.id, "worktree created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /api/worktrees/{id}?force=
async fn remove_worktree(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<WorktreeState>, ApiError> {
    state
        .blocking(move |m| m.remove(&id, query.force))
        .await
        .map(Json)
}

/// POST /api/worktrees/{id}/lock
async fn lock_worktree(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<LockBody>>,
) -> Result<Json<WorktreeState>, ApiError> {
    let reason = body.and_then(|Json(body)| body.reason);
    state.blocking(move |m| m.lock(&id, reason)).await.map(Json)
}

/// POST /api/worktrees/{id}/unlock
async fn unlock_worktree(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorktreeState>, ApiError> {
    state.blocking(move |m| m.unlock(&id)).await.map(Json)
}

/// POST /api/worktrees/gc
async fn gc_worktrees(
    State(state): State<AppState>,
    body: Option<Json<GcBody>>,
) -> Result<Json<GcReport>, ApiError> {
    let expire = body.and_then(|Json(body)| body.expire);
    state
        .blocking(move |m| m.gc(expire.as_deref()))
        .await
        .map(Json)
}

/// POST /api/worktrees/repair
async fn repair_worktrees(
    State(state): State<AppState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    state.blocking(|m| m.repair()).await.map(Json)
}

#[cfg(test)]
mod tests {
    use crew::test_support::TestRepo;

    use super::*;

    fn app_state(repo: &TestRepo, max: usize) -> AppState {
        AppState::new(repo.manager(max).expect("manager"))
    }

    fn body(run_id: &str) -> CreateBody {
        serde_json::from_value(serde_json::json!({
            "run_id": run_id,
            "task": "api task",
            "base": "base",
        }))
        .expect("body")
    }

    #[test]
    fn create_body_defaults() {
        let body: CreateBody =
            serde_json::from_str(r#"{"run_id":"r1","lock_reason":"hold"}"#).expect("parse");
        let req = CreateWorktree::from(body);
        assert_eq!(req.base, "HEAD");
        assert!(req.lock);
        assert!(!req.detach);
    }

    #[tokio::test]
    async fn create_list_lock_remove() {
        let repo = TestRepo::new().expect("repo");
        let state = app_state(&repo, 4);

        let (status, Json(created)) = create_worktree(State(state.clone()), Json(body("run-1")))
            .await
            .expect("create");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.id, "wt-run-1-api-task");

        let Json(listed) = list_worktrees(State(state.clone())).await.expect("list");
        assert_eq!(listed.len(), 1);

        let Json(locked) = lock_worktree(
            State(state.clone()),
            Path("run-1".to_string()),
            Some(Json(LockBody {
                reason: Some("review".to_string()),
            })),
        )
        .await
        .expect("lock");
        assert_eq!(locked.lock_reason.as_deref(), Some("review"));

        let err = remove_worktree(
            State(state.clone()),
            Path("run-1".to_string()),
            Query(RemoveQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::LOCKED);

        unlock_worktree(State(state.clone()), Path("run-1".to_string()))
            .await
            .expect("unlock");
        remove_worktree(
            State(state.clone()),
            Path(created.id.clone()),
            Query(RemoveQuery::default()),
        )
        .await
        .expect("remove");
        assert!(!created.path.exists());
    }

    #[tokio::test]
    async fn policy_failures_become_client_errors() {
        let repo = TestRepo::new().expect("repo");
        let state = app_state(&repo, 1);
        create_worktree(State(state.clone()), Json(body("run-1")))
            .await
            .expect("create");

        let err = create_worktree(State(state.clone()), Json(body("run-2")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, "limit");

        let err = unlock_worktree(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = gc_worktrees(
            State(state),
            Some(Json(GcBody {
                expire: Some("whenever".to_string()),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gc_and_repair_report() {
        let repo = TestRepo::new().expect("repo");
        let state = app_state(&repo, 2);
        create_worktree(State(state.clone()), Json(body("run-1")))
            .await
            .expect("create");

        let Json(report) = gc_worktrees(State(state.clone()), None).await.expect("gc");
        assert!(report.removed.is_empty());
        assert_eq!(report.expire, "14d");

        let Json(report) = repair_worktrees(State(state)).await.expect("repair");
        assert!(report.restored.is_empty());
        assert!(report.orphaned.is_empty());
    }
}
