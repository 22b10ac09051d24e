//! Stable exit codes for crew CLI commands.

use crate::error::WorktreeError;

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, config, or an unexpected failure.
pub const INVALID: i32 = 1;
/// No managed worktree matches the given id or run id.
pub const NOT_FOUND: i32 = 2;
/// The worktree, run or branch already exists.
pub const CONFLICT: i32 = 3;
/// Refused by policy (protected base, force without opt-in).
pub const FORBIDDEN: i32 = 4;
/// Worktree concurrency limit reached.
pub const LIMIT: i32 = 5;
/// Worktree is locked.
pub const LOCKED: i32 = 6;
/// `crew exec` finished with an error event.
pub const RUN_FAILED: i32 = 7;
/// `crew exec` was interrupted.
pub const CANCELLED: i32 = 130;

pub fn for_worktree_error(err: &WorktreeError) -> i32 {
    match err {
        WorktreeError::NotFound(_) => NOT_FOUND,
        WorktreeError::Conflict(_) => CONFLICT,
        WorktreeError::Forbidden(_) => FORBIDDEN,
        WorktreeError::Limit { .. } => LIMIT,
        WorktreeError::Locked { .. } => LOCKED,
        WorktreeError::Invalid(_) | WorktreeError::Other(_) => INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_errors_have_distinct_codes() {
        let codes = [
            for_worktree_error(&WorktreeError::NotFound("x".into())),
            for_worktree_error(&WorktreeError::Conflict("x".into())),
            for_worktree_error(&WorktreeError::Forbidden("x".into())),
            for_worktree_error(&WorktreeError::Limit { max: 1 }),
            for_worktree_error(&WorktreeError::Locked {
                id: "x".into(),
                reason: None,
            }),
        ];
        assert_eq!(codes, [NOT_FOUND, CONFLICT, FORBIDDEN, LIMIT, LOCKED]);
        assert_eq!(
            for_worktree_error(&WorktreeError::Invalid("x".into())),
            INVALID
        );
    }
}
