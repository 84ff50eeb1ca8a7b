//! Stable exit codes for flow CLI commands.

use crate::core::frontmatter::FrontmatterError;
use crate::core::generated::GenerationError;
use crate::core::graph::GraphError;
use crate::core::job::JobError;
use crate::core::naming::NameError;
use crate::core::rename::RenameError;
use crate::dispatch::DispatchError;
use crate::lifecycle::GateError;
use crate::rebase::RebaseError;

/// Command succeeded.
pub const OK: i32 = 0;
/// Execution failure or any error without a more specific code.
pub const FAILED: i32 = 1;
/// Malformed job documents, cycles, missing dependencies, bad names.
pub const STRUCTURAL: i32 = 2;
/// A job was not runnable: unmet dependency, missing worktree, stopped container.
pub const PRECONDITION: i32 = 3;
/// Finish refused until the plan has been reviewed.
pub const GATED: i32 = 4;
/// A rebase stopped on conflicts or found nothing to resume.
pub const CONFLICT: i32 = 5;

/// Exit code for an error returned by a command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<DispatchError>() {
            return match err {
                DispatchError::GenerationParseFailed { .. } => STRUCTURAL,
                err if err.is_precondition() => PRECONDITION,
                _ => FAILED,
            };
        }
        if cause.is::<GateError>() {
            return GATED;
        }
        if let Some(err) = cause.downcast_ref::<RebaseError>() {
            return match err {
                RebaseError::Conflicts { .. } | RebaseError::NoRebaseInProgress => CONFLICT,
                RebaseError::InvalidTarget { .. } => STRUCTURAL,
                RebaseError::Dirty { .. } | RebaseError::AlreadyInProgress { .. } => PRECONDITION,
                RebaseError::Partial { .. } => FAILED,
            };
        }
        if cause.is::<JobError>()
            || cause.is::<GraphError>()
            || cause.is::<FrontmatterError>()
            || cause.is::<GenerationError>()
            || cause.is::<NameError>()
            || cause.is::<RenameError>()
        {
            return STRUCTURAL;
        }
    }
    FAILED
}
