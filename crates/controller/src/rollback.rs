//! Fatal-error handling and commit rollback.
//!
//! Errors detected before the per-host fan-out abort the run. When the
//! controller was started by a Git hook, the branch reference is moved back
//! to the parent commit first (the working tree is untouched), so the
//! repository's HEAD keeps reflecting what is actually deployed.

use drover_platform::{DroverError, DroverResult};
use git2::Repository;
use std::path::Path;

/// Moves the current branch reference one commit back.
///
/// Equivalent to a soft reset: the working tree and index stay as they
/// are. Fails when HEAD has no parent or is not a branch.
pub fn rollback_head(repo_path: &Path) -> DroverResult<()> {
    let repo = Repository::open(repo_path)
        .map_err(|e| DroverError::Git(format!("failed to open repository: {}", e)))?;

    let head = repo
        .head()
        .map_err(|e| DroverError::Git(format!("failed to get branch name from HEAD: {}", e)))?;
    let refname = head
        .name()
        .map(str::to_string)
        .ok_or_else(|| DroverError::Git("HEAD reference has no usable name".to_string()))?;

    let commit = head
        .peel_to_commit()
        .map_err(|e| DroverError::Git(format!("failed to get HEAD commit: {}", e)))?;
    if commit.parent_count() == 0 {
        return Err(DroverError::Git(
            "HEAD does not have a previous commit".to_string(),
        ));
    }
    let parent = commit
        .parent(0)
        .map_err(|e| DroverError::Git(format!("failed to get previous commit: {}", e)))?;

    repo.reference(
        &refname,
        parent.id(),
        true,
        "rollback after failed deployment",
    )
    .map_err(|e| {
        DroverError::Git(format!(
            "failed to roll back current commit to previous commit: {}",
            e
        ))
    })?;

    Ok(())
}

/// Prints a fatal error, optionally rolls the commit back, and exits 1.
pub fn fatal(
    description: &str,
    error: &DroverError,
    rollback_requested: bool,
    repo_path: Option<&Path>,
) -> ! {
    eprintln!("\n{}: {}", description, error);

    if rollback_requested {
        if let Some(repo_path) = repo_path {
            eprintln!("WARNING: Removing current repository commit due to processing error.");
            eprintln!("         Working directory is **NOT** affected.");

            match rollback_head(repo_path) {
                Ok(()) => eprintln!(
                    "Please fix the above error then `git add` and `git commit` to restart deployment."
                ),
                Err(rollback_error) => eprintln!("Error rolling back commit: {}", rollback_error),
            }
        }
    }

    std::process::exit(1);
}
