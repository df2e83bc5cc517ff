//! Repository scanner.
//!
//! Turns a commit (or a whole tree) into the raw deployment intent: a map
//! of repository paths to [`Action`] plus the set of endpoint directories
//! the commit touched. Only paths whose first component names a configured
//! endpoint, the universal directory, or a universal group survive;
//! everything else in the repository (trackers, documentation, stray root
//! files) is skipped here.

use crate::config::Config;
use drover_platform::{DroverError, DroverResult};
use git2::{Commit, Delta, DiffFindOptions, FileMode, ObjectType, Repository, Tree, TreeWalkMode, TreeWalkResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// What deployment does with one repository file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transfer and place the file.
    Create,
    /// Remove the file from the endpoint.
    Delete,
    /// Recreate a symbolic link on the endpoint.
    SymlinkCreate {
        /// Absolute target path on the endpoint.
        target: String,
    },
    /// Change shape the pipeline refuses to touch.
    Unsupported,
}

/// Raw scan result: per-path actions and the endpoint directories involved.
#[derive(Debug, Default)]
pub struct CommitScan {
    /// Repository path (always `/`-separated) to action.
    pub files: BTreeMap<String, Action>,
    /// Configured endpoints whose directories the scan touched.
    pub hosts: BTreeSet<String>,
}

/// Whether `candidate` survives a comma-separated override list.
///
/// An empty or missing list keeps everything; otherwise at least one entry
/// must match.
pub fn override_allows(override_csv: Option<&str>, candidate: &str) -> bool {
    match override_csv {
        None => true,
        Some(csv) if csv.is_empty() => true,
        Some(csv) => csv.split(',').any(|item| item.trim() == candidate),
    }
}

/// Validation verdict for one side of a file patch.
enum SideCheck {
    /// First component names an endpoint or universal directory.
    Valid(String),
    /// Not deployable (root file, unknown directory); skip the patch.
    Skip,
    /// The side does not exist in this delta.
    Absent,
}

fn validate_commit_path(config: &Config, path: Option<&str>) -> SideCheck {
    let Some(path) = path else {
        return SideCheck::Absent;
    };

    // Root-level files (failure tracker and friends) are repo metadata.
    let Some((first, rest)) = path.split_once('/') else {
        return SideCheck::Skip;
    };
    if rest.is_empty() {
        return SideCheck::Skip;
    }

    if config.endpoints.contains_key(first) || config.is_universal(first) {
        SideCheck::Valid(first.to_string())
    } else {
        SideCheck::Skip
    }
}

/// Scans the difference between `commit` and its parent.
///
/// Classification per file patch:
/// - added -> `create`
/// - deleted -> `delete`
/// - renamed -> `create` at the destination, `delete` at the source
/// - copied / edited in place -> `create`
/// - anything else -> `unsupported`
///
/// A committed symbolic link with a `create` action is resolved to its
/// target inside the repository; failure to resolve is fatal.
pub fn scan_commit(
    repo: &Repository,
    commit: &Commit<'_>,
    config: &Config,
    file_override: Option<&str>,
) -> DroverResult<CommitScan> {
    let parent = commit
        .parent(0)
        .map_err(|e| DroverError::Git(format!("failed retrieving parent commit: {}", e)))?;
    let old_tree = parent
        .tree()
        .map_err(|e| DroverError::Git(format!("failed retrieving parent tree: {}", e)))?;
    let new_tree = commit
        .tree()
        .map_err(|e| DroverError::Git(format!("failed retrieving commit tree: {}", e)))?;

    let mut diff = repo
        .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)
        .map_err(|e| {
            DroverError::Git(format!("failed retrieving difference between commits: {}", e))
        })?;

    let mut find = DiffFindOptions::new();
    find.renames(true).copies(true);
    diff.find_similar(Some(&mut find))
        .map_err(|e| DroverError::Git(format!("failed resolving renames: {}", e)))?;

    let mut scan = CommitScan::default();

    for delta in diff.deltas() {
        let old_path = delta
            .old_file()
            .path()
            .and_then(Path::to_str)
            .map(str::to_string);
        let new_path = delta
            .new_file()
            .path()
            .and_then(Path::to_str)
            .map(str::to_string);

        let old_check = validate_commit_path(config, old_path.as_deref());
        let new_check = validate_commit_path(config, new_path.as_deref());
        if matches!(old_check, SideCheck::Skip) || matches!(new_check, SideCheck::Skip) {
            continue;
        }
        // Universal directories are not endpoints; the host set only ever
        // holds names deployment could dial.
        for check in [&old_check, &new_check] {
            if let SideCheck::Valid(host) = check {
                if config.endpoints.contains_key(host) {
                    scan.hosts.insert(host.clone());
                }
            }
        }

        // Keep iff at least one override entry matches either side.
        if file_override.is_some_and(|csv| !csv.is_empty()) {
            let requested = old_path
                .iter()
                .chain(new_path.iter())
                .any(|path| override_allows(file_override, path));
            if !requested {
                continue;
            }
        }

        debug!(
            "classifying {:?} -> {:?} ({:?})",
            old_path,
            new_path,
            delta.status()
        );

        match delta.status() {
            Delta::Added => {
                if let Some(path) = new_path.clone() {
                    scan.files.insert(path, Action::Create);
                }
            }
            Delta::Deleted => {
                if let Some(path) = old_path.clone() {
                    scan.files.insert(path, Action::Delete);
                }
            }
            Delta::Modified | Delta::Typechange => {
                if let Some(path) = new_path.clone() {
                    scan.files.insert(path, Action::Create);
                }
            }
            Delta::Renamed => {
                // The source is gone from the new tree; the destination is
                // new content to place.
                if let Some(path) = old_path.clone() {
                    scan.files.insert(path, Action::Delete);
                }
                if let Some(path) = new_path.clone() {
                    scan.files.insert(path, Action::Create);
                }
            }
            Delta::Copied => {
                if let Some(path) = new_path.clone() {
                    scan.files.insert(path, Action::Create);
                }
            }
            _ => {
                if let Some(path) = new_path.clone().or_else(|| old_path.clone()) {
                    scan.files.insert(path, Action::Unsupported);
                }
            }
        }

        // Committed symbolic links deploy as links, not content.
        if matches!(delta.new_file().mode(), FileMode::Link) {
            if let Some(path) = new_path {
                if scan.files.get(&path) == Some(&Action::Create) {
                    let target = resolve_link_target(repo, &new_tree, &path)?;
                    scan.files.insert(path, Action::SymlinkCreate { target });
                }
            }
        }
    }

    Ok(scan)
}

/// Scans every file of `tree`, marking everything `create` (or
/// `symlinkcreate` for committed links).
///
/// Used for unchanged-file redeployment and failure-tracker replays that
/// need the full tree rather than a diff.
pub fn scan_tree(
    repo: &Repository,
    tree: &Tree<'_>,
    config: &Config,
    file_override: Option<&str>,
) -> DroverResult<CommitScan> {
    let mut scan = CommitScan::default();
    let mut walk_error: Option<DroverError> = None;

    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() != Some(ObjectType::Blob) {
            return TreeWalkResult::Ok;
        }
        let Some(name) = entry.name() else {
            return TreeWalkResult::Ok;
        };
        let path = format!("{}{}", root, name);

        let host = match validate_commit_path(config, Some(&path)) {
            SideCheck::Valid(host) => host,
            _ => return TreeWalkResult::Ok,
        };

        if !override_allows(file_override, &path) {
            return TreeWalkResult::Ok;
        }

        let action = if entry.filemode() == i32::from(FileMode::Link) {
            match resolve_link_target(repo, tree, &path) {
                Ok(target) => Action::SymlinkCreate { target },
                Err(err) => {
                    walk_error = Some(err);
                    return TreeWalkResult::Abort;
                }
            }
        } else {
            Action::Create
        };

        scan.files.insert(path, action);
        if config.endpoints.contains_key(&host) {
            scan.hosts.insert(host);
        }
        TreeWalkResult::Ok
    })
    .map_err(|e| DroverError::Git(format!("failed walking repository tree: {}", e)))?;

    if let Some(err) = walk_error {
        return Err(err);
    }

    Ok(scan)
}

/// Resolves a committed symbolic link to the absolute path it must point at
/// on the endpoint.
///
/// The link target is read from the blob, joined onto the link's directory,
/// and normalized. Targets that leave the repository or land outside a
/// top-level directory are fatal.
fn resolve_link_target(
    repo: &Repository,
    tree: &Tree<'_>,
    link_path: &str,
) -> DroverResult<String> {
    let entry = tree.get_path(Path::new(link_path)).map_err(|e| {
        DroverError::SymlinkResolve(format!("{}: {}", link_path, e))
    })?;
    let blob = repo.find_blob(entry.id()).map_err(|e| {
        DroverError::SymlinkResolve(format!("{}: {}", link_path, e))
    })?;
    let target = std::str::from_utf8(blob.content())
        .map_err(|_| {
            DroverError::SymlinkResolve(format!("{}: target is not valid UTF-8", link_path))
        })?
        .trim();

    if target.is_empty() {
        return Err(DroverError::SymlinkResolve(format!(
            "{}: empty link target",
            link_path
        )));
    }
    if target.starts_with('/') {
        return Err(DroverError::SymlinkResolve(format!(
            "{}: target '{}' does not lie inside the repository",
            link_path, target
        )));
    }

    // Normalize relative to the link's directory.
    let mut stack: Vec<&str> = match link_path.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(DroverError::SymlinkResolve(format!(
                        "{}: target '{}' does not lie inside the repository",
                        link_path, target
                    )));
                }
            }
            normal => stack.push(normal),
        }
    }

    // The resolved path must stay below a host or universal directory for a
    // remote path to exist at all.
    if stack.len() < 2 {
        return Err(DroverError::SymlinkResolve(format!(
            "{}: target '{}' does not lie inside an endpoint directory",
            link_path, target
        )));
    }

    Ok(format!("/{}", stack[1..].join("/")))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_override_allows() {
        assert!(override_allows(None, "hostA/etc/a"));
        assert!(override_allows(Some(""), "hostA/etc/a"));
        assert!(override_allows(Some("hostA/etc/a,hostA/etc/b"), "hostA/etc/b"));
        assert!(!override_allows(Some("hostA/etc/a"), "hostA/etc/b"));
    }

    #[test]
    fn test_add_delete_rename_in_one_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let config = test_config();

        write_file(dir.path(), "hostA/etc/a", "alpha\n");
        write_file(dir.path(), "hostA/etc/b", "bravo contents that stay identical\n");
        commit_all(&repo, "seed");

        std::fs::remove_file(dir.path().join("hostA/etc/a")).unwrap();
        std::fs::rename(
            dir.path().join("hostA/etc/b"),
            dir.path().join("hostA/etc/b2"),
        )
        .unwrap();
        write_file(dir.path(), "hostA/etc/c", "charlie\n");
        let head = commit_all(&repo, "add delete rename");

        let commit = repo.find_commit(head).unwrap();
        let scan = scan_commit(&repo, &commit, &config, None).unwrap();

        assert_eq!(scan.files.get("hostA/etc/a"), Some(&Action::Delete));
        assert_eq!(scan.files.get("hostA/etc/b"), Some(&Action::Delete));
        assert_eq!(scan.files.get("hostA/etc/b2"), Some(&Action::Create));
        assert_eq!(scan.files.get("hostA/etc/c"), Some(&Action::Create));
        assert_eq!(scan.files.len(), 4);
        assert!(scan.hosts.contains("hostA"));
    }

    #[test]
    fn test_unknown_directory_and_root_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let config = test_config();

        write_file(dir.path(), "hostA/etc/a", "alpha\n");
        commit_all(&repo, "seed");

        write_file(dir.path(), "notahost/etc/x", "stray\n");
        write_file(dir.path(), ".failtracker.json", "commitid:abc\n");
        write_file(dir.path(), "hostA/etc/a", "alpha v2\n");
        let head = commit_all(&repo, "mixed");

        let commit = repo.find_commit(head).unwrap();
        let scan = scan_commit(&repo, &commit, &config, None).unwrap();

        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.files.get("hostA/etc/a"), Some(&Action::Create));
    }

    #[test]
    fn test_file_override_keeps_only_requested() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let config = test_config();

        write_file(dir.path(), "hostA/etc/a", "alpha\n");
        commit_all(&repo, "seed");

        write_file(dir.path(), "hostA/etc/a", "alpha v2\n");
        write_file(dir.path(), "hostA/etc/b", "bravo\n");
        let head = commit_all(&repo, "two changes");

        let commit = repo.find_commit(head).unwrap();
        let scan = scan_commit(&repo, &commit, &config, Some("hostA/etc/b")).unwrap();

        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.files.get("hostA/etc/b"), Some(&Action::Create));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let config = test_config();

        write_file(dir.path(), "hostA/etc/real.conf", "payload\n");
        commit_all(&repo, "seed");

        std::os::unix::fs::symlink("real.conf", dir.path().join("hostA/etc/link.conf")).unwrap();
        let head = commit_all(&repo, "add link");

        let commit = repo.find_commit(head).unwrap();
        let scan = scan_commit(&repo, &commit, &config, None).unwrap();

        assert_eq!(
            scan.files.get("hostA/etc/link.conf"),
            Some(&Action::SymlinkCreate {
                target: "/etc/real.conf".to_string()
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_repo_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let config = test_config();

        write_file(dir.path(), "hostA/etc/seed", "seed\n");
        commit_all(&repo, "seed");

        std::os::unix::fs::symlink(
            "../../../outside",
            dir.path().join("hostA/etc/escape.conf"),
        )
        .unwrap();
        let head = commit_all(&repo, "bad link");

        let commit = repo.find_commit(head).unwrap();
        let result = scan_commit(&repo, &commit, &config, None);
        assert!(matches!(result, Err(DroverError::SymlinkResolve(_))));
    }

    #[test]
    fn test_scan_tree_marks_everything_create() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let config = test_config();

        write_file(dir.path(), "hostA/etc/a", "alpha\n");
        write_file(dir.path(), "hostB/etc/b", "bravo\n");
        write_file(dir.path(), "UniversalConfs/etc/motd", "hello\n");
        write_file(dir.path(), "README.md", "docs\n");
        let head = commit_all(&repo, "seed");

        let commit = repo.find_commit(head).unwrap();
        let tree = commit.tree().unwrap();
        let scan = scan_tree(&repo, &tree, &config, None).unwrap();

        assert_eq!(scan.files.len(), 3);
        assert!(scan
            .files
            .values()
            .all(|action| matches!(action, Action::Create)));
        assert_eq!(
            scan.hosts,
            ["hostA", "hostB"].into_iter().map(String::from).collect()
        );
    }
}
