//! Host/file filtering.
//!
//! Applies the universal-layout precedence rules to a raw scan and produces
//! the deployment plan: which endpoints get contacted and which files each
//! one receives, deduplicated against host-specific shadows.
//!
//! Precedence: host-specific > group-universal > global-universal. A host
//! that carries its own copy of a universal file never receives the
//! universal one.

use crate::config::{Config, HostState, ResolvedEndpoint};
use crate::scanner::{override_allows, Action, CommitScan};
use drover_platform::{DroverError, DroverResult};
use git2::{ObjectType, Tree, TreeWalkMode, TreeWalkResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Everything one endpoint receives this run, in deployment order.
#[derive(Debug, Clone)]
pub struct HostDeployment {
    /// Resolved connection parameters.
    pub endpoint: ResolvedEndpoint,
    /// Repository paths scheduled for this host.
    pub files: Vec<String>,
}

/// The filtered deployment set.
#[derive(Debug, Default)]
pub struct DeploymentPlan {
    /// Per-host work lists; hosts with nothing to do are absent.
    pub hosts: Vec<HostDeployment>,
    /// Deduplicated union of every scheduled path and its action.
    pub all_files: BTreeMap<String, Action>,
}

/// Filters the scan down to per-host deployment lists.
///
/// Hosts outside the `--hosts` override or marked offline are dropped
/// before any trust or connection work happens.
pub fn filter_hosts_and_files(
    tree: &Tree<'_>,
    scan: &CommitScan,
    config: &Config,
    host_override: Option<&str>,
) -> DroverResult<DeploymentPlan> {
    let repo_map = map_repo_files(tree)?;

    let mut plan = DeploymentPlan::default();

    let mut names: Vec<&String> = config.endpoints.keys().collect();
    names.sort();

    for name in names {
        let endpoint_config = &config.endpoints[name];

        if !override_allows(host_override, name) {
            debug!("host {} not requested", name);
            continue;
        }
        if endpoint_config.state == HostState::Offline {
            debug!("host {} is marked as offline, skipping", name);
            continue;
        }

        let denied = denied_universal_files(name, config, &repo_map);

        let mut files = Vec::new();
        for (path, action) in &scan.files {
            let Some((commit_host, _)) = path.split_once('/') else {
                continue;
            };

            let group_members = config.universal_groups.get(commit_host);

            // The file must be local to this host, globally universal, or
            // in a universal group this host belongs to.
            if commit_host != name
                && commit_host != config.universal_directory
                && group_members.is_none()
            {
                continue;
            }
            if let Some(members) = group_members {
                if !members.iter().any(|member| member == name) {
                    continue;
                }
            }
            if endpoint_config.ignore_universal_confs && commit_host == config.universal_directory
            {
                continue;
            }
            if denied.contains(path) {
                debug!("host {} shadows universal file {}", name, path);
                continue;
            }

            plan.all_files.insert(path.clone(), action.clone());
            files.push(path.clone());
        }

        if files.is_empty() {
            continue;
        }

        plan.hosts.push(HostDeployment {
            endpoint: config.resolve_endpoint(name)?,
            files,
        });
    }

    Ok(plan)
}

/// Maps every top-level directory of the tree to its relative sub-paths.
fn map_repo_files(tree: &Tree<'_>) -> DroverResult<BTreeMap<String, BTreeSet<String>>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() != Some(ObjectType::Blob) {
            return TreeWalkResult::Ok;
        }
        let Some(name) = entry.name() else {
            return TreeWalkResult::Ok;
        };
        let path = format!("{}{}", root, name);
        if let Some((first, rest)) = path.split_once('/') {
            if !rest.is_empty() {
                map.entry(first.to_string())
                    .or_default()
                    .insert(rest.to_string());
            }
        }
        TreeWalkResult::Ok
    })
    .map_err(|e| DroverError::Git(format!("failed mapping repository files: {}", e)))?;

    Ok(map)
}

/// Universal files this endpoint must not receive because it carries its
/// own copy at the same relative sub-path.
fn denied_universal_files(
    endpoint: &str,
    config: &Config,
    repo_map: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    let empty = BTreeSet::new();
    let host_files = repo_map.get(endpoint).unwrap_or(&empty);

    let mut denied = BTreeSet::new();

    if let Some(universal_files) = repo_map.get(&config.universal_directory) {
        for sub_path in universal_files {
            if host_files.contains(sub_path) {
                denied.insert(format!("{}/{}", config.universal_directory, sub_path));
            }
        }
    }

    for (group, members) in &config.universal_groups {
        if !members.iter().any(|member| member == endpoint) {
            continue;
        }
        if let Some(group_files) = repo_map.get(group) {
            for sub_path in group_files {
                if host_files.contains(sub_path) {
                    denied.insert(format!("{}/{}", group, sub_path));
                }
            }
        }
    }

    denied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::test_support::*;
    use crate::scanner::scan_tree;

    fn plan_for(
        dir: &tempfile::TempDir,
        host_override: Option<&str>,
    ) -> DeploymentPlan {
        let repo = git2::Repository::open(dir.path()).unwrap();
        let config = test_config();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let tree = head.tree().unwrap();
        let scan = scan_tree(&repo, &tree, &config, None).unwrap();
        filter_hosts_and_files(&tree, &scan, &config, host_override).unwrap()
    }

    fn files_for<'a>(plan: &'a DeploymentPlan, host: &str) -> Option<&'a Vec<String>> {
        plan.hosts
            .iter()
            .find(|h| h.endpoint.name == host)
            .map(|h| &h.files)
    }

    #[test]
    fn test_universal_override_shadowing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        write_file(dir.path(), "UniversalConfs/etc/ssh/sshd_config", "universal\n");
        write_file(dir.path(), "hostA/etc/ssh/sshd_config", "host specific\n");
        write_file(dir.path(), "hostB/etc/motd", "motd\n");
        commit_all(&repo, "seed");

        let plan = plan_for(&dir, None);

        // hostA carries its own sshd_config: the universal copy is denied.
        let host_a = files_for(&plan, "hostA").unwrap();
        assert!(host_a.contains(&"hostA/etc/ssh/sshd_config".to_string()));
        assert!(!host_a.contains(&"UniversalConfs/etc/ssh/sshd_config".to_string()));

        // hostB gets its own file plus the universal one.
        let host_b = files_for(&plan, "hostB").unwrap();
        assert!(host_b.contains(&"hostB/etc/motd".to_string()));
        assert!(host_b.contains(&"UniversalConfs/etc/ssh/sshd_config".to_string()));
    }

    #[test]
    fn test_offline_host_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        write_file(dir.path(), "hostC/etc/app.conf", "offline host\n");
        write_file(dir.path(), "hostA/etc/app.conf", "online host\n");
        commit_all(&repo, "seed");

        let plan = plan_for(&dir, None);

        assert!(files_for(&plan, "hostC").is_none());
        assert!(files_for(&plan, "hostA").is_some());
    }

    #[test]
    fn test_group_files_only_for_members() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        // hostA is in UniversalConfs_Web; hostB is not.
        write_file(dir.path(), "UniversalConfs_Web/etc/nginx.conf", "group file\n");
        write_file(dir.path(), "hostB/etc/motd", "motd\n");
        commit_all(&repo, "seed");

        let plan = plan_for(&dir, None);

        let host_a = files_for(&plan, "hostA").unwrap();
        assert!(host_a.contains(&"UniversalConfs_Web/etc/nginx.conf".to_string()));

        let host_b = files_for(&plan, "hostB").unwrap();
        assert!(!host_b.contains(&"UniversalConfs_Web/etc/nginx.conf".to_string()));
    }

    #[test]
    fn test_ignore_universal_confs() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        let mut config = test_config();
        config
            .endpoints
            .get_mut("hostB")
            .unwrap()
            .ignore_universal_confs = true;

        write_file(dir.path(), "UniversalConfs/etc/motd", "motd\n");
        write_file(dir.path(), "hostB/etc/app.conf", "app\n");
        commit_all(&repo, "seed");

        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let tree = head.tree().unwrap();
        let scan = scan_tree(&repo, &tree, &config, None).unwrap();
        let plan = filter_hosts_and_files(&tree, &scan, &config, None).unwrap();

        let host_b = files_for(&plan, "hostB").unwrap();
        assert_eq!(host_b, &vec!["hostB/etc/app.conf".to_string()]);

        // hostA still receives the universal file.
        let host_a = files_for(&plan, "hostA").unwrap();
        assert!(host_a.contains(&"UniversalConfs/etc/motd".to_string()));
    }

    #[test]
    fn test_host_override_limits_plan() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        write_file(dir.path(), "hostA/etc/a", "a\n");
        write_file(dir.path(), "hostB/etc/b", "b\n");
        commit_all(&repo, "seed");

        let plan = plan_for(&dir, Some("hostB"));

        assert!(files_for(&plan, "hostA").is_none());
        assert!(files_for(&plan, "hostB").is_some());
    }

    #[test]
    fn test_all_files_deduplicated_union() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());

        // Universal file reaching both hosts appears once in the union.
        write_file(dir.path(), "UniversalConfs/etc/motd", "motd\n");
        write_file(dir.path(), "hostA/etc/a", "a\n");
        commit_all(&repo, "seed");

        let plan = plan_for(&dir, None);

        assert_eq!(
            plan.all_files.keys().cloned().collect::<Vec<_>>(),
            vec![
                "UniversalConfs/etc/motd".to_string(),
                "hostA/etc/a".to_string()
            ]
        );
    }
}
