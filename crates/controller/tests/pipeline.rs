//! End-to-end pipeline scenarios against real repositories:
//! scan -> filter -> load, plus the failure-tracker replay loop.

use drover_controller::config::Config;
use drover_controller::failures::{FailureTracker, FAIL_TRACKER_FILE};
use drover_controller::filter::{filter_hosts_and_files, DeploymentPlan};
use drover_controller::loader::{load_files, METADATA_DELIMITER};
use drover_controller::scanner::{scan_commit, scan_tree, Action};
use git2::{Oid, Repository};
use std::path::Path;

const CONFIG: &str = r#"
Controller:
  RepositoryPath: /srv/configs
SSHClient:
  SSHIdentityFile: /srv/keys/id_ed25519
  KnownHostsFile: /srv/keys/known_hosts
  RemoteTransferBuffer: /tmp/.drover-buffer
  MaximumConcurrency: 4
UniversalDirectory: UniversalConfs
UniversalGroups:
  UniversalConfs_Web: [hostA]
VaultFilePath: /srv/keys/vault.db
DeployerEndpoints:
  hostA:
    Endpoint: 10.0.0.10
    EndpointPort: 22
    EndpointUser: deploy
  hostB:
    Endpoint: 10.0.0.11
    EndpointPort: 22
    EndpointUser: deploy
  hostC:
    Endpoint: 10.0.0.12
    EndpointPort: 22
    EndpointUser: deploy
    HostState: offline
"#;

fn test_config() -> Config {
    let config: Config = serde_yaml::from_str(CONFIG).unwrap();
    config.validate().unwrap();
    config
}

fn init_repo(dir: &Path) -> Repository {
    let repo = Repository::init(dir).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "drover-test").unwrap();
        config.set_str("user.email", "drover@test").unwrap();
    }
    repo
}

fn write_file(dir: &Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn commit_all(repo: &Repository, message: &str) -> Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.update_all(["*"].iter(), None).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let signature = repo.signature().unwrap();

    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => Vec::new(),
    };
    let parent_refs: Vec<_> = parents.iter().collect();

    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &parent_refs,
    )
    .unwrap()
}

/// File content as operators author it: metadata header plus payload.
fn emit(owner_group: &str, permissions: u32, body: &str) -> String {
    format!(
        "{delim}\n{{ \"TargetFileOwnerGroup\": \"{owner}\", \"TargetFilePermissions\": {perms}, \"ReloadRequired\": false, \"ReloadCommands\": [] }}\n{delim}\n{body}",
        delim = METADATA_DELIMITER,
        owner = owner_group,
        perms = permissions,
        body = body
    )
}

fn files_for<'a>(plan: &'a DeploymentPlan, host: &str) -> Option<&'a Vec<String>> {
    plan.hosts
        .iter()
        .find(|h| h.endpoint.name == host)
        .map(|h| &h.files)
}

#[test]
fn add_delete_rename_commit_produces_expected_set() {
    let dir = tempfile::tempdir().unwrap();
    let repo = init_repo(dir.path());
    let config = test_config();

    write_file(dir.path(), "hostA/etc/a", &emit("root:root", 644, "alpha\n"));
    write_file(
        dir.path(),
        "hostA/etc/b",
        &emit("root:root", 644, "identical payload kept across the rename\n"),
    );
    commit_all(&repo, "seed");

    std::fs::remove_file(dir.path().join("hostA/etc/a")).unwrap();
    std::fs::rename(
        dir.path().join("hostA/etc/b"),
        dir.path().join("hostA/etc/b2"),
    )
    .unwrap();
    write_file(dir.path(), "hostA/etc/c", &emit("root:root", 600, "charlie\n"));
    let head = commit_all(&repo, "add delete rename");

    let commit = repo.find_commit(head).unwrap();
    let tree = commit.tree().unwrap();

    let scan = scan_commit(&repo, &commit, &config, None).unwrap();
    let plan = filter_hosts_and_files(&tree, &scan, &config, None).unwrap();

    let host_a: std::collections::BTreeSet<_> =
        files_for(&plan, "hostA").unwrap().iter().cloned().collect();
    assert_eq!(
        host_a,
        ["hostA/etc/a", "hostA/etc/b", "hostA/etc/b2", "hostA/etc/c"]
            .into_iter()
            .map(String::from)
            .collect()
    );

    let loaded = load_files(&plan.all_files, &repo, &tree).unwrap();

    assert_eq!(loaded["hostA/etc/a"].action, Action::Delete);
    assert_eq!(loaded["hostA/etc/b"].action, Action::Delete);
    assert_eq!(loaded["hostA/etc/b2"].action, Action::Create);
    assert_eq!(loaded["hostA/etc/c"].action, Action::Create);

    // Payloads are header-stripped and hashed.
    assert_eq!(loaded["hostA/etc/c"].data, b"charlie\n");
    assert_eq!(
        loaded["hostA/etc/c"].hash,
        drover_proto::crypto::sha256_hex(b"charlie\n")
    );
    assert_eq!(loaded["hostA/etc/c"].permissions, 600);
}

#[test]
fn full_tree_mode_applies_universal_shadowing() {
    let dir = tempfile::tempdir().unwrap();
    let repo = init_repo(dir.path());
    let config = test_config();

    write_file(
        dir.path(),
        "UniversalConfs/etc/ssh/sshd_config",
        &emit("root:root", 644, "universal sshd\n"),
    );
    write_file(
        dir.path(),
        "hostA/etc/ssh/sshd_config",
        &emit("root:root", 600, "hostA sshd\n"),
    );
    write_file(dir.path(), "hostB/etc/motd", &emit("root:root", 644, "welcome\n"));
    commit_all(&repo, "seed");

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    let tree = head.tree().unwrap();

    let scan = scan_tree(&repo, &tree, &config, None).unwrap();
    let plan = filter_hosts_and_files(&tree, &scan, &config, None).unwrap();

    let host_a = files_for(&plan, "hostA").unwrap();
    assert!(host_a.contains(&"hostA/etc/ssh/sshd_config".to_string()));
    assert!(!host_a.contains(&"UniversalConfs/etc/ssh/sshd_config".to_string()));

    let host_b = files_for(&plan, "hostB").unwrap();
    assert!(host_b.contains(&"hostB/etc/motd".to_string()));
    assert!(host_b.contains(&"UniversalConfs/etc/ssh/sshd_config".to_string()));

    // Both variants of sshd_config load with their own metadata.
    let loaded = load_files(&plan.all_files, &repo, &tree).unwrap();
    assert_eq!(loaded["hostA/etc/ssh/sshd_config"].permissions, 600);
    assert_eq!(loaded["UniversalConfs/etc/ssh/sshd_config"].permissions, 644);
}

#[test]
fn offline_host_gets_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let repo = init_repo(dir.path());
    let config = test_config();

    write_file(dir.path(), "hostC/etc/app.conf", &emit("root:root", 644, "conf\n"));
    commit_all(&repo, "seed");

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    let tree = head.tree().unwrap();

    let scan = scan_tree(&repo, &tree, &config, None).unwrap();
    let plan = filter_hosts_and_files(&tree, &scan, &config, None).unwrap();

    assert!(files_for(&plan, "hostC").is_none());
    assert!(plan.hosts.is_empty());
}

#[test]
fn failure_tracker_replay_narrows_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let repo = init_repo(dir.path());
    let config = test_config();

    write_file(dir.path(), "hostA/etc/first", &emit("root:root", 644, "one\n"));
    write_file(dir.path(), "hostA/etc/second", &emit("root:root", 644, "two\n"));
    let head = commit_all(&repo, "seed");
    let commit_hex = head.to_string();

    // Placement of the second file failed mid-run.
    let scheduled = vec!["hostA/etc/first".to_string(), "hostA/etc/second".to_string()];
    let tracker = FailureTracker::new();
    tracker.record(
        "hostA",
        &scheduled,
        2,
        &drover_platform::DroverError::Transfer("disk full".to_string()),
    );
    assert_eq!(tracker.write(dir.path(), &commit_hex).unwrap(), 1);

    // The replay re-deploys only the failed file, as a create.
    let (replay_commit, scan) = FailureTracker::read_last(dir.path(), None).unwrap();
    assert_eq!(replay_commit, commit_hex);

    let commit = repo
        .find_commit(Oid::from_str(&replay_commit).unwrap())
        .unwrap();
    let tree = commit.tree().unwrap();

    let plan = filter_hosts_and_files(&tree, &scan, &config, None).unwrap();
    assert_eq!(
        files_for(&plan, "hostA").unwrap(),
        &vec!["hostA/etc/second".to_string()]
    );

    let loaded = load_files(&plan.all_files, &repo, &tree).unwrap();
    assert_eq!(loaded["hostA/etc/second"].action, Action::Create);
    assert_eq!(loaded["hostA/etc/second"].data, b"two\n");

    // A clean follow-up run clears the tracker.
    let clean = FailureTracker::new();
    assert_eq!(clean.write(dir.path(), &commit_hex).unwrap(), 0);
    assert!(!dir.path().join(FAIL_TRACKER_FILE).exists());
}
