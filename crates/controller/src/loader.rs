//! File loader.
//!
//! Every deployable repository file starts with a metadata header between
//! two delimiter lines:
//!
//! ```text
//! #|^^^|#
//! { "TargetFileOwnerGroup": "root:root", "TargetFilePermissions": 644,
//!   "ReloadRequired": false, "ReloadCommands": [] }
//! #|^^^|#
//! <file bytes>
//! ```
//!
//! The loader strips the header, hashes the remaining payload, and attaches
//! the parsed placement metadata. Only `create` actions load content;
//! `delete` and `symlinkcreate` records carry the action alone. A file with
//! unreadable content or an unparseable header aborts the whole run; partial
//! metadata must never reach an endpoint.

use crate::scanner::Action;
use drover_platform::{DroverError, DroverResult};
use git2::{Repository, Tree};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Fixed line separating the metadata header from the payload.
pub const METADATA_DELIMITER: &str = "#|^^^|#";

/// Parsed metadata header.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetaHeader {
    /// `user:group` ownership applied on the endpoint.
    #[serde(rename = "TargetFileOwnerGroup", default)]
    pub target_file_owner_group: String,

    /// File mode digits as the operator wrote them (e.g. `644`).
    #[serde(rename = "TargetFilePermissions", default)]
    pub target_file_permissions: u32,

    /// Whether placement triggers the reload commands.
    #[serde(rename = "ReloadRequired", default)]
    pub reload_required: bool,

    /// Commands run, in order, after the file is placed.
    #[serde(rename = "ReloadCommands", default)]
    pub reload_commands: Vec<String>,
}

/// Everything deployment needs to know about one scheduled file.
#[derive(Debug, Clone)]
pub struct CommitFileInfo {
    /// What to do with the file.
    pub action: Action,
    /// `user:group` ownership (create only).
    pub owner_group: String,
    /// Mode digits passed to `install -m` (create only).
    pub permissions: u32,
    /// Whether reload commands run after placement (create only).
    pub reload_required: bool,
    /// Reload commands in declaration order (create only).
    pub reload_commands: Vec<String>,
    /// SHA-256 hex of the payload (create only).
    pub hash: String,
    /// Payload bytes with the header stripped (create only).
    pub data: Vec<u8>,
}

impl CommitFileInfo {
    /// Record for actions that carry no content.
    fn action_only(action: Action) -> Self {
        Self {
            action,
            owner_group: String::new(),
            permissions: 0,
            reload_required: false,
            reload_commands: Vec::new(),
            hash: String::new(),
            data: Vec::new(),
        }
    }
}

/// Splits file content into its raw JSON header and payload.
///
/// Splits on the first two delimiter occurrences only; a payload containing
/// the delimiter string is left untouched.
pub fn extract_metadata(content: &[u8]) -> DroverResult<(&[u8], &[u8])> {
    let delimiter = METADATA_DELIMITER.as_bytes();

    let first = find_subslice(content, delimiter, 0).ok_or_else(|| {
        DroverError::MetadataParse("missing leading metadata delimiter".to_string())
    })?;
    let header_start = first + delimiter.len();

    let second = find_subslice(content, delimiter, header_start).ok_or_else(|| {
        DroverError::MetadataParse("missing closing metadata delimiter".to_string())
    })?;

    let header = &content[header_start..second];
    let mut body = &content[second + delimiter.len()..];

    // Drop the newline ending the closing delimiter line, nothing more.
    if body.starts_with(b"\r\n") {
        body = &body[2..];
    } else if body.starts_with(b"\n") {
        body = &body[1..];
    }

    Ok((header, body))
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Loads content and metadata for every file in the deployment set.
///
/// `delete` and `symlinkcreate` entries skip loading; `unsupported` entries
/// are dropped silently.
pub fn load_files(
    deployment_files: &BTreeMap<String, Action>,
    repo: &Repository,
    tree: &Tree<'_>,
) -> DroverResult<BTreeMap<String, CommitFileInfo>> {
    let mut loaded = BTreeMap::new();

    for (path, action) in deployment_files {
        debug!("loading repository file {} ({:?})", path, action);

        match action {
            Action::Delete | Action::SymlinkCreate { .. } => {
                loaded.insert(path.clone(), CommitFileInfo::action_only(action.clone()));
                continue;
            }
            Action::Unsupported => continue,
            Action::Create => {}
        }

        let entry = tree.get_path(Path::new(path)).map_err(|e| {
            DroverError::Git(format!("failed retrieving file from git tree: {}", e))
        })?;
        let blob = repo.find_blob(entry.id()).map_err(|e| {
            DroverError::Git(format!("failed retrieving file content: {}", e))
        })?;

        let (header, body) = extract_metadata(blob.content())
            .map_err(|e| DroverError::MetadataParse(format!("{}: {}", path, e)))?;

        let meta: MetaHeader = serde_json::from_slice(header).map_err(|e| {
            DroverError::MetadataParse(format!("{}: {}", path, e))
        })?;

        loaded.insert(
            path.clone(),
            CommitFileInfo {
                action: Action::Create,
                owner_group: meta.target_file_owner_group,
                permissions: meta.target_file_permissions,
                reload_required: meta.reload_required,
                reload_commands: meta.reload_commands,
                hash: drover_proto::crypto::sha256_hex(body),
                data: body.to_vec(),
            },
        );
    }

    Ok(loaded)
}
