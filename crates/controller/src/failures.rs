//! Failure tracker.
//!
//! Workers append one record per failure; at the end of a run the buffer is
//! written to `.failtracker.json` under the repository root:
//!
//! ```text
//! commitid:<40-hex>
//! {"EndpointName":"hostA","Files":["hostA/etc/app.conf"],"ErrorMessage":"..."}
//! ```
//!
//! Index convention: `index == 0` records a whole-host failure (every
//! scheduled file is listed); `index == k > 0` records file `k-1` alone.
//! The next run with the replay flag turns the file back into a deployment
//! set with every file forced to `create`.

use crate::scanner::{override_allows, Action, CommitScan};
use drover_platform::{DroverError, DroverResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Failure tracker file name under the repository root.
pub const FAIL_TRACKER_FILE: &str = ".failtracker.json";

/// One failure, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Endpoint the failure belongs to.
    #[serde(rename = "EndpointName")]
    pub endpoint_name: String,

    /// Repository paths that failed (or all scheduled paths for a
    /// whole-host failure).
    #[serde(rename = "Files")]
    pub files: Vec<String>,

    /// Single-line error message.
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
}

/// Process-wide append buffer of deployment failures.
#[derive(Debug, Default)]
pub struct FailureTracker {
    records: Mutex<Vec<FailureRecord>>,
}

impl FailureTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for `endpoint`.
    ///
    /// `index == 0` marks the whole host as failed; `index == k > 0` marks
    /// file `k-1` of `all_files`.
    pub fn record(
        &self,
        endpoint: &str,
        all_files: &[String],
        index: usize,
        error: &DroverError,
    ) {
        // Multi-line errors would corrupt the line-oriented tracker.
        let message = error
            .to_string()
            .replace('\n', " ")
            .replace('\r', " ");

        let files = if index == 0 {
            all_files.to_vec()
        } else {
            match all_files.get(index - 1) {
                Some(file) => vec![file.clone()],
                None => all_files.to_vec(),
            }
        };

        warn!("endpoint {}: {}", endpoint, message);

        self.records
            .lock()
            .expect("failure tracker poisoned")
            .push(FailureRecord {
                endpoint_name: endpoint.to_string(),
                files,
                error_message: message,
            });
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.records.lock().expect("failure tracker poisoned").len()
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the tracker file, or removes a stale one after a clean run.
    ///
    /// Returns the number of failures written.
    pub fn write(&self, repo_root: &Path, commit_id: &str) -> DroverResult<usize> {
        let path = tracker_path(repo_root);
        let records = self.records.lock().expect("failure tracker poisoned");

        if records.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            return Ok(0);
        }

        let mut contents = format!("commitid:{}\n", commit_id);
        for record in records.iter() {
            let line = serde_json::to_string(record).map_err(|e| {
                DroverError::Config(format!("failed to serialize failure record: {}", e))
            })?;
            contents.push_str(&line);
            contents.push('\n');
        }

        std::fs::write(&path, contents)?;
        Ok(records.len())
    }

    /// Reads the last tracker file back into a deployment set.
    ///
    /// Every listed file is forced to `create`; the optional file override
    /// narrows the replay further.
    pub fn read_last(
        repo_root: &Path,
        file_override: Option<&str>,
    ) -> DroverResult<(String, CommitScan)> {
        let path = tracker_path(repo_root);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            DroverError::Config(format!("failed to read failure tracker: {}", e))
        })?;

        let mut lines = contents.lines();
        let commit_id = lines
            .next()
            .and_then(|line| line.strip_prefix("commitid:"))
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| {
                DroverError::Config("commitid missing from failtracker file".to_string())
            })?
            .to_string();

        let mut scan = CommitScan::default();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }

            let record: FailureRecord = serde_json::from_str(line).map_err(|e| {
                DroverError::Config(format!("issue parsing failtracker line: {}", e))
            })?;

            if record.endpoint_name.is_empty() {
                return Err(DroverError::Config(format!(
                    "hostname is empty: failtracker line: {}",
                    line
                )));
            }
            if record.files.is_empty() {
                return Err(DroverError::Config(format!(
                    "no files in failtracker line: {}",
                    line
                )));
            }

            scan.hosts.insert(record.endpoint_name.clone());
            for file in record.files {
                if !override_allows(file_override, &file) {
                    continue;
                }
                scan.files.insert(file, Action::Create);
            }
        }

        Ok((commit_id, scan))
    }
}

fn tracker_path(repo_root: &Path) -> PathBuf {
    repo_root.join(FAIL_TRACKER_FILE)
}
