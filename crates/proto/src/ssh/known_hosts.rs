//! Hashed known_hosts trust store (OpenSSH format).
//!
//! Only hashed entries are produced and consulted:
//!
//! ```text
//! |1|base64(salt)|base64(HMAC-SHA1(salt, host)) keytype base64-key
//! ```
//!
//! The file is read once into a snapshot when the store is opened; accepted
//! host keys are appended under a single mutex so concurrent workers never
//! interleave lines. When a host is unknown, the operator decides with
//! `y` (accept once), `all` (accept everything for the rest of the
//! process), or anything else (reject the connection).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use drover_platform::{DroverError, DroverResult, Prompter};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tracing::info;

type HmacSha1 = Hmac<Sha1>;

/// Salt length for newly hashed hostnames.
const APPEND_SALT_LEN: usize = 20;

/// One hashed known_hosts line.
#[derive(Debug, Clone)]
pub struct KnownHostEntry {
    salt: Vec<u8>,
    hashed_host: Vec<u8>,
    key_base64: String,
}

impl KnownHostEntry {
    /// Parses a single hashed line; plain, wildcard, comment, and malformed
    /// lines yield `None` and are skipped.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (host_part, key_part) = line.split_once(' ')?;

        // Hashed hostname format: |1|salt|hash
        let mut sections = host_part.split('|');
        if !sections.next()?.is_empty() || sections.next()? != "1" {
            return None;
        }
        let salt = STANDARD.decode(sections.next()?).ok()?;
        let hashed_host = STANDARD.decode(sections.next()?).ok()?;

        // Key section must hold at least algorithm and key fields.
        let mut fields = key_part.split_whitespace();
        let _key_type = fields.next()?;
        let key_base64 = fields.next()?.to_string();

        Some(Self {
            salt,
            hashed_host,
            key_base64,
        })
    }

    /// Whether this entry's hashed hostname matches `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        let computed = hash_host(&self.salt, host);
        computed.ct_eq(&self.hashed_host[..]).into()
    }

    /// Base64 public key blob recorded for the host.
    pub fn key_base64(&self) -> &str {
        &self.key_base64
    }
}

/// Computes `HMAC-SHA1(salt, host)` for hashed hostname lines.
pub fn hash_host(salt: &[u8], host: &str) -> Vec<u8> {
    let mut hmac = HmacSha1::new_from_slice(salt).expect("HMAC accepts any key length");
    hmac.update(host.as_bytes());
    hmac.finalize().into_bytes().to_vec()
}

/// Strips the brackets an IPv6 peer address carries in socket form.
fn clean_host(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Known-hosts snapshot plus the trust policy applied to unknown keys.
///
/// Carries everything the host-key check needs: the parsed snapshot, the
/// append path, the process-wide trust-all flag, and the operator prompter.
pub struct KnownHostsStore {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
    append_lock: Mutex<()>,
    trust_all: AtomicBool,
    prompter: Arc<dyn Prompter>,
}

impl KnownHostsStore {
    /// Opens the store, reading a snapshot of `path` if it exists.
    pub fn open(path: impl Into<PathBuf>, prompter: Arc<dyn Prompter>) -> DroverResult<Self> {
        let path = path.into();

        let mut entries = Vec::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            entries.extend(content.lines().filter_map(KnownHostEntry::parse_line));
        }

        Ok(Self {
            path,
            entries,
            append_lock: Mutex::new(()),
            trust_all: AtomicBool::new(false),
            prompter,
        })
    }

    /// Number of hashed entries in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accept every unknown host key for the rest of the process.
    pub fn set_trust_all(&self) {
        self.trust_all.store(true, Ordering::SeqCst);
    }

    /// Verifies `key_base64` for `host`, consulting the operator when the
    /// host is unknown.
    ///
    /// # Errors
    ///
    /// [`DroverError::UntrustedHost`] when the key is unknown and the
    /// operator declines it.
    pub fn verify(&self, host: &str, key_type: &str, key_base64: &str) -> DroverResult<()> {
        let host = clean_host(host);

        for entry in &self.entries {
            if entry.matches_host(host) && entry.key_base64() == key_base64 {
                return Ok(());
            }
        }

        if self.trust_all.load(Ordering::SeqCst) {
            return self.append(host, key_type, key_base64);
        }

        let answer = self.prompter.prompt_line(&format!(
            "Host {} not in known_hosts. Key: {} {}\nDo you want to add this key to known_hosts? [y/N/all]: ",
            host, key_type, key_base64
        ))?;
        let answer = answer.trim().to_lowercase();

        // 'all' implies 'yes' to this first host key.
        if answer == "all" {
            self.set_trust_all();
            return self.append(host, key_type, key_base64);
        }

        if answer != "y" {
            return Err(DroverError::UntrustedHost(host.to_string()));
        }

        self.append(host, key_type, key_base64)
    }

    /// Appends a freshly hashed entry for `host`.
    fn append(&self, host: &str, key_type: &str, key_base64: &str) -> DroverResult<()> {
        info!("writing new host entry in known_hosts for {}", host);

        let mut salt = [0u8; APPEND_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let hashed_host = hash_host(&salt, host);

        let line = format!(
            "|1|{}|{} {} {}\n",
            STANDARD.encode(salt),
            STANDARD.encode(hashed_host),
            key_type,
            key_base64
        );

        let _guard = self.append_lock.lock().expect("known_hosts lock poisoned");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                DroverError::Config(format!("failed to open known_hosts file: {}", e))
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| {
                DroverError::Config(format!(
                    "failed to write new known host to known_hosts file: {}",
                    e
                ))
            })?;

        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_platform::ScriptedPrompter;

    const KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD";

    fn hashed_line(host: &str, key_base64: &str) -> String {
        let salt = [7u8; APPEND_SALT_LEN];
        let hashed = hash_host(&salt, host);
        format!(
            "|1|{}|{} ssh-ed25519 {}",
            STANDARD.encode(salt),
            STANDARD.encode(hashed),
            key_base64
        )
    }

    fn store_with(
        dir: &tempfile::TempDir,
        contents: &str,
        answers: Vec<&str>,
    ) -> KnownHostsStore {
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, contents).unwrap();
        KnownHostsStore::open(path, Arc::new(ScriptedPrompter::new(answers))).unwrap()
    }

    #[test]
    fn test_parse_hashed_line() {
        let entry = KnownHostEntry::parse_line(&hashed_line("10.0.0.5", KEY_B64)).unwrap();
        assert!(entry.matches_host("10.0.0.5"));
        assert!(!entry.matches_host("10.0.0.6"));
        assert_eq!(entry.key_base64(), KEY_B64);
    }

    #[test]
    fn test_plain_and_comment_lines_skipped() {
        assert!(KnownHostEntry::parse_line("# comment").is_none());
        assert!(KnownHostEntry::parse_line("").is_none());
        assert!(KnownHostEntry::parse_line(&format!("10.0.0.5 ssh-ed25519 {}", KEY_B64)).is_none());
    }

    #[test]
    fn test_verify_known_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &hashed_line("10.0.0.5", KEY_B64), vec![]);
        store.verify("10.0.0.5", "ssh-ed25519", KEY_B64).unwrap();
    }

    #[test]
    fn test_verify_ipv6_brackets_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &hashed_line("fd00::10", KEY_B64), vec![]);
        store.verify("[fd00::10]", "ssh-ed25519", KEY_B64).unwrap();
    }

    #[test]
    fn test_unknown_host_rejected_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, "", vec![""]);
        let result = store.verify("10.0.0.9", "ssh-ed25519", KEY_B64);
        assert!(matches!(result, Err(DroverError::UntrustedHost(_))));
    }

    #[test]
    fn test_changed_key_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &hashed_line("10.0.0.5", KEY_B64), vec!["n"]);
        let result = store.verify("10.0.0.5", "ssh-ed25519", "AAAAdifferent");
        assert!(matches!(result, Err(DroverError::UntrustedHost(_))));
    }

    #[test]
    fn test_accept_once_appends_hashed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, "", vec!["y"]);
        store.verify("10.0.0.9", "ssh-ed25519", KEY_B64).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        let entry = KnownHostEntry::parse_line(contents.trim()).unwrap();
        assert!(entry.matches_host("10.0.0.9"));
        assert_eq!(entry.key_base64(), KEY_B64);

        // The snapshot is unchanged; reopening sees the appended entry.
        let reopened = KnownHostsStore::open(
            dir.path().join("known_hosts"),
            Arc::new(ScriptedPrompter::new(Vec::<String>::new())),
        )
        .unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_all_answer_trusts_rest_of_process() {
        let dir = tempfile::tempdir().unwrap();
        // Single scripted answer: the second unknown host must not prompt.
        let store = store_with(&dir, "", vec!["all"]);
        store.verify("10.0.0.9", "ssh-ed25519", KEY_B64).unwrap();
        store.verify("10.0.0.10", "ssh-ed25519", KEY_B64).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
