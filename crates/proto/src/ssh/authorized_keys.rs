//! authorized_keys parsing (OpenSSH format).
//!
//! The deployer agent authenticates clients against a whitelist of
//! authorized_keys lines from its configuration:
//!
//! ```text
//! [options] keytype base64-key [comment]
//! ```
//!
//! Authorization compares the base64 key field, which already encodes the
//! algorithm in its wire form.

use drover_platform::{DroverError, DroverResult};

/// A single authorized key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Algorithm name (e.g., "ssh-ed25519", "ssh-rsa")
    algorithm: String,
    /// Base64-encoded public key blob
    key_base64: String,
    /// Optional comment
    comment: String,
}

impl AuthorizedKey {
    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the base64 key field.
    pub fn key_base64(&self) -> &str {
        &self.key_base64
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Parses a single authorized_keys line.
    ///
    /// Leading option fields are skipped; the first recognized key type
    /// starts the key section.
    pub fn parse_line(line: &str) -> DroverResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(DroverError::Protocol("empty or comment line".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        let algorithm_idx = parts
            .iter()
            .position(|field| Self::is_key_type(field))
            .ok_or_else(|| {
                DroverError::Protocol("no key type found in authorized_keys line".to_string())
            })?;

        if algorithm_idx + 1 >= parts.len() {
            return Err(DroverError::Protocol(
                "missing key data in authorized_keys line".to_string(),
            ));
        }

        Ok(Self {
            algorithm: parts[algorithm_idx].to_string(),
            key_base64: parts[algorithm_idx + 1].to_string(),
            comment: parts[algorithm_idx + 2..].join(" "),
        })
    }

    /// Checks if a string is a recognized SSH key type.
    fn is_key_type(s: &str) -> bool {
        matches!(
            s,
            "ssh-rsa"
                | "rsa-sha2-256"
                | "rsa-sha2-512"
                | "ssh-ed25519"
                | "ecdsa-sha2-nistp256"
                | "ecdsa-sha2-nistp384"
                | "ecdsa-sha2-nistp521"
                | "ssh-dss"
        )
    }
}

/// The agent's public key whitelist.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeys {
    /// Parses a list of authorized_keys lines (e.g., from the agent config).
    ///
    /// # Errors
    ///
    /// Fails on the first unparseable line; a bad whitelist line would
    /// otherwise silently lock a key out.
    pub fn from_lines<I, S>(lines: I) -> DroverResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys = Vec::new();
        for line in lines {
            keys.push(AuthorizedKey::parse_line(line.as_ref())?);
        }
        Ok(Self { keys })
    }

    /// Returns the parsed keys.
    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Whether `key_base64` matches any whitelisted key.
    pub fn contains_base64(&self, key_base64: &str) -> bool {
        self.keys.iter().any(|key| key.key_base64() == key_base64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD";

    #[test]
    fn test_parse_simple_key() {
        let line = format!("ssh-ed25519 {} controller@core", KEY_B64);
        let key = AuthorizedKey::parse_line(&line).unwrap();

        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.key_base64(), KEY_B64);
        assert_eq!(key.comment(), "controller@core");
    }

    #[test]
    fn test_parse_key_with_options() {
        let line = format!("no-port-forwarding,no-pty ssh-ed25519 {}", KEY_B64);
        let key = AuthorizedKey::parse_line(&line).unwrap();

        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.key_base64(), KEY_B64);
    }

    #[test]
    fn test_parse_comment_line_rejected() {
        assert!(AuthorizedKey::parse_line("# nothing here").is_err());
    }

    #[test]
    fn test_missing_key_data_rejected() {
        assert!(AuthorizedKey::parse_line("ssh-ed25519").is_err());
    }

    #[test]
    fn test_whitelist_lookup() {
        let keys =
            AuthorizedKeys::from_lines([format!("ssh-ed25519 {} controller", KEY_B64)]).unwrap();

        assert!(keys.contains_base64(KEY_B64));
        assert!(!keys.contains_base64("AAAAsomethingelse"));
    }

    #[test]
    fn test_bad_whitelist_line_fails_load() {
        let result = AuthorizedKeys::from_lines(["not a key at all"]);
        assert!(result.is_err());
    }
}
