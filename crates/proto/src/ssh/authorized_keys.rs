//! OpenSSH authorized_keys parsing and the watched key store.
//!
//! Each line in an authorized_keys file has the format:
//! ```text
//! [options] keytype base64-key [comment]
//! ```
//!
//! [`WatchedAuthorizedKeys`] backs the public-key authenticator for a
//! file on disk: every `authenticate` call re-stats the file and reloads
//! it when the size or modification time changed, so edits take effect
//! without restarting the server. Steady state performs exactly one stat
//! and at most one reload per call; tests can observe the reload count.

use crate::ssh::auth::PublickeyAuthenticator;
use base64::Engine;
use keel_platform::{KeelError, KeelResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

/// A single authorized key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Key options (e.g., "no-port-forwarding", "command=\"...\"")
    options: Vec<String>,
    /// Algorithm name (e.g., "ssh-ed25519", "ssh-rsa")
    algorithm: String,
    /// Decoded public key data (SSH wire blob)
    key_data: Vec<u8>,
    /// Optional comment
    comment: String,
}

impl AuthorizedKey {
    /// Creates a new authorized key entry.
    pub fn new(algorithm: String, key_data: Vec<u8>, comment: String) -> Self {
        Self {
            options: Vec::new(),
            algorithm,
            key_data,
            comment,
        }
    }

    /// Returns the key options.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the key data (SSH wire format).
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks if this key has a specific option.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|opt| opt == option)
    }

    /// Parses a single line from an authorized_keys file.
    pub fn parse_line(line: &str) -> KeelResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(KeelError::Protocol("Empty or comment line".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(KeelError::Protocol(
                "Invalid authorized_keys line: too few fields".to_string(),
            ));
        }

        let (options, algorithm_idx) = if Self::is_key_type(parts[0]) {
            (Vec::new(), 0)
        } else {
            let mut opts = Vec::new();
            let mut idx = 0;
            while idx < parts.len() && !Self::is_key_type(parts[idx]) {
                opts.push(parts[idx].to_string());
                idx += 1;
            }
            if idx >= parts.len() {
                return Err(KeelError::Protocol(
                    "No key type found in authorized_keys line".to_string(),
                ));
            }
            (opts, idx)
        };

        if algorithm_idx + 1 >= parts.len() {
            return Err(KeelError::Protocol(
                "Missing key data in authorized_keys line".to_string(),
            ));
        }

        let algorithm = parts[algorithm_idx].to_string();
        let key_data = base64::engine::general_purpose::STANDARD
            .decode(parts[algorithm_idx + 1])
            .map_err(|e| KeelError::Protocol(format!("Invalid base64 key data: {}", e)))?;

        let comment = if algorithm_idx + 2 < parts.len() {
            parts[algorithm_idx + 2..].join(" ")
        } else {
            String::new()
        };

        Ok(Self {
            options,
            algorithm,
            key_data,
            comment,
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
        )
    }
}

/// Collection of authorized keys.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeysFile {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeysFile {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads authorized keys from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(KeelError::Io)?;
        Self::from_string(&content)
    }

    /// Parses authorized keys from a string. Unparseable lines are
    /// skipped with a warning, matching sshd behavior.
    pub fn from_string(content: &str) -> KeelResult<Self> {
        let mut keys = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match AuthorizedKey::parse_line(line) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    warn!(line = line_num + 1, error = %e, "skipping authorized_keys line");
                }
            }
        }

        Ok(Self { keys })
    }

    /// Returns the list of authorized keys.
    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Adds a key to the collection.
    pub fn add_key(&mut self, key: AuthorizedKey) {
        self.keys.push(key);
    }

    /// Finds a key matching the given algorithm and key data.
    pub fn find_key(&self, algorithm: &str, key_data: &[u8]) -> Option<&AuthorizedKey> {
        self.keys
            .iter()
            .find(|key| key.algorithm() == algorithm && key.key_data() == key_data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: SystemTime,
    len: u64,
}

struct WatchedState {
    keys: AuthorizedKeysFile,
    stamp: Option<FileStamp>,
}

/// An authorized_keys file re-checked on every authentication.
///
/// Each [`authenticate`](PublickeyAuthenticator::authenticate) call stats
/// the file and reloads it iff the modification time or length changed;
/// the very first call always loads. A missing file authenticates
/// nothing.
pub struct WatchedAuthorizedKeys {
    path: PathBuf,
    state: Mutex<WatchedState>,
    reload_count: AtomicU64,
}

impl WatchedAuthorizedKeys {
    /// Watches `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(WatchedState {
                keys: AuthorizedKeysFile::new(),
                stamp: None,
            }),
            reload_count: AtomicU64::new(0),
        }
    }

    /// Number of file reloads performed so far. During steady state every
    /// authenticate call that observes an unchanged file performs zero
    /// reloads; a changed file performs exactly one.
    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::SeqCst)
    }

    /// The watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&self) -> KeelResult<()> {
        let metadata = std::fs::metadata(&self.path).map_err(KeelError::Io)?;
        let stamp = FileStamp {
            mtime: metadata.modified().map_err(KeelError::Io)?,
            len: metadata.len(),
        };

        let mut state = self.state.lock().expect("watched keys poisoned");
        if state.stamp == Some(stamp) {
            return Ok(());
        }

        debug!(path = %self.path.display(), "reloading authorized keys");
        state.keys = AuthorizedKeysFile::from_file(&self.path)?;
        state.stamp = Some(stamp);
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn holds(&self, algorithm: &str, key_data: &[u8]) -> bool {
        let state = self.state.lock().expect("watched keys poisoned");
        state.keys.find_key(algorithm, key_data).is_some()
    }
}

#[async_trait::async_trait]
impl PublickeyAuthenticator for WatchedAuthorizedKeys {
    async fn authenticate(
        &self,
        username: &str,
        algorithm: &str,
        public_key: &[u8],
    ) -> KeelResult<bool> {
        if let Err(e) = self.refresh() {
            debug!(user = %username, error = %e, "authorized_keys unavailable");
            return Ok(false);
        }
        Ok(self.holds(algorithm, public_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD";

    #[test]
    fn test_parse_simple_key() {
        let line = format!("ssh-ed25519 {} user@host", SAMPLE_KEY);
        let key = AuthorizedKey::parse_line(&line).unwrap();

        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.comment(), "user@host");
        assert!(key.options().is_empty());
    }

    #[test]
    fn test_parse_key_without_comment() {
        let line = format!("ssh-ed25519 {}", SAMPLE_KEY);
        let key = AuthorizedKey::parse_line(&line).unwrap();
        assert_eq!(key.comment(), "");
    }

    #[test]
    fn test_parse_key_with_options() {
        let line = format!(
            "no-port-forwarding,command=\"/usr/bin/ls\" ssh-ed25519 {}",
            SAMPLE_KEY
        );
        let key = AuthorizedKey::parse_line(&line).unwrap();
        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.options().len(), 1);
    }

    #[test]
    fn test_parse_comment_line() {
        assert!(AuthorizedKey::parse_line("# This is a comment").is_err());
        assert!(AuthorizedKey::parse_line("   ").is_err());
    }

    #[test]
    fn test_file_skips_bad_lines() {
        let content = format!(
            "# header\nnot a key line at all\nssh-ed25519 {} user@host\n",
            SAMPLE_KEY
        );
        let file = AuthorizedKeysFile::from_string(&content).unwrap();
        assert_eq!(file.keys().len(), 1);
    }

    #[test]
    fn test_find_key() {
        let content = format!("ssh-ed25519 {} user@host", SAMPLE_KEY);
        let file = AuthorizedKeysFile::from_string(&content).unwrap();

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(SAMPLE_KEY)
            .unwrap();

        assert!(file.find_key("ssh-ed25519", &key_data).is_some());
        assert!(file.find_key("ssh-rsa", &key_data).is_none());
        assert!(file.find_key("ssh-ed25519", &[1, 2, 3]).is_none());
    }

    #[tokio::test]
    async fn test_watched_keys_loads_once_per_change() {
        use crate::ssh::auth::PublickeyAuthenticator;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, format!("ssh-ed25519 {} a@b\n", SAMPLE_KEY)).unwrap();

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(SAMPLE_KEY)
            .unwrap();

        let watched = WatchedAuthorizedKeys::new(&path);
        assert_eq!(watched.reload_count(), 0);

        // First call loads the file exactly once.
        assert!(watched
            .authenticate("alice", "ssh-ed25519", &key_data)
            .await
            .unwrap());
        assert_eq!(watched.reload_count(), 1);

        // Unchanged file: no further reloads.
        assert!(watched
            .authenticate("alice", "ssh-ed25519", &key_data)
            .await
            .unwrap());
        assert_eq!(watched.reload_count(), 1);

        // Rewrite with different content: exactly one more reload, and
        // the removed key stops authenticating.
        std::fs::write(&path, "# all keys revoked\n").unwrap();
        assert!(!watched
            .authenticate("alice", "ssh-ed25519", &key_data)
            .await
            .unwrap());
        assert_eq!(watched.reload_count(), 2);
    }

    #[tokio::test]
    async fn test_watched_keys_missing_file() {
        use crate::ssh::auth::PublickeyAuthenticator;

        let watched = WatchedAuthorizedKeys::new("/nonexistent/authorized_keys");
        assert!(!watched
            .authenticate("alice", "ssh-ed25519", &[1, 2, 3])
            .await
            .unwrap());
        assert_eq!(watched.reload_count(), 0);
    }
}
