//! Server configuration.
//!
//! One explicit `Config` value threaded through the server constructors;
//! no process-wide defaults. The dev binary populates it from
//! `-o key=value` flags via [`Config::apply`]. Recognized keys and their
//! defaults:
//!
//! | key | default |
//! |---|---|
//! | `window-size` | 2 MiB |
//! | `packet-size` | 32 KiB |
//! | `rekey-bytes-limit` | 1 GiB |
//! | `rekey-time-limit` | 3600 s |
//! | `auth-timeout` | 120 s |
//! | `idle-timeout` | 600 s (0 disables) |
//! | `io-read-timeout`, `io-write-timeout` (also accepted as `nio2-*`) | 0 (disabled) |
//! | `max-auth-attempts` | 20 |
//! | `socket-keepalive`, `socket-linger`, `socket-rcvbuf`, `socket-sndbuf`, `socket-reuseaddr`, `tcp-nodelay` | unset |
//! | `sftp-version`, `sftp-handle-size`, `sftp-handle-rand-max-rounds`, `max-open-handles-per-session`, `sftp-max-packet-length`, `sftp-client-extensions`, `sftp-openssh-extensions`, `unsupported-attribute-policy` | see [`SftpConfig`] |

use crate::ssh::sftp::server::SftpConfig;
use crate::ssh::sftp::UnsupportedAttributePolicy;
use keel_platform::{KeelError, KeelResult};
use std::time::Duration;

/// Socket options applied to the listener and accepted connections.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// SO_KEEPALIVE.
    pub keepalive: Option<bool>,
    /// SO_LINGER, in seconds.
    pub linger: Option<u64>,
    /// SO_RCVBUF, in bytes.
    pub recv_buffer: Option<u32>,
    /// SO_SNDBUF, in bytes.
    pub send_buffer: Option<u32>,
    /// SO_REUSEADDR.
    pub reuseaddr: Option<bool>,
    /// TCP_NODELAY.
    pub nodelay: Option<bool>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identification banner software name.
    pub server_ident: String,
    /// Initial channel window (bytes).
    pub window_size: u32,
    /// Maximum outbound channel packet (bytes).
    pub packet_size: u32,
    /// Rekey after this many outbound bytes.
    pub rekey_bytes_limit: u64,
    /// Rekey after this long.
    pub rekey_time_limit: Duration,
    /// Time allowed for authentication to complete.
    pub auth_timeout: Duration,
    /// Idle timeout for established sessions (zero disables).
    pub idle_timeout: Duration,
    /// Socket read timeout (zero disables).
    pub read_timeout: Duration,
    /// Socket write timeout (zero disables).
    pub write_timeout: Duration,
    /// Per-session authentication attempt budget.
    pub max_auth_attempts: u32,
    /// Socket options.
    pub socket: SocketOptions,
    /// SFTP subsystem settings.
    pub sftp: SftpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ident: format!("Keel_{}", env!("CARGO_PKG_VERSION")),
            window_size: 2 * 1024 * 1024,
            packet_size: 32 * 1024,
            rekey_bytes_limit: 1024 * 1024 * 1024,
            rekey_time_limit: Duration::from_secs(3600),
            auth_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(600),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            max_auth_attempts: 20,
            socket: SocketOptions::default(),
            sftp: SftpConfig::default(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> KeelResult<T> {
    value.parse().map_err(|_| {
        KeelError::Config(format!("Invalid value for {}: '{}'", key, value))
    })
}

impl Config {
    /// Applies one `key=value` override.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] for unknown keys and unparseable
    /// values.
    pub fn apply(&mut self, option: &str) -> KeelResult<()> {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            KeelError::Config(format!("Expected key=value, got '{}'", option))
        })?;
        let key = key.trim();
        let value = value.trim();

        match key {
            "window-size" => self.window_size = parse(key, value)?,
            "packet-size" => self.packet_size = parse(key, value)?,
            "rekey-bytes-limit" => self.rekey_bytes_limit = parse(key, value)?,
            "rekey-time-limit" => {
                self.rekey_time_limit = Duration::from_secs(parse(key, value)?)
            }
            "auth-timeout" => self.auth_timeout = Duration::from_secs(parse(key, value)?),
            "idle-timeout" => self.idle_timeout = Duration::from_secs(parse(key, value)?),
            "io-read-timeout" | "nio2-read-timeout" => {
                self.read_timeout = Duration::from_secs(parse(key, value)?)
            }
            "io-write-timeout" | "nio2-write-timeout" => {
                self.write_timeout = Duration::from_secs(parse(key, value)?)
            }
            "max-auth-attempts" => self.max_auth_attempts = parse(key, value)?,
            "socket-keepalive" => self.socket.keepalive = Some(parse(key, value)?),
            "socket-linger" => self.socket.linger = Some(parse(key, value)?),
            "socket-rcvbuf" => self.socket.recv_buffer = Some(parse(key, value)?),
            "socket-sndbuf" => self.socket.send_buffer = Some(parse(key, value)?),
            "socket-reuseaddr" => self.socket.reuseaddr = Some(parse(key, value)?),
            "tcp-nodelay" => self.socket.nodelay = Some(parse(key, value)?),
            "sftp-version" => self.sftp.forced_version = Some(parse(key, value)?),
            "sftp-handle-size" => self.sftp.handle_size = parse(key, value)?,
            "sftp-handle-rand-max-rounds" => {
                self.sftp.handle_rand_rounds = parse(key, value)?
            }
            "max-open-handles-per-session" => {
                self.sftp.max_open_handles = parse(key, value)?
            }
            "sftp-max-packet-length" => self.sftp.max_data_length = parse(key, value)?,
            "sftp-client-extensions" => {
                self.sftp.client_extensions = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                );
            }
            "sftp-openssh-extensions" => {
                let mut extensions = Vec::new();
                for pair in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (name, version) = pair.split_once('=').ok_or_else(|| {
                        KeelError::Config(format!(
                            "Malformed OpenSSH extension spec: '{}'",
                            pair
                        ))
                    })?;
                    extensions.push((name.trim().to_string(), version.trim().to_string()));
                }
                self.sftp.openssh_extensions = Some(extensions);
            }
            "unsupported-attribute-policy" => {
                self.sftp.policy = match value.to_ascii_lowercase().as_str() {
                    "ignore" => UnsupportedAttributePolicy::Ignore,
                    "warn" => UnsupportedAttributePolicy::Warn,
                    "throw" | "throw-exception" => UnsupportedAttributePolicy::ThrowException,
                    other => {
                        return Err(KeelError::Config(format!(
                            "Unknown attribute policy: '{}'",
                            other
                        )))
                    }
                };
            }
            _ => {
                return Err(KeelError::Config(format!(
                    "Unknown configuration key: '{}'",
                    key
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.window_size, 2 * 1024 * 1024);
        assert_eq!(config.packet_size, 32 * 1024);
        assert_eq!(config.rekey_bytes_limit, 1024 * 1024 * 1024);
        assert_eq!(config.rekey_time_limit, Duration::from_secs(3600));
        assert_eq!(config.max_auth_attempts, 20);
        assert_eq!(config.sftp.handle_size, 16);
    }

    #[test]
    fn test_apply_core_keys() {
        let mut config = Config::default();
        config.apply("window-size=1024").unwrap();
        config.apply("packet-size=512").unwrap();
        config.apply("rekey-bytes-limit=1000000").unwrap();
        config.apply("rekey-time-limit=60").unwrap();
        config.apply("nio2-read-timeout=30").unwrap();
        config.apply("io-write-timeout=45").unwrap();

        assert_eq!(config.window_size, 1024);
        assert_eq!(config.packet_size, 512);
        assert_eq!(config.rekey_bytes_limit, 1_000_000);
        assert_eq!(config.rekey_time_limit, Duration::from_secs(60));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_apply_socket_keys() {
        let mut config = Config::default();
        config.apply("socket-keepalive=true").unwrap();
        config.apply("socket-linger=5").unwrap();
        config.apply("socket-rcvbuf=1024").unwrap();
        config.apply("socket-sndbuf=1024").unwrap();
        config.apply("socket-reuseaddr=true").unwrap();
        config.apply("tcp-nodelay=true").unwrap();

        assert_eq!(config.socket.keepalive, Some(true));
        assert_eq!(config.socket.linger, Some(5));
        assert_eq!(config.socket.recv_buffer, Some(1024));
        assert_eq!(config.socket.send_buffer, Some(1024));
        assert_eq!(config.socket.reuseaddr, Some(true));
        assert_eq!(config.socket.nodelay, Some(true));
    }

    #[test]
    fn test_apply_sftp_keys() {
        let mut config = Config::default();
        config.apply("sftp-version=4").unwrap();
        config.apply("sftp-handle-size=32").unwrap();
        config.apply("max-open-handles-per-session=100").unwrap();
        config
            .apply("sftp-client-extensions=md5-hash,copy-file")
            .unwrap();
        config
            .apply("sftp-openssh-extensions=fsync@openssh.com=1")
            .unwrap();
        config.apply("unsupported-attribute-policy=throw").unwrap();

        assert_eq!(config.sftp.forced_version, Some(4));
        assert_eq!(config.sftp.handle_size, 32);
        assert_eq!(config.sftp.max_open_handles, 100);
        assert_eq!(
            config.sftp.client_extensions.as_deref(),
            Some(&["md5-hash".to_string(), "copy-file".to_string()][..])
        );
        assert_eq!(
            config.sftp.policy,
            UnsupportedAttributePolicy::ThrowException
        );
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let mut config = Config::default();
        assert!(config.apply("no-equals-sign").is_err());
        assert!(config.apply("window-size=huge").is_err());
        assert!(config.apply("unknown-key=1").is_err());
        assert!(config.apply("unsupported-attribute-policy=panic").is_err());
    }
}
