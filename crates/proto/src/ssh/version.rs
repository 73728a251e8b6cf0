//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and
//! server send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-Keel_0.1.0`
//!
//! A peer may send any number of other lines before its banner; they are
//! logged and discarded. The first line starting with `SSH-` is the banner.
//!
//! # Security
//!
//! - Maximum line length: 255 characters (DoS prevention)
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::version::Version;
//!
//! let version = Version::new("Keel_0.1.0", Some("embedded sshd"));
//! assert_eq!(version.to_string(), "SSH-2.0-Keel_0.1.0 embedded sshd");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use keel_platform::{KeelError, KeelResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of pre-banner lines tolerated before giving up.
const MAX_PRE_BANNER_LINES: usize = 32;

/// SSH protocol version string.
///
/// Represents the SSH identification string exchanged at connection start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Keel_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Keel version string.
    pub fn default_keel() -> Self {
        Self::new(&format!("Keel_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> KeelResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Version string too long: {} characters (maximum {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KeelError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            KeelError::Protocol(format!("Version string does not start with SSH-: '{}'", line))
        })?;

        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            KeelError::Protocol(format!("Version string missing software part: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(KeelError::Protocol(format!(
                "Unsupported protocol version: '{}'",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((sw, comment)) => (sw.to_string(), Some(comment.to_string())),
            None => (rest.to_string(), None),
        };

        if software_version.is_empty() {
            return Err(KeelError::Protocol(
                "Empty software version".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Reads lines from the peer until a banner appears.
    ///
    /// Non-banner lines (e.g. a TCP-wrapper greeting) are logged at debug
    /// and discarded, per RFC 4253 Section 4.2.
    pub async fn exchange<R: AsyncRead + Unpin>(reader: &mut R) -> KeelResult<Self> {
        for _ in 0..MAX_PRE_BANNER_LINES {
            let line = read_line(reader).await?;
            if line.starts_with("SSH-") {
                return Self::parse(&line);
            }
            debug!(line = %line.trim_end(), "discarding pre-banner line");
        }

        Err(KeelError::Protocol(
            "No SSH identification banner received".to_string(),
        ))
    }

    /// Returns the protocol version.
    pub fn protocol(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments (if any).
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the banner line including the trailing CR LF.
    pub fn banner_line(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> KeelResult<String> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        reader.read_exact(&mut byte).await.map_err(KeelError::Io)?;
        if byte[0] == b'\n' {
            break;
        }
        buffer.push(byte[0]);

        if buffer.len() > MAX_VERSION_LENGTH {
            return Err(KeelError::Protocol(
                "Identification line too long".to_string(),
            ));
        }
    }

    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }

    String::from_utf8(buffer)
        .map_err(|_| KeelError::Protocol("Identification line is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("Keel_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Keel_0.1.0");

        let with_comment = Version::new("Keel_0.1.0", Some("test"));
        assert_eq!(with_comment.to_string(), "SSH-2.0-Keel_0.1.0 test");
    }

    #[test]
    fn test_parse_plain() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
        assert_eq!(version.protocol(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert!(version.comments().is_none());
    }

    #[test]
    fn test_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_parse_legacy_199() {
        let version = Version::parse("SSH-1.99-OldServer").unwrap();
        assert_eq!(version.protocol(), "1.99");
    }

    #[test]
    fn test_parse_rejects_v1() {
        assert!(Version::parse("SSH-1.5-AncientServer").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let line = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(Version::parse(&line).is_err());
    }

    #[tokio::test]
    async fn test_exchange_skips_pre_banner_lines() {
        let input = b"Welcome to the machine\r\nSecond notice\r\nSSH-2.0-Keel_0.1.0\r\n";
        let mut reader = &input[..];
        let version = Version::exchange(&mut reader).await.unwrap();
        assert_eq!(version.software(), "Keel_0.1.0");
    }

    #[tokio::test]
    async fn test_exchange_banner_first() {
        let input = b"SSH-2.0-OpenSSH_9.0\r\n";
        let mut reader = &input[..];
        let version = Version::exchange(&mut reader).await.unwrap();
        assert_eq!(version.software(), "OpenSSH_9.0");
    }
}
