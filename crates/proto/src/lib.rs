//! Protocol implementation for the Keel embedded SSH server.
//!
//! This crate provides the server side of SSH-2 (RFC 4251-4254) with an
//! embedded SFTP subsystem (secsh-filexfer v3-v6):
//!
//! - Transport: version exchange, key exchange, binary packet protocol,
//!   rekeying
//! - Connection layer: channel multiplexing with credit-based flow
//!   control, port forwarding
//! - User authentication: password, public key, keyboard-interactive
//! - SFTP: versioned request engine with a file-handle table and the
//!   common IETF/OpenSSH extensions
//!
//! A deliberately small client lives in [`ssh::client`] so the test
//! suite can exercise the server end to end.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::server::SshServer;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SshServer::bind("127.0.0.1:2222").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Constant-time operations for authentication and MAC checks
//! - Secure memory handling with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;
