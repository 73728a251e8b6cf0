//! SSH (Secure Shell) server core.
//!
//! This module implements the server side of the SSH protocol according
//! to RFC 4251-4254, with an embedded SFTP subsystem (secsh-filexfer
//! drafts v3-v6).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Buffer / Packet Layer** ([`buffer`], [`packet`]) - typed
//!    primitives and the binary packet protocol (RFC 4253 Section 6)
//! 2. **Transport Layer** ([`transport`], [`kex`], [`kex_dh`],
//!    [`crypto`]) - key exchange, encryption, MAC, rekeying
//! 3. **Authentication Layer** ([`auth`], [`authorized_keys`]) - user
//!    authentication (RFC 4252)
//! 4. **Connection Layer** ([`mux`], [`channel`], [`window`],
//!    [`connection`]) - channels, flow control, requests (RFC 4254)
//! 5. **Subsystems & forwarding** ([`sftp`], [`forwarding`])
//! 6. **Server / test client APIs** ([`server`], [`client`], [`config`])
//!
//! # Security Considerations
//!
//! - **Input validation**: every packet parse validates size limits
//!   (maximum packet length 256 KiB)
//! - **Constant-time operations**: MAC checks and password comparison
//! - **Memory safety**: key material zeroized on drop, no `unsafe`
//! - **Flow control**: per-channel windows bound peer memory usage
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::server::SshServer;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SshServer::bind("127.0.0.1:2222").await?;
//! loop {
//!     let mut session = server.accept().await?;
//!     tokio::spawn(async move {
//!         if session.authenticate().await.is_ok() {
//!             let _ = session.run().await;
//!         }
//!     });
//! }
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod authorized_keys;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod forwarding;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod mux;
pub mod packet;
pub mod server;
pub mod sftp;
pub mod transport;
pub mod version;
pub mod window;

// Re-export main types
pub use auth::{
    constant_time_compare, construct_signature_data, AuthFailure, AuthMethod, AuthOutcome,
    AuthRequest, InteractiveChallenger, PasswordAuthenticator, PublickeyAuthenticator,
    UserAuthService,
};
pub use authorized_keys::{AuthorizedKey, AuthorizedKeysFile, WatchedAuthorizedKeys};
pub use buffer::Buffer;
pub use channel::{
    AsyncChannelReader, AsyncChannelWriter, ChannelCore, ChannelEvent, ChannelState,
    ChannelStdin, ChannelVariant, ChannelWriter, PacketSink,
};
pub use client::{ClientChannel, SshClient, SshClientConfig};
pub use config::Config;
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use crypto::{CipherFactory, CipherRegistry, PacketMac};
pub use hostkey::{
    verify_signature, EcdsaP256HostKey, EcdsaP384HostKey, EcdsaP521HostKey, Ed25519HostKey,
    HostKey, KeyProvider, RsaHostKey, StaticKeyProvider,
};
pub use kex::{negotiate_algorithm, KexInit, NegotiatedAlgorithms, NewKeys};
pub use kex_dh::{derive_key, Curve25519Exchange, EcdhExchange, KexAlgorithm, ModpExchange};
pub use message::{DisconnectReason, MessageType};
pub use mux::{
    AcceptAllForwarding, Command, CommandContext, CommandExit, CommandFactory,
    ConnectionService, ForwardingFilter, RejectAllForwarding, SubsystemFactory,
};
pub use packet::{Compression, PacketDecoder, PacketEncoder, MAX_PACKET_LENGTH};
pub use server::{SftpSubsystemFactory, SshServer, SshSession};
pub use sftp::{SftpClient, SftpConfig, SftpSubsystem};
pub use transport::{State, TransportConfig, TransportState};
pub use version::Version;
pub use window::Window;
