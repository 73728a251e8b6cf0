//! SFTP subsystem (secsh-filexfer drafts v3-v6).
//!
//! The server engine runs as a session-channel subsystem: a worker task
//! reads length-prefixed SFTP packets from the channel, dispatches by
//! opcode and answers through the channel writer.
//!
//! # Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |                               |
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|  (+ extension advertisement)
//!   |                               |
//!   |-- SSH_FXP_OPEN -------------->|
//!   |<- SSH_FXP_HANDLE -------------|
//!   |                               |
//!   |-- SSH_FXP_READ -------------->|
//!   |<- SSH_FXP_DATA ---------------|
//!   |                               |
//!   |-- SSH_FXP_CLOSE ------------->|
//!   |<- SSH_FXP_STATUS -------------|
//! ```
//!
//! # References
//!
//! - [SFTP draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)
//! - [SFTP draft v6](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-13)
//! - [secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00)

pub mod attrs;
pub mod client;
pub mod handles;
pub mod message;
pub mod server;

pub use attrs::{FileAttributes, FileType, UnsupportedAttributePolicy};
pub use client::SftpClient;
pub use handles::{Handle, HandleTable};
pub use message::{SftpMessage, SftpMessageType, StatusCode};
pub use server::{SftpConfig, SftpSubsystem};
