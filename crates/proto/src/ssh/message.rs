//! SSH protocol message types (RFC 4253).
//!
//! This module defines all SSH protocol message types and their numeric
//! identifiers as specified in RFC 4253 Section 12 and related RFCs.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

/// SSH message types as defined in RFC 4253 Section 12.
///
/// Each message type has a unique numeric identifier used in the binary
/// protocol. The 30-49 range is reused per key-exchange method: 30/31 are
/// KEXDH_INIT/REPLY for fixed-group and ECDH exchanges, and 30-34 carry the
/// group-exchange messages (RFC 4419).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init (fixed group and ECDH share
    /// the same message number). The 30-49 range is reused by the
    /// group-exchange method; see [`gex`].
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply.
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK / keyboard-interactive info request (method-specific
    /// reuse of 60).
    UserauthPkOk = 60,
    /// Keyboard-interactive info response (RFC 4256).
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use keel_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Group-exchange message numbers (RFC 4419). These live in the
/// method-specific 30-49 range and overlap the fixed-group assignments,
/// so they are raw constants rather than [`MessageType`] variants.
pub mod gex {
    /// SSH_MSG_KEX_DH_GEX_REQUEST (min, n, max).
    pub const REQUEST: u8 = 34;
    /// SSH_MSG_KEX_DH_GEX_GROUP (p, g).
    pub const GROUP: u8 = 31;
    /// SSH_MSG_KEX_DH_GEX_INIT (e).
    pub const INIT: u8 = 32;
    /// SSH_MSG_KEX_DH_GEX_REPLY (host key, f, signature).
    pub const REPLY: u8 = 33;
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect.
    HostNotAllowedToConnect = 1,
    /// Protocol error.
    ProtocolError = 2,
    /// Key exchange failed.
    KeyExchangeFailed = 3,
    /// Reserved.
    Reserved = 4,
    /// MAC verification failed.
    MacError = 5,
    /// Compression error.
    CompressionError = 6,
    /// Requested service not available.
    ServiceNotAvailable = 7,
    /// Protocol version not supported.
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable.
    HostKeyNotVerifiable = 9,
    /// Connection lost.
    ConnectionLost = 10,
    /// Disconnect by application.
    ByApplication = 11,
    /// Too many connections.
    TooManyConnections = 12,
    /// Authentication cancelled by user.
    AuthCancelledByUser = 13,
    /// No more authentication methods available.
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name.
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::Reserved),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::GlobalRequest as u8, 80);
        assert_eq!(MessageType::ChannelData as u8, 94);
    }

    #[test]
    fn test_message_type_display() {
        let msg = MessageType::KexInit;
        assert_eq!(format!("{}", msg), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_disconnect_reason() {
        assert_eq!(DisconnectReason::from_u32(2), Some(DisconnectReason::ProtocolError));
        assert_eq!(DisconnectReason::ProtocolError as u32, 2);
        assert_eq!(DisconnectReason::from_u32(99), None);
    }
}
