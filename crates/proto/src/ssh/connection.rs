//! SSH connection protocol wire messages (RFC 4254).
//!
//! Message codecs for the channel layer:
//! - Channel lifecycle: open, confirmation, failure, EOF, close
//! - Channel data: data, extended data (stderr), window adjust
//! - Channel requests: pty-req, env, exec, shell, subsystem,
//!   window-change, exit-status, exit-signal
//! - Global requests: tcpip-forward, cancel-tcpip-forward
//!
//! The multiplexing service that routes these messages lives in
//! [`mux`](crate::ssh::mux).
//!
//! # Security
//!
//! - Window sizes and packet sizes from CHANNEL_OPEN are bounded
//! - Channel numbers are validated by the multiplexer before dispatch
//! - Unknown request types are preserved (not errors) so the service can
//!   answer CHANNEL_FAILURE / REQUEST_FAILURE per the RFC

use crate::ssh::buffer::Buffer;
use crate::ssh::message::MessageType;
use keel_platform::{KeelError, KeelResult};

/// Maximum window size accepted in CHANNEL_OPEN (16 MiB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum packet size accepted in CHANNEL_OPEN (256 KiB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

fn expect_type(buf: &mut Buffer, expected: MessageType) -> KeelResult<()> {
    let got = buf.get_u8()?;
    if got != expected as u8 {
        return Err(KeelError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected as u8,
            expected.name(),
            got
        )));
    }
    Ok(())
}

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (client-initiated port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (server-initiated, bound by tcpip-forward).
    ForwardedTcpip {
        /// Address the listener was bound to
        connected_address: String,
        /// Port the listener was bound to
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        buf.put_str(self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                buf.put_str(host);
                buf.put_u32(*port);
                buf.put_str(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                buf.put_str(connected_address);
                buf.put_u32(*connected_port);
                buf.put_str(originator_address);
                buf.put_u32(*originator_port);
            }
        }

        buf.into_bytes()
    }

    /// Parses from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] for malformed data and
    /// [`KeelError::Channel`] for an unknown channel type (the caller
    /// answers OPEN_FAILURE rather than dropping the session).
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelOpen)?;

        let type_name = buf.get_string_utf8()?;
        let sender_channel = buf.get_u32()?;
        let initial_window_size = buf.get_u32()?;
        let maximum_packet_size = buf.get_u32()?;

        if initial_window_size > MAX_WINDOW_SIZE {
            return Err(KeelError::Protocol(format!(
                "Initial window size {} exceeds maximum {}",
                initial_window_size, MAX_WINDOW_SIZE
            )));
        }
        if maximum_packet_size > MAX_PACKET_SIZE {
            return Err(KeelError::Protocol(format!(
                "Maximum packet size {} exceeds maximum {}",
                maximum_packet_size, MAX_PACKET_SIZE
            )));
        }

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: buf.get_string_utf8()?,
                port: buf.get_u32()?,
                originator_address: buf.get_string_utf8()?,
                originator_port: buf.get_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: buf.get_string_utf8()?,
                connected_port: buf.get_u32()?,
                originator_address: buf.get_string_utf8()?,
                originator_port: buf.get_u32()?,
            },
            _ => {
                return Err(KeelError::Channel(format!(
                    "Unsupported channel type: '{}'",
                    type_name
                )))
            }
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation message.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            sender_channel: buf.get_u32()?,
            initial_window_size: buf.get_u32()?,
            maximum_packet_size: buf.get_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: ChannelOpenFailureReason,
    description: String,
    language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a new channel open failure message.
    pub fn new(recipient_channel: u32, reason_code: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: reason_code.as_str().to_string(),
            language_tag: String::new(),
        }
    }

    /// Creates a new channel open failure with custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason_code: ChannelOpenFailureReason,
        description: String,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description,
            language_tag: String::new(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the reason code.
    pub fn reason_code(&self) -> ChannelOpenFailureReason {
        self.reason_code
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code as u32);
        buf.put_str(&self.description);
        buf.put_str(&self.language_tag);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelOpenFailure)?;

        let recipient_channel = buf.get_u32()?;
        let reason_code_u32 = buf.get_u32()?;
        let description = buf.get_string_utf8()?;
        let language_tag = buf.get_string_utf8()?;

        let reason_code = ChannelOpenFailureReason::from_u32(reason_code_u32).ok_or_else(|| {
            KeelError::Protocol(format!("Invalid failure reason code: {}", reason_code_u32))
        })?;

        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language_tag,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            bytes_to_add: buf.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new channel data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_string(&self.data);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
            data: buf.get_string()?,
        })
    }
}

/// Extended data type code (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtendedDataType {
    /// Stderr data
    Stderr = 1,
}

impl ExtendedDataType {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: ExtendedDataType,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new channel extended data message.
    pub fn new(recipient_channel: u32, data_type_code: ExtendedDataType, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code.
    pub fn data_type_code(&self) -> ExtendedDataType {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code as u32);
        buf.put_string(&self.data);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelExtendedData)?;
        let recipient_channel = buf.get_u32()?;
        let code = buf.get_u32()?;
        let data_type_code = ExtendedDataType::from_u32(code).ok_or_else(|| {
            KeelError::Protocol(format!("Invalid extended data type: {}", code))
        })?;
        Ok(Self {
            recipient_channel,
            data_type_code,
            data: buf.get_string()?,
        })
    }
}

/// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    recipient_channel: u32,
}

impl ChannelEof {
    /// Creates a new channel EOF message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelEof as u8);
        buf.put_u32(self.recipient_channel);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelEof)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    recipient_channel: u32,
}

impl ChannelClose {
    /// Creates a new channel close message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelClose as u8);
        buf.put_u32(self.recipient_channel);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelClose)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
        })
    }
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal dimensions changed
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// A request type this implementation does not know. Kept so the
    /// service can reply CHANNEL_FAILURE without killing the session.
    Unknown {
        /// Request type name
        name: String,
        /// Raw request payload
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_str(self.request_type.name());
        buf.put_bool(self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                buf.put_str(term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                buf.put_string(modes);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_str(name);
                buf.put_str(value);
            }
            ChannelRequestType::Exec { command } => {
                buf.put_str(command);
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => {
                buf.put_str(name);
            }
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::ExitStatus { exit_status } => {
                buf.put_u32(*exit_status);
            }
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                buf.put_str(signal_name);
                buf.put_bool(*core_dumped);
                buf.put_str(error_message);
                buf.put_str(language_tag);
            }
            ChannelRequestType::Unknown { data, .. } => {
                buf.put_raw(data);
            }
        }

        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelRequest)?;

        let recipient_channel = buf.get_u32()?;
        let request_name = buf.get_string_utf8()?;
        let want_reply = buf.get_bool()?;

        let request_type = match request_name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: buf.get_string_utf8()?,
                width_chars: buf.get_u32()?,
                height_rows: buf.get_u32()?,
                width_pixels: buf.get_u32()?,
                height_pixels: buf.get_u32()?,
                modes: buf.get_string()?,
            },
            "env" => ChannelRequestType::Env {
                name: buf.get_string_utf8()?,
                value: buf.get_string_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: buf.get_string_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: buf.get_string_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: buf.get_u32()?,
                height_rows: buf.get_u32()?,
                width_pixels: buf.get_u32()?,
                height_pixels: buf.get_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: buf.get_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: buf.get_string_utf8()?,
                core_dumped: buf.get_bool()?,
                error_message: buf.get_string_utf8()?,
                language_tag: buf.get_string_utf8()?,
            },
            _ => {
                let remaining = buf.remaining();
                ChannelRequestType::Unknown {
                    name: request_name,
                    data: buf.get_raw(remaining)?,
                }
            }
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    recipient_channel: u32,
}

impl ChannelSuccess {
    /// Creates a new channel success message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelSuccess as u8);
        buf.put_u32(self.recipient_channel);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelSuccess)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    recipient_channel: u32,
}

impl ChannelFailure {
    /// Creates a new channel failure message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::ChannelFailure)?;
        Ok(Self {
            recipient_channel: buf.get_u32()?,
        })
    }
}

/// Global request type (RFC 4254 Section 4 / Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Bind a listener for forwarded-tcpip channels.
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind (0 = server chooses)
        port: u32,
    },
    /// Cancel a previous tcpip-forward.
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// A request type this implementation does not know.
    Unknown {
        /// Request type name
        name: String,
        /// Raw request payload
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    request_type: GlobalRequestType,
    want_reply: bool,
}

impl GlobalRequest {
    /// Creates a new global request.
    pub fn new(request_type: GlobalRequestType, want_reply: bool) -> Self {
        Self {
            request_type,
            want_reply,
        }
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &GlobalRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        buf.put_str(self.request_type.name());
        buf.put_bool(self.want_reply);

        match &self.request_type {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                buf.put_str(address);
                buf.put_u32(*port);
            }
            GlobalRequestType::Unknown { data, .. } => {
                buf.put_raw(data);
            }
        }

        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::GlobalRequest)?;

        let request_name = buf.get_string_utf8()?;
        let want_reply = buf.get_bool()?;

        let request_type = match request_name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: buf.get_string_utf8()?,
                port: buf.get_u32()?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: buf.get_string_utf8()?,
                port: buf.get_u32()?,
            },
            _ => {
                let remaining = buf.remaining();
                GlobalRequestType::Unknown {
                    name: request_name,
                    data: buf.get_raw(remaining)?,
                }
            }
        };

        Ok(Self {
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS message. Carries the bound port for a
/// tcpip-forward request with port 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSuccess {
    /// Response payload (empty or uint32 bound port).
    pub data: Vec<u8>,
}

impl RequestSuccess {
    /// Success with no payload.
    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }

    /// Success carrying the port actually bound.
    pub fn with_port(port: u32) -> Self {
        Self {
            data: port.to_be_bytes().to_vec(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::RequestSuccess as u8);
        buf.put_raw(&self.data);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        expect_type(&mut buf, MessageType::RequestSuccess)?;
        let remaining = buf.remaining();
        Ok(Self {
            data: buf.get_raw(remaining)?,
        })
    }

    /// Reads the payload as a bound port, when present.
    pub fn port(&self) -> Option<u32> {
        if self.data.len() == 4 {
            Some(u32::from_be_bytes([
                self.data[0],
                self.data[1],
                self.data[2],
                self.data[3],
            ]))
        } else {
            None
        }
    }
}

/// SSH_MSG_REQUEST_FAILURE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFailure;

impl RequestFailure {
    /// Creates the message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::RequestFailure as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelOpen::new(ChannelType::Session, 0, 1048576, 32768);

        let bytes = open.to_bytes();
        let parsed = ChannelOpen::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.channel_type(), &ChannelType::Session);
        assert_eq!(parsed.sender_channel(), 0);
        assert_eq!(parsed.initial_window_size(), 1048576);
        assert_eq!(parsed.maximum_packet_size(), 32768);
    }

    #[test]
    fn test_channel_open_direct_tcpip() {
        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "example.com".to_string(),
                port: 80,
                originator_address: "192.168.1.1".to_string(),
                originator_port: 12345,
            },
            1,
            1048576,
            32768,
        );

        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        match parsed.channel_type() {
            ChannelType::DirectTcpip { host, port, .. } => {
                assert_eq!(host, "example.com");
                assert_eq!(*port, 80);
            }
            other => panic!("Expected DirectTcpip, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_open_unknown_type_is_channel_error() {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        buf.put_str("x11");
        buf.put_u32(0);
        buf.put_u32(1024);
        buf.put_u32(512);
        let err = ChannelOpen::from_bytes(&buf.into_bytes()).unwrap_err();
        assert!(matches!(err, KeelError::Channel(_)));
    }

    #[test]
    fn test_channel_open_window_validation() {
        let open = ChannelOpen::new(ChannelType::Session, 0, MAX_WINDOW_SIZE + 1, 32768);
        assert!(ChannelOpen::from_bytes(&open.to_bytes()).is_err());

        let open = ChannelOpen::new(ChannelType::Session, 0, 1024, MAX_PACKET_SIZE + 1);
        assert!(ChannelOpen::from_bytes(&open.to_bytes()).is_err());
    }

    #[test]
    fn test_channel_open_confirmation_round_trip() {
        let confirm = ChannelOpenConfirmation::new(0, 1, 1048576, 32768);
        let parsed = ChannelOpenConfirmation::from_bytes(&confirm.to_bytes()).unwrap();
        assert_eq!(parsed, confirm);
    }

    #[test]
    fn test_channel_open_failure_round_trip() {
        let failure =
            ChannelOpenFailure::new(7, ChannelOpenFailureReason::AdministrativelyProhibited);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 7);
        assert_eq!(
            parsed.reason_code(),
            ChannelOpenFailureReason::AdministrativelyProhibited
        );
    }

    #[test]
    fn test_channel_data_round_trip() {
        let data = ChannelData::new(3, b"Hello, SSH!".to_vec());
        let parsed = ChannelData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 3);
        assert_eq!(parsed.data(), b"Hello, SSH!");
    }

    #[test]
    fn test_channel_extended_data_round_trip() {
        let data = ChannelExtendedData::new(0, ExtendedDataType::Stderr, b"Error!".to_vec());
        let parsed = ChannelExtendedData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed.data_type_code(), ExtendedDataType::Stderr);
        assert_eq!(parsed.data(), b"Error!");
    }

    #[test]
    fn test_window_adjust_round_trip() {
        let adjust = ChannelWindowAdjust::new(2, 32768);
        let parsed = ChannelWindowAdjust::from_bytes(&adjust.to_bytes()).unwrap();
        assert_eq!(parsed.bytes_to_add(), 32768);
    }

    #[test]
    fn test_eof_close_round_trip() {
        assert_eq!(
            ChannelEof::from_bytes(&ChannelEof::new(5).to_bytes())
                .unwrap()
                .recipient_channel(),
            5
        );
        assert_eq!(
            ChannelClose::from_bytes(&ChannelClose::new(5).to_bytes())
                .unwrap()
                .recipient_channel(),
            5
        );
    }

    #[test]
    fn test_channel_request_exec() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::Exec {
                command: "ls -la".to_string(),
            },
            true,
        );

        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert!(parsed.want_reply());
        match parsed.request_type() {
            ChannelRequestType::Exec { command } => assert_eq!(command, "ls -la"),
            other => panic!("Expected Exec, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_request_pty() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::PtyReq {
                term: "xterm".to_string(),
                width_chars: 80,
                height_rows: 24,
                width_pixels: 640,
                height_pixels: 480,
                modes: vec![0],
            },
            true,
        );

        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        match parsed.request_type() {
            ChannelRequestType::PtyReq {
                term, width_chars, ..
            } => {
                assert_eq!(term, "xterm");
                assert_eq!(*width_chars, 80);
            }
            other => panic!("Expected PtyReq, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_request_window_change() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::WindowChange {
                width_chars: 120,
                height_rows: 40,
                width_pixels: 0,
                height_pixels: 0,
            },
            false,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        match parsed.request_type() {
            ChannelRequestType::WindowChange { width_chars, .. } => assert_eq!(*width_chars, 120),
            other => panic!("Expected WindowChange, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_request_unknown_preserved() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::Unknown {
                name: "auth-agent-req@openssh.com".to_string(),
                data: vec![],
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.request_type().name(), "auth-agent-req@openssh.com");
    }

    #[test]
    fn test_channel_request_exit_signal() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::ExitSignal {
                signal_name: "TERM".to_string(),
                core_dumped: false,
                error_message: "terminated".to_string(),
                language_tag: String::new(),
            },
            false,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        match parsed.request_type() {
            ChannelRequestType::ExitSignal { signal_name, .. } => {
                assert_eq!(signal_name, "TERM")
            }
            other => panic!("Expected ExitSignal, got {:?}", other),
        }
    }

    #[test]
    fn test_global_request_tcpip_forward() {
        let request = GlobalRequest::new(
            GlobalRequestType::TcpipForward {
                address: "0.0.0.0".to_string(),
                port: 0,
            },
            true,
        );
        let parsed = GlobalRequest::from_bytes(&request.to_bytes()).unwrap();
        match parsed.request_type() {
            GlobalRequestType::TcpipForward { address, port } => {
                assert_eq!(address, "0.0.0.0");
                assert_eq!(*port, 0);
            }
            other => panic!("Expected TcpipForward, got {:?}", other),
        }
    }

    #[test]
    fn test_request_success_port() {
        let ok = RequestSuccess::with_port(42022);
        let parsed = RequestSuccess::from_bytes(&ok.to_bytes()).unwrap();
        assert_eq!(parsed.port(), Some(42022));
        assert_eq!(RequestSuccess::empty().port(), None);
    }
}
