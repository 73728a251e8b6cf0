//! SFTP protocol messages and constants (secsh-filexfer drafts v3-v6).
//!
//! Wire framing is a length-prefixed packet:
//! ```text
//! uint32    length
//! byte      type
//! byte[n]   payload
//! ```
//!
//! Request payloads begin with a uint32 request id (except INIT, whose
//! id field carries the proposed version).

use crate::ssh::buffer::Buffer;
use keel_platform::{KeelError, KeelResult};

/// Lowest protocol version the server speaks.
pub const SFTP_V3: u32 = 3;
/// Highest protocol version the server speaks.
pub const SFTP_V6: u32 = 6;

/// Default bound on one SFTP read/write payload (16 KiB).
pub const DEFAULT_MAX_DATA_LENGTH: u32 = 16 * 1024;

/// Quick-check prefix size for the md5-hash extension.
pub const MD5_QUICK_HASH_SIZE: u64 = 2048;

/// Minimum block size accepted by check-file.
pub const MIN_CHKFILE_BLOCKSIZE: u32 = 256;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT
    Init = 1,
    /// SSH_FXP_VERSION
    Version = 2,
    /// SSH_FXP_OPEN
    Open = 3,
    /// SSH_FXP_CLOSE
    Close = 4,
    /// SSH_FXP_READ
    Read = 5,
    /// SSH_FXP_WRITE
    Write = 6,
    /// SSH_FXP_LSTAT
    LStat = 7,
    /// SSH_FXP_FSTAT
    FStat = 8,
    /// SSH_FXP_SETSTAT
    SetStat = 9,
    /// SSH_FXP_FSETSTAT
    FSetStat = 10,
    /// SSH_FXP_OPENDIR
    OpenDir = 11,
    /// SSH_FXP_READDIR
    ReadDir = 12,
    /// SSH_FXP_REMOVE
    Remove = 13,
    /// SSH_FXP_MKDIR
    MkDir = 14,
    /// SSH_FXP_RMDIR
    RmDir = 15,
    /// SSH_FXP_REALPATH
    RealPath = 16,
    /// SSH_FXP_STAT
    Stat = 17,
    /// SSH_FXP_RENAME
    Rename = 18,
    /// SSH_FXP_READLINK
    ReadLink = 19,
    /// SSH_FXP_SYMLINK (v3-v5; v6 uses LINK)
    Symlink = 20,
    /// SSH_FXP_LINK (v6)
    Link = 21,
    /// SSH_FXP_BLOCK (v6 byte-range lock)
    Block = 22,
    /// SSH_FXP_UNBLOCK (v6 byte-range unlock)
    Unblock = 23,
    /// SSH_FXP_STATUS
    Status = 101,
    /// SSH_FXP_HANDLE
    Handle = 102,
    /// SSH_FXP_DATA
    Data = 103,
    /// SSH_FXP_NAME
    Name = 104,
    /// SSH_FXP_ATTRS
    Attrs = 105,
    /// SSH_FXP_EXTENDED
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Converts from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            21 => Some(Self::Link),
            22 => Some(Self::Block),
            23 => Some(Self::Unblock),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }
}

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK
    Ok = 0,
    /// SSH_FX_EOF
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED
    PermissionDenied = 3,
    /// SSH_FX_FAILURE
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED
    OpUnsupported = 8,
    /// SSH_FX_INVALID_HANDLE
    InvalidHandle = 9,
    /// SSH_FX_NO_SUCH_PATH
    NoSuchPath = 10,
    /// SSH_FX_FILE_ALREADY_EXISTS
    FileAlreadyExists = 11,
    /// SSH_FX_WRITE_PROTECT
    WriteProtect = 12,
    /// SSH_FX_DIR_NOT_EMPTY
    DirNotEmpty = 18,
    /// SSH_FX_NOT_A_DIRECTORY
    NotADirectory = 19,
    /// SSH_FX_INVALID_FILENAME
    InvalidFilename = 20,
    /// SSH_FX_LINK_LOOP
    LinkLoop = 21,
    /// SSH_FX_BYTE_RANGE_LOCK_CONFLICT
    ByteRangeLockConflict = 25,
    /// SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK
    NoMatchingByteRangeLock = 31,
}

impl StatusCode {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            9 => Some(Self::InvalidHandle),
            10 => Some(Self::NoSuchPath),
            11 => Some(Self::FileAlreadyExists),
            12 => Some(Self::WriteProtect),
            18 => Some(Self::DirNotEmpty),
            19 => Some(Self::NotADirectory),
            20 => Some(Self::InvalidFilename),
            21 => Some(Self::LinkLoop),
            25 => Some(Self::ByteRangeLockConflict),
            31 => Some(Self::NoMatchingByteRangeLock),
            _ => None,
        }
    }

    /// Human-readable default message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
            Self::InvalidHandle => "Invalid handle",
            Self::NoSuchPath => "No such path",
            Self::FileAlreadyExists => "File already exists",
            Self::WriteProtect => "Write protected",
            Self::DirNotEmpty => "Directory not empty",
            Self::NotADirectory => "Not a directory",
            Self::InvalidFilename => "Invalid filename",
            Self::LinkLoop => "Link loop",
            Self::ByteRangeLockConflict => "Byte-range lock conflict",
            Self::NoMatchingByteRangeLock => "No matching byte-range lock",
        }
    }

    /// Maps an error to the status code reported to the client.
    pub fn from_error(err: &KeelError) -> Self {
        match err {
            KeelError::Io(io) => match io.kind() {
                std::io::ErrorKind::NotFound => Self::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => Self::FileAlreadyExists,
                std::io::ErrorKind::DirectoryNotEmpty => Self::DirNotEmpty,
                std::io::ErrorKind::NotADirectory => Self::NotADirectory,
                std::io::ErrorKind::Unsupported => Self::OpUnsupported,
                _ => Self::Failure,
            },
            KeelError::NotImplemented(_) => Self::OpUnsupported,
            KeelError::Resource(_) => Self::Failure,
            _ => Self::Failure,
        }
    }
}

/// v3 open pflags (SSH_FXF_*).
pub mod pflags {
    /// SSH_FXF_READ
    pub const READ: u32 = 0x0000_0001;
    /// SSH_FXF_WRITE
    pub const WRITE: u32 = 0x0000_0002;
    /// SSH_FXF_APPEND
    pub const APPEND: u32 = 0x0000_0004;
    /// SSH_FXF_CREAT
    pub const CREAT: u32 = 0x0000_0008;
    /// SSH_FXF_TRUNC
    pub const TRUNC: u32 = 0x0000_0010;
    /// SSH_FXF_EXCL
    pub const EXCL: u32 = 0x0000_0020;
}

/// v5+ open flags: disposition in the low 3 bits plus modifiers.
pub mod open_flags {
    /// Mask over the access disposition bits.
    pub const ACCESS_DISPOSITION: u32 = 0x0000_0007;
    /// SSH_FXF_CREATE_NEW
    pub const CREATE_NEW: u32 = 0x0000_0000;
    /// SSH_FXF_CREATE_TRUNCATE
    pub const CREATE_TRUNCATE: u32 = 0x0000_0001;
    /// SSH_FXF_OPEN_EXISTING
    pub const OPEN_EXISTING: u32 = 0x0000_0002;
    /// SSH_FXF_OPEN_OR_CREATE
    pub const OPEN_OR_CREATE: u32 = 0x0000_0003;
    /// SSH_FXF_TRUNCATE_EXISTING
    pub const TRUNCATE_EXISTING: u32 = 0x0000_0004;
    /// SSH_FXF_APPEND_DATA
    pub const APPEND_DATA: u32 = 0x0000_0008;
    /// SSH_FXF_APPEND_DATA_ATOMIC
    pub const APPEND_DATA_ATOMIC: u32 = 0x0000_0010;
}

/// ACE4 access-mask bits used by v5+ opens and extension checks.
pub mod ace4 {
    /// ACE4_READ_DATA
    pub const READ_DATA: u32 = 0x0000_0001;
    /// ACE4_WRITE_DATA
    pub const WRITE_DATA: u32 = 0x0000_0002;
    /// ACE4_APPEND_DATA
    pub const APPEND_DATA: u32 = 0x0000_0004;
    /// ACE4_READ_ATTRIBUTES
    pub const READ_ATTRIBUTES: u32 = 0x0000_0080;
    /// ACE4_WRITE_ATTRIBUTES
    pub const WRITE_ATTRIBUTES: u32 = 0x0000_0100;
}

/// v5+ rename flag bits.
pub mod rename_flags {
    /// SSH_FXF_RENAME_OVERWRITE
    pub const OVERWRITE: u32 = 0x0000_0001;
    /// SSH_FXF_RENAME_ATOMIC
    pub const ATOMIC: u32 = 0x0000_0002;
    /// SSH_FXF_RENAME_NATIVE
    pub const NATIVE: u32 = 0x0000_0004;
}

/// v6 REALPATH control bytes.
pub mod realpath_control {
    /// SSH_FXP_REALPATH_NO_CHECK
    pub const NO_CHECK: u8 = 0x01;
    /// SSH_FXP_REALPATH_STAT_IF
    pub const STAT_IF: u8 = 0x02;
    /// SSH_FXP_REALPATH_STAT_ALWAYS
    pub const STAT_ALWAYS: u8 = 0x03;
}

/// Extension names understood by the subsystem.
pub mod extensions {
    /// Must be the client's first request when used.
    pub const VERSION_SELECT: &str = "version-select";
    /// Server-side file copy.
    pub const COPY_FILE: &str = "copy-file";
    /// Server-side range copy between handles.
    pub const COPY_DATA: &str = "copy-data";
    /// Whole/partial file MD5 with quick-check.
    pub const MD5_HASH: &str = "md5-hash";
    /// md5-hash addressed by handle.
    pub const MD5_HASH_HANDLE: &str = "md5-hash-handle";
    /// Block-hash stream addressed by handle.
    pub const CHECK_FILE_HANDLE: &str = "check-file-handle";
    /// Block-hash stream addressed by name.
    pub const CHECK_FILE_NAME: &str = "check-file-name";
    /// Reply name used for both check-file forms.
    pub const CHECK_FILE: &str = "check-file";
    /// Filesystem free-space query.
    pub const SPACE_AVAILABLE: &str = "space-available";
    /// Acknowledged but unimplemented.
    pub const TEXT_SEEK: &str = "text-seek";
    /// OpenSSH fsync.
    pub const FSYNC_OPENSSH: &str = "fsync@openssh.com";
}

/// One framed SFTP packet.
#[derive(Debug, Clone)]
pub struct SftpMessage {
    /// Message type
    pub msg_type: SftpMessageType,
    /// Message payload (after the type byte)
    pub payload: Vec<u8>,
}

impl SftpMessage {
    /// Creates a new SFTP message.
    pub fn new(msg_type: SftpMessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Serializes to bytes including the length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::with_capacity(5 + self.payload.len());
        buf.put_u32(self.payload.len() as u32 + 1);
        buf.put_u8(self.msg_type as u8);
        buf.put_raw(&self.payload);
        buf.into_bytes()
    }

    /// Parses one message from a byte slice holding exactly one packet.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let length = buf.get_u32()? as usize;
        if length == 0 || buf.remaining() < length {
            return Err(KeelError::Protocol("SFTP message incomplete".to_string()));
        }
        let type_byte = buf.get_u8()?;
        let msg_type = SftpMessageType::from_u8(type_byte).ok_or_else(|| {
            KeelError::Protocol(format!("Unknown SFTP message type: {}", type_byte))
        })?;
        let payload = buf.get_raw(length - 1)?;
        Ok(Self { msg_type, payload })
    }
}

/// Incremental parser over a byte stream of SFTP packets.
#[derive(Debug, Default)]
pub struct SftpFramer {
    pending: Vec<u8>,
}

impl SftpFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends stream bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pops the next complete packet, if one is buffered. The raw type
    /// byte is preserved so unknown opcodes can be answered with
    /// OP_UNSUPPORTED instead of tearing the stream down.
    pub fn next_packet(&mut self) -> KeelResult<Option<(u8, Vec<u8>)>> {
        if self.pending.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;
        if length == 0 {
            return Err(KeelError::Protocol("Zero-length SFTP packet".to_string()));
        }
        if self.pending.len() < 4 + length {
            return Ok(None);
        }
        let type_byte = self.pending[4];
        let payload = self.pending[5..4 + length].to_vec();
        self.pending.drain(..4 + length);
        Ok(Some((type_byte, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(22), Some(SftpMessageType::Block));
        assert_eq!(SftpMessageType::from_u8(101), Some(SftpMessageType::Status));
        assert_eq!(SftpMessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_round_trip() {
        let msg = SftpMessage::new(SftpMessageType::Init, vec![0, 0, 0, 6]);
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);

        let parsed = SftpMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.msg_type, SftpMessageType::Init);
        assert_eq!(parsed.payload, vec![0, 0, 0, 6]);
    }

    #[test]
    fn test_framer_reassembles_split_packets() {
        let msg = SftpMessage::new(SftpMessageType::Stat, b"payload".to_vec());
        let bytes = msg.to_bytes();

        let mut framer = SftpFramer::new();
        framer.extend(&bytes[..3]);
        assert!(framer.next_packet().unwrap().is_none());
        framer.extend(&bytes[3..]);

        let (type_byte, payload) = framer.next_packet().unwrap().unwrap();
        assert_eq!(type_byte, SftpMessageType::Stat as u8);
        assert_eq!(payload, b"payload");
        assert!(framer.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_framer_multiple_packets() {
        let mut framer = SftpFramer::new();
        framer.extend(&SftpMessage::new(SftpMessageType::Init, vec![1]).to_bytes());
        framer.extend(&SftpMessage::new(SftpMessageType::Close, vec![2]).to_bytes());

        assert_eq!(framer.next_packet().unwrap().unwrap().0, 1);
        assert_eq!(framer.next_packet().unwrap().unwrap().0, 4);
        assert!(framer.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_framer_preserves_unknown_types(){
        let mut framer = SftpFramer::new();
        framer.extend(&[0, 0, 0, 2, 250, 0xaa]);
        let (type_byte, payload) = framer.next_packet().unwrap().unwrap();
        assert_eq!(type_byte, 250);
        assert_eq!(payload, vec![0xaa]);
    }

    #[test]
    fn test_status_from_error() {
        let not_found = KeelError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert_eq!(StatusCode::from_error(&not_found), StatusCode::NoSuchFile);

        let denied = KeelError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        assert_eq!(StatusCode::from_error(&denied), StatusCode::PermissionDenied);

        let unsupported = KeelError::NotImplemented("text-seek".to_string());
        assert_eq!(StatusCode::from_error(&unsupported), StatusCode::OpUnsupported);

        let other = KeelError::Protocol("x".to_string());
        assert_eq!(StatusCode::from_error(&other), StatusCode::Failure);
    }

    #[test]
    fn test_status_code_round_trip() {
        assert_eq!(StatusCode::from_u32(31), Some(StatusCode::NoMatchingByteRangeLock));
        assert_eq!(StatusCode::NoMatchingByteRangeLock as u32, 31);
        assert_eq!(StatusCode::from_u32(999), None);
    }
}
