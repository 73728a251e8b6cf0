//! SFTP client operations for the round-trip test suite.
//!
//! Speaks to any SFTP server over a channel writer (requests out) and a
//! channel stdin (replies in); the SSH client wires it to a "sftp"
//! subsystem channel. Covers the operations the server tests exercise,
//! not the full client surface.

use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{ChannelStdin, ChannelWriter};
use crate::ssh::sftp::attrs::FileAttributes;
use crate::ssh::sftp::message::{
    extensions, open_flags, pflags, SftpFramer, SftpMessage, SftpMessageType, StatusCode,
};
use keel_platform::{KeelError, KeelResult};
use std::collections::HashMap;
use tracing::debug;

/// How the client wants a file opened; translated per protocol version.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Writes append.
    pub append: bool,
    /// Create; fail if the path exists.
    pub create_new: bool,
    /// Create or truncate.
    pub create_truncate: bool,
    /// Create if missing.
    pub create: bool,
    /// Truncate an existing file.
    pub truncate: bool,
}

impl OpenOptions {
    /// Read-only open.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Write-only open creating a fresh file (CREATE_NEW | WRITE).
    pub fn write_new() -> Self {
        Self {
            write: true,
            create_new: true,
            ..Self::default()
        }
    }

    fn v3_pflags(&self) -> u32 {
        let mut flags = 0;
        if self.read {
            flags |= pflags::READ;
        }
        if self.write {
            flags |= pflags::WRITE;
        }
        if self.append {
            flags |= pflags::APPEND;
        }
        if self.create_new {
            flags |= pflags::CREAT | pflags::EXCL;
        }
        if self.create_truncate {
            flags |= pflags::CREAT | pflags::TRUNC;
        }
        if self.create {
            flags |= pflags::CREAT;
        }
        if self.truncate {
            flags |= pflags::TRUNC;
        }
        flags
    }

    fn v5_flags(&self) -> (u32, u32) {
        use crate::ssh::sftp::message::ace4;

        let mut access = 0;
        if self.read {
            access |= ace4::READ_DATA | ace4::READ_ATTRIBUTES;
        }
        if self.write {
            access |= ace4::WRITE_DATA | ace4::WRITE_ATTRIBUTES;
        }
        if self.append {
            access |= ace4::APPEND_DATA;
        }

        let mut flags = if self.create_new {
            open_flags::CREATE_NEW
        } else if self.create_truncate {
            open_flags::CREATE_TRUNCATE
        } else if self.create {
            open_flags::OPEN_OR_CREATE
        } else if self.truncate {
            open_flags::TRUNCATE_EXISTING
        } else {
            open_flags::OPEN_EXISTING
        };
        if self.append {
            flags |= open_flags::APPEND_DATA;
        }
        (flags, access)
    }
}

/// SFTP client over a subsystem channel.
pub struct SftpClient {
    writer: ChannelWriter,
    stdin: ChannelStdin,
    framer: SftpFramer,
    version: u32,
    next_id: u32,
    /// Extensions advertised by the server in VERSION.
    server_extensions: HashMap<String, Vec<u8>>,
}

impl SftpClient {
    /// Creates a client over an established subsystem channel.
    pub fn new(writer: ChannelWriter, stdin: ChannelStdin) -> Self {
        Self {
            writer,
            stdin,
            framer: SftpFramer::new(),
            version: 0,
            next_id: 0,
            server_extensions: HashMap::new(),
        }
    }

    /// Negotiated protocol version (after [`init`](Self::init)).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extensions the server advertised.
    pub fn server_extensions(&self) -> &HashMap<String, Vec<u8>> {
        &self.server_extensions
    }

    fn take_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    async fn send(&self, msg_type: SftpMessageType, payload: Vec<u8>) -> KeelResult<()> {
        self.writer
            .write(&SftpMessage::new(msg_type, payload).to_bytes())
            .await
    }

    async fn recv(&mut self) -> KeelResult<(u8, Vec<u8>)> {
        loop {
            if let Some(packet) = self.framer.next_packet()? {
                return Ok(packet);
            }
            let Some(chunk) = self.stdin.recv().await else {
                return Err(KeelError::Protocol(
                    "SFTP channel closed mid-request".to_string(),
                ));
            };
            self.framer.extend(&chunk);
        }
    }

    /// Waits for the reply to `id`.
    async fn recv_reply(&mut self, id: u32) -> KeelResult<(SftpMessageType, Buffer)> {
        loop {
            let (type_byte, payload) = self.recv().await?;
            let msg_type = SftpMessageType::from_u8(type_byte).ok_or_else(|| {
                KeelError::Protocol(format!("Unknown SFTP reply type: {}", type_byte))
            })?;
            let mut buf = Buffer::from(payload);
            let reply_id = buf.get_u32()?;
            if reply_id == id {
                return Ok((msg_type, buf));
            }
            debug!(reply_id, expected = id, "discarding out-of-order SFTP reply");
        }
    }

    fn status_error(code: StatusCode, message: String) -> KeelError {
        match code {
            StatusCode::NoSuchFile | StatusCode::NoSuchPath => KeelError::Io(
                std::io::Error::new(std::io::ErrorKind::NotFound, message),
            ),
            StatusCode::PermissionDenied => KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                message,
            )),
            StatusCode::FileAlreadyExists => KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                message,
            )),
            StatusCode::OpUnsupported => KeelError::NotImplemented(message),
            _ => KeelError::Channel(format!("SFTP status {:?}: {}", code, message)),
        }
    }

    /// Parses a STATUS reply, mapping non-OK codes to errors.
    fn check_status(mut buf: Buffer) -> KeelResult<()> {
        let code = buf.get_u32()?;
        let message = buf.get_string_utf8().unwrap_or_default();
        match StatusCode::from_u32(code) {
            Some(StatusCode::Ok) => Ok(()),
            Some(code) => Err(Self::status_error(code, message)),
            None => Err(KeelError::Protocol(format!(
                "Unknown SFTP status code: {}",
                code
            ))),
        }
    }

    async fn expect_status(&mut self, id: u32) -> KeelResult<()> {
        let (msg_type, buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::Status => Self::check_status(buf),
            other => Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_STATUS, got {:?}",
                other
            ))),
        }
    }

    /// Negotiates the protocol version.
    pub async fn init(&mut self, proposed: u32) -> KeelResult<u32> {
        let mut payload = Buffer::new();
        payload.put_u32(proposed);
        self.send(SftpMessageType::Init, payload.into_bytes()).await?;

        let (type_byte, payload) = self.recv().await?;
        if type_byte != SftpMessageType::Version as u8 {
            return Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_VERSION, got {}",
                type_byte
            )));
        }
        let mut buf = Buffer::from(payload);
        self.version = buf.get_u32()?;
        while buf.remaining() > 0 {
            let name = buf.get_string_utf8()?;
            let data = buf.get_string()?;
            self.server_extensions.insert(name, data);
        }
        Ok(self.version)
    }

    /// Opens a file, returning the handle.
    pub async fn open(&mut self, path: &str, options: OpenOptions) -> KeelResult<Vec<u8>> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(path);
        if self.version >= 5 {
            let (flags, access) = options.v5_flags();
            payload.put_u32(access);
            payload.put_u32(flags);
        } else {
            payload.put_u32(options.v3_pflags());
        }
        FileAttributes::new().encode(self.version, &mut payload);
        self.send(SftpMessageType::Open, payload.into_bytes()).await?;

        let (msg_type, mut buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::Handle => buf.get_string(),
            SftpMessageType::Status => {
                Self::check_status(buf)?;
                Err(KeelError::Protocol("OPEN answered OK status".to_string()))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected OPEN reply: {:?}",
                other
            ))),
        }
    }

    /// Closes a handle.
    pub async fn close(&mut self, handle: &[u8]) -> KeelResult<()> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_string(handle);
        self.send(SftpMessageType::Close, payload.into_bytes()).await?;
        self.expect_status(id).await
    }

    /// Reads at `offset`; `Ok(None)` signals EOF.
    pub async fn read(
        &mut self,
        handle: &[u8],
        offset: u64,
        length: u32,
    ) -> KeelResult<Option<Vec<u8>>> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_string(handle);
        payload.put_u64(offset);
        payload.put_u32(length);
        self.send(SftpMessageType::Read, payload.into_bytes()).await?;

        let (msg_type, mut buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::Data => Ok(Some(buf.get_string()?)),
            SftpMessageType::Status => {
                let code = buf.get_u32()?;
                let message = buf.get_string_utf8().unwrap_or_default();
                match StatusCode::from_u32(code) {
                    Some(StatusCode::Eof) => Ok(None),
                    Some(StatusCode::Ok) => Ok(Some(Vec::new())),
                    Some(code) => Err(Self::status_error(code, message)),
                    None => Err(KeelError::Protocol(format!(
                        "Unknown SFTP status code: {}",
                        code
                    ))),
                }
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected READ reply: {:?}",
                other
            ))),
        }
    }

    /// Writes `data` at `offset`.
    pub async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> KeelResult<()> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_string(handle);
        payload.put_u64(offset);
        payload.put_string(data);
        self.send(SftpMessageType::Write, payload.into_bytes()).await?;
        self.expect_status(id).await
    }

    async fn path_attrs(
        &mut self,
        msg_type: SftpMessageType,
        path: &str,
    ) -> KeelResult<FileAttributes> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(path);
        self.send(msg_type, payload.into_bytes()).await?;

        let version = self.version;
        let (reply_type, mut buf) = self.recv_reply(id).await?;
        match reply_type {
            SftpMessageType::Attrs => FileAttributes::decode(version, &mut buf),
            SftpMessageType::Status => {
                Self::check_status(buf)?;
                Err(KeelError::Protocol("STAT answered OK status".to_string()))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected STAT reply: {:?}",
                other
            ))),
        }
    }

    /// Retrieves attributes, following symlinks.
    pub async fn stat(&mut self, path: &str) -> KeelResult<FileAttributes> {
        self.path_attrs(SftpMessageType::Stat, path).await
    }

    /// Retrieves attributes without following symlinks.
    pub async fn lstat(&mut self, path: &str) -> KeelResult<FileAttributes> {
        self.path_attrs(SftpMessageType::LStat, path).await
    }

    /// Applies attributes to a path.
    pub async fn setstat(&mut self, path: &str, attrs: &FileAttributes) -> KeelResult<()> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(path);
        attrs.encode(self.version, &mut payload);
        self.send(SftpMessageType::SetStat, payload.into_bytes())
            .await?;
        self.expect_status(id).await
    }

    /// Opens a directory for reading.
    pub async fn opendir(&mut self, path: &str) -> KeelResult<Vec<u8>> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(path);
        self.send(SftpMessageType::OpenDir, payload.into_bytes())
            .await?;

        let (msg_type, mut buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::Handle => buf.get_string(),
            SftpMessageType::Status => {
                Self::check_status(buf)?;
                Err(KeelError::Protocol("OPENDIR answered OK status".to_string()))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected OPENDIR reply: {:?}",
                other
            ))),
        }
    }

    /// Reads one directory batch; `Ok(None)` signals EOF.
    pub async fn readdir(
        &mut self,
        handle: &[u8],
    ) -> KeelResult<Option<Vec<(String, FileAttributes)>>> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_string(handle);
        self.send(SftpMessageType::ReadDir, payload.into_bytes())
            .await?;

        let version = self.version;
        let (msg_type, mut buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::Name => {
                let count = buf.get_u32()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let filename = buf.get_string_utf8()?;
                    if version <= 3 {
                        let _long_name = buf.get_string_utf8()?;
                    }
                    entries.push((filename, FileAttributes::decode(version, &mut buf)?));
                }
                Ok(Some(entries))
            }
            SftpMessageType::Status => {
                let code = buf.get_u32()?;
                match StatusCode::from_u32(code) {
                    Some(StatusCode::Eof) => Ok(None),
                    Some(code) => Err(Self::status_error(
                        code,
                        buf.get_string_utf8().unwrap_or_default(),
                    )),
                    None => Err(KeelError::Protocol(format!(
                        "Unknown SFTP status code: {}",
                        code
                    ))),
                }
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected READDIR reply: {:?}",
                other
            ))),
        }
    }

    async fn path_status(&mut self, msg_type: SftpMessageType, path: &str) -> KeelResult<()> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(path);
        if msg_type == SftpMessageType::MkDir {
            FileAttributes::new().encode(self.version, &mut payload);
        }
        self.send(msg_type, payload.into_bytes()).await?;
        self.expect_status(id).await
    }

    /// Removes a file.
    pub async fn remove(&mut self, path: &str) -> KeelResult<()> {
        self.path_status(SftpMessageType::Remove, path).await
    }

    /// Creates a directory.
    pub async fn mkdir(&mut self, path: &str) -> KeelResult<()> {
        self.path_status(SftpMessageType::MkDir, path).await
    }

    /// Removes a directory.
    pub async fn rmdir(&mut self, path: &str) -> KeelResult<()> {
        self.path_status(SftpMessageType::RmDir, path).await
    }

    /// Renames a file or directory. `overwrite` sets the v5+ flag bit.
    pub async fn rename(&mut self, old: &str, new: &str, overwrite: bool) -> KeelResult<()> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(old);
        payload.put_str(new);
        if self.version >= 5 {
            payload.put_u32(if overwrite {
                crate::ssh::sftp::message::rename_flags::OVERWRITE
            } else {
                0
            });
        }
        self.send(SftpMessageType::Rename, payload.into_bytes())
            .await?;
        self.expect_status(id).await
    }

    /// Canonicalizes a path.
    pub async fn realpath(&mut self, path: &str) -> KeelResult<String> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(path);
        self.send(SftpMessageType::RealPath, payload.into_bytes())
            .await?;

        let (msg_type, mut buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::Name => {
                let _count = buf.get_u32()?;
                buf.get_string_utf8()
            }
            SftpMessageType::Status => {
                Self::check_status(buf)?;
                Err(KeelError::Protocol("REALPATH answered OK status".to_string()))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected REALPATH reply: {:?}",
                other
            ))),
        }
    }

    /// Requests the md5-hash extension over a path range. Returns the
    /// hash, empty when the quick check did not match.
    pub async fn md5_hash(
        &mut self,
        path: &str,
        start: u64,
        length: u64,
        quick_check: &[u8],
    ) -> KeelResult<Vec<u8>> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(extensions::MD5_HASH);
        payload.put_str(path);
        payload.put_u64(start);
        payload.put_u64(length);
        payload.put_string(quick_check);
        self.send(SftpMessageType::Extended, payload.into_bytes())
            .await?;

        let (msg_type, mut buf) = self.recv_reply(id).await?;
        match msg_type {
            SftpMessageType::ExtendedReply => {
                let _target_type = buf.get_string_utf8()?;
                buf.get_string()
            }
            SftpMessageType::Status => {
                Self::check_status(buf)?;
                Err(KeelError::Protocol("md5-hash answered OK status".to_string()))
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected md5-hash reply: {:?}",
                other
            ))),
        }
    }

    /// Sends a version-select extension request (must be first).
    pub async fn version_select(&mut self, version: u32) -> KeelResult<()> {
        let id = self.take_id();
        let mut payload = Buffer::new();
        payload.put_u32(id);
        payload.put_str(extensions::VERSION_SELECT);
        payload.put_str(&version.to_string());
        self.send(SftpMessageType::Extended, payload.into_bytes())
            .await?;
        self.expect_status(id).await?;
        self.version = version;
        Ok(())
    }
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("version", &self.version)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}
