//! Server-side SFTP request engine (versions 3-6).
//!
//! Runs as a session-channel subsystem on its own worker task: the task
//! reads length-prefixed packets from the channel's input stream,
//! dispatches by opcode and writes replies through the channel writer.
//! The handle table lives inside the worker and is never shared.
//!
//! Version negotiation: the server answers INIT with
//! `min(client, configured max)`; the `version-select` extension may
//! lower it further but only as the very first request. Any malformed or
//! late `version-select` sends a status and then disconnects the session
//! (surfaced as a protocol error from [`SftpSubsystem::run`]).

use crate::ssh::buffer::Buffer;
use crate::ssh::channel::{ChannelStdin, ChannelWriter};
use crate::ssh::sftp::attrs::{FileAttributes, UnsupportedAttributePolicy};
use crate::ssh::sftp::handles::{DirHandle, FileHandle, Handle, HandleTable};
use crate::ssh::sftp::message::{
    ace4, extensions, open_flags, pflags, realpath_control, rename_flags, SftpFramer,
    SftpMessage, SftpMessageType, StatusCode, DEFAULT_MAX_DATA_LENGTH, MD5_QUICK_HASH_SIZE,
    MIN_CHKFILE_BLOCKSIZE, SFTP_V3, SFTP_V6,
};
use keel_platform::{KeelError, KeelResult};
use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Subsystem configuration (derived from the session `Config`).
#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Highest protocol version offered (clamped to 3..=6).
    pub max_version: u32,
    /// Force a single protocol version.
    pub forced_version: Option<u32>,
    /// Handle size in bytes (clamped to 4..=64).
    pub handle_size: usize,
    /// Random handle generation retry rounds.
    pub handle_rand_rounds: usize,
    /// Per-session open handle cap (0 = unlimited).
    pub max_open_handles: usize,
    /// Per-request data bound for READ/WRITE and READDIR batches.
    pub max_data_length: u32,
    /// Override for the advertised client-extension set.
    pub client_extensions: Option<Vec<String>>,
    /// Override for the advertised OpenSSH extensions (name, version).
    pub openssh_extensions: Option<Vec<(String, String)>>,
    /// Policy for attributes the platform cannot supply or apply.
    pub policy: UnsupportedAttributePolicy,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            max_version: SFTP_V6,
            forced_version: None,
            handle_size: 16,
            handle_rand_rounds: 8,
            max_open_handles: 0,
            max_data_length: DEFAULT_MAX_DATA_LENGTH,
            client_extensions: None,
            openssh_extensions: None,
            policy: UnsupportedAttributePolicy::Warn,
        }
    }
}

fn default_client_extensions() -> Vec<String> {
    vec![
        extensions::VERSION_SELECT.to_string(),
        extensions::COPY_FILE.to_string(),
        extensions::COPY_DATA.to_string(),
        extensions::MD5_HASH.to_string(),
        extensions::MD5_HASH_HANDLE.to_string(),
        extensions::CHECK_FILE_HANDLE.to_string(),
        extensions::CHECK_FILE_NAME.to_string(),
        extensions::SPACE_AVAILABLE.to_string(),
    ]
}

/// Lexically normalizes a path: resolves `.` and `..`, keeps it rooted.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    let mut prefix = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {
                prefix.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(name) => parts.push(name.to_os_string()),
        }
    }
    let mut result = if prefix.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        prefix
    };
    for part in parts {
        result.push(part);
    }
    result
}

/// One SFTP subsystem instance bound to a session channel.
pub struct SftpSubsystem {
    config: SftpConfig,
    writer: ChannelWriter,
    version: u32,
    handles: HandleTable,
    requests_seen: u64,
    /// Set when the engine decided to stop serving (fatal INIT mismatch).
    terminated: bool,
}

impl SftpSubsystem {
    /// Creates a subsystem writing replies through `writer`.
    pub fn new(config: SftpConfig, writer: ChannelWriter) -> Self {
        let handles = HandleTable::new(
            config.handle_size,
            config.handle_rand_rounds,
            config.max_open_handles,
        );
        Self {
            config,
            writer,
            version: SFTP_V3,
            handles,
            requests_seen: 0,
            terminated: false,
        }
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Drives the request loop until the channel reaches EOF.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] when the protocol contract demands
    /// the whole session be disconnected (late or malformed
    /// `version-select`).
    pub async fn run(mut self, mut stdin: ChannelStdin) -> KeelResult<()> {
        let mut framer = SftpFramer::new();

        while let Some(chunk) = stdin.recv().await {
            framer.extend(&chunk);
            loop {
                let packet = match framer.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "malformed SFTP stream");
                        return Err(e);
                    }
                };
                self.handle_packet(packet.0, packet.1).await?;
                if self.terminated {
                    return Ok(());
                }
            }
        }

        debug!(handles = self.handles.len(), "SFTP subsystem stream ended");
        Ok(())
    }

    async fn send(&self, msg_type: SftpMessageType, payload: Vec<u8>) -> KeelResult<()> {
        self.writer
            .write(&SftpMessage::new(msg_type, payload).to_bytes())
            .await
    }

    async fn send_status(
        &self,
        id: u32,
        code: StatusCode,
        message: &str,
    ) -> KeelResult<()> {
        let mut buf = Buffer::new();
        buf.put_u32(id);
        buf.put_u32(code as u32);
        buf.put_str(message);
        buf.put_str(""); // language tag
        self.send(SftpMessageType::Status, buf.into_bytes()).await
    }

    async fn send_error(&self, id: u32, err: &KeelError) -> KeelResult<()> {
        let code = match err {
            KeelError::Channel(_) => StatusCode::InvalidHandle,
            other => StatusCode::from_error(other),
        };
        self.send_status(id, code, &err.to_string()).await
    }

    async fn send_handle(&self, id: u32, handle: &[u8]) -> KeelResult<()> {
        let mut buf = Buffer::new();
        buf.put_u32(id);
        buf.put_string(handle);
        self.send(SftpMessageType::Handle, buf.into_bytes()).await
    }

    async fn send_attrs(&self, id: u32, attrs: &FileAttributes) -> KeelResult<()> {
        let mut buf = Buffer::new();
        buf.put_u32(id);
        attrs.encode(self.version, &mut buf);
        self.send(SftpMessageType::Attrs, buf.into_bytes()).await
    }

    async fn send_name(
        &self,
        id: u32,
        entries: &[(String, FileAttributes)],
    ) -> KeelResult<()> {
        let mut buf = Buffer::new();
        buf.put_u32(id);
        buf.put_u32(entries.len() as u32);
        for (name, attrs) in entries {
            buf.put_str(name);
            if self.version <= 3 {
                buf.put_str(&attrs.long_name(name));
            }
            attrs.encode(self.version, &mut buf);
        }
        self.send(SftpMessageType::Name, buf.into_bytes()).await
    }

    async fn handle_packet(&mut self, type_byte: u8, payload: Vec<u8>) -> KeelResult<()> {
        let mut buf = Buffer::from(payload);
        let id = buf.get_u32()?;

        let msg_type = SftpMessageType::from_u8(type_byte);
        match msg_type {
            Some(SftpMessageType::Init) => {
                // For INIT the id field is the proposed version.
                self.do_init(id).await?;
            }
            Some(SftpMessageType::Open) => self.reply(id, Self::do_open, buf).await?,
            Some(SftpMessageType::Close) => self.reply_status(id, Self::do_close, buf).await?,
            Some(SftpMessageType::Read) => self.reply(id, Self::do_read, buf).await?,
            Some(SftpMessageType::Write) => self.reply_status(id, Self::do_write, buf).await?,
            Some(SftpMessageType::LStat) => self.reply(id, Self::do_lstat, buf).await?,
            Some(SftpMessageType::Stat) => self.reply(id, Self::do_stat, buf).await?,
            Some(SftpMessageType::FStat) => self.reply(id, Self::do_fstat, buf).await?,
            Some(SftpMessageType::SetStat) => {
                self.reply_status(id, Self::do_setstat, buf).await?
            }
            Some(SftpMessageType::FSetStat) => {
                self.reply_status(id, Self::do_fsetstat, buf).await?
            }
            Some(SftpMessageType::OpenDir) => self.reply(id, Self::do_opendir, buf).await?,
            Some(SftpMessageType::ReadDir) => self.reply(id, Self::do_readdir, buf).await?,
            Some(SftpMessageType::Remove) => self.reply_status(id, Self::do_remove, buf).await?,
            Some(SftpMessageType::MkDir) => self.reply_status(id, Self::do_mkdir, buf).await?,
            Some(SftpMessageType::RmDir) => self.reply_status(id, Self::do_rmdir, buf).await?,
            Some(SftpMessageType::Rename) => self.reply_status(id, Self::do_rename, buf).await?,
            Some(SftpMessageType::ReadLink) => self.reply(id, Self::do_readlink, buf).await?,
            Some(SftpMessageType::Symlink) => {
                self.reply_status(id, Self::do_symlink, buf).await?
            }
            Some(SftpMessageType::Link) => self.reply_status(id, Self::do_link, buf).await?,
            Some(SftpMessageType::RealPath) => self.reply(id, Self::do_realpath, buf).await?,
            Some(SftpMessageType::Block) => self.reply_status(id, Self::do_block, buf).await?,
            Some(SftpMessageType::Unblock) => {
                // UNBLOCK reports NO_MATCHING_BYTE_RANGE_LOCK itself.
                match self.do_unblock(&mut buf) {
                    Ok(true) => self.send_status(id, StatusCode::Ok, "").await?,
                    Ok(false) => {
                        self.send_status(
                            id,
                            StatusCode::NoMatchingByteRangeLock,
                            StatusCode::NoMatchingByteRangeLock.message(),
                        )
                        .await?
                    }
                    Err(e) => self.send_error(id, &e).await?,
                }
            }
            Some(SftpMessageType::Extended) => self.do_extended(id, buf).await?,
            _ => {
                info!(opcode = type_byte, "unsupported SFTP opcode");
                self.send_status(
                    id,
                    StatusCode::OpUnsupported,
                    &format!("Opcode {} is unsupported or not implemented", type_byte),
                )
                .await?;
            }
        }

        // INIT does not count against version-select's first-request rule.
        if msg_type != Some(SftpMessageType::Init) {
            self.requests_seen += 1;
        }
        Ok(())
    }

    /// Runs a handler that produces a reply message; errors become STATUS.
    async fn reply<F>(&mut self, id: u32, handler: F, mut buf: Buffer) -> KeelResult<()>
    where
        F: FnOnce(&mut Self, u32, &mut Buffer) -> KeelResult<(SftpMessageType, Vec<u8>)>,
    {
        match handler(self, id, &mut buf) {
            Ok((msg_type, payload)) => self.send(msg_type, payload).await,
            Err(e) => self.send_error(id, &e).await,
        }
    }

    /// Runs a handler whose success is a bare OK status.
    async fn reply_status<F>(&mut self, id: u32, handler: F, mut buf: Buffer) -> KeelResult<()>
    where
        F: FnOnce(&mut Self, &mut Buffer) -> KeelResult<()>,
    {
        match handler(self, &mut buf) {
            Ok(()) => self.send_status(id, StatusCode::Ok, "").await,
            Err(e) => self.send_error(id, &e).await,
        }
    }

    fn supported_versions(&self) -> Vec<u32> {
        match self.config.forced_version {
            Some(v) => vec![v],
            None => (SFTP_V3..=self.config.max_version.clamp(SFTP_V3, SFTP_V6)).collect(),
        }
    }

    async fn do_init(&mut self, proposed: u32) -> KeelResult<()> {
        debug!(proposed, "received SSH_FXP_INIT");
        let supported = self.supported_versions();

        let chosen = if let Some(forced) = self.config.forced_version {
            if proposed >= forced {
                forced
            } else {
                self.send_status(
                    0,
                    StatusCode::OpUnsupported,
                    &format!("Version {} is below the forced version {}", proposed, forced),
                )
                .await?;
                self.terminated = true;
                return Ok(());
            }
        } else if proposed < SFTP_V3 {
            self.send_status(
                0,
                StatusCode::OpUnsupported,
                &format!("Version {} is not supported", proposed),
            )
            .await?;
            self.terminated = true;
            return Ok(());
        } else {
            proposed.min(*supported.last().expect("supported set is never empty"))
        };

        self.version = chosen;

        let mut buf = Buffer::new();
        buf.put_u32(chosen);

        // versions
        let all: Vec<String> = supported.iter().map(|v| v.to_string()).collect();
        buf.put_str("versions");
        buf.put_str(&all.join(","));

        // newline
        buf.put_str("newline");
        buf.put_str("\n");

        // vendor-id
        let mut vendor = Buffer::new();
        vendor.put_str("Keel");
        vendor.put_str("keel-sshd");
        vendor.put_str(env!("CARGO_PKG_VERSION"));
        vendor.put_u64(0);
        buf.put_str("vendor-id");
        buf.put_string(vendor.as_slice());

        // OpenSSH extensions
        let openssh = self.config.openssh_extensions.clone().unwrap_or_else(|| {
            vec![("fsync@openssh.com".to_string(), "1".to_string())]
        });
        for (name, version) in &openssh {
            buf.put_str(name);
            buf.put_str(version);
        }

        // supported / supported2
        let extras = self
            .config
            .client_extensions
            .clone()
            .unwrap_or_else(default_client_extensions);

        let mut supported_blob = Buffer::new();
        supported_blob.put_u32(0x0000_01ff); // supported-attribute-mask
        supported_blob.put_u32(0); // supported-attribute-bits
        supported_blob.put_u32(0x0000_003f); // supported-open-flags
        supported_blob.put_u32(
            ace4::READ_DATA
                | ace4::WRITE_DATA
                | ace4::APPEND_DATA
                | ace4::READ_ATTRIBUTES
                | ace4::WRITE_ATTRIBUTES,
        );
        supported_blob.put_u32(self.config.max_data_length);
        for name in &extras {
            supported_blob.put_str(name);
        }
        buf.put_str("supported");
        buf.put_string(supported_blob.as_slice());

        let mut supported2_blob = Buffer::new();
        supported2_blob.put_u32(0x0000_01ff);
        supported2_blob.put_u32(0);
        supported2_blob.put_u32(0x0000_003f);
        supported2_blob.put_u32(
            ace4::READ_DATA
                | ace4::WRITE_DATA
                | ace4::APPEND_DATA
                | ace4::READ_ATTRIBUTES
                | ace4::WRITE_ATTRIBUTES,
        );
        supported2_blob.put_u32(self.config.max_data_length);
        supported2_blob.put_u16(0); // supported-open-block-vector
        supported2_blob.put_u16(0); // supported-block-vector
        supported2_blob.put_u32(0); // attrib-extension-count
        supported2_blob.put_u32(extras.len() as u32);
        for name in &extras {
            supported2_blob.put_str(name);
        }
        buf.put_str("supported2");
        buf.put_string(supported2_blob.as_slice());

        self.send(SftpMessageType::Version, buf.into_bytes()).await
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let raw = if raw.is_empty() { "." } else { raw };
        normalize_path(Path::new(raw))
    }

    fn do_open(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let path = buf.get_string_utf8()?;

        // Mirror FileChannel#open semantics: no mode requested means READ.
        let mut access = 0u32;
        if self.version >= 5 {
            access = buf.get_u32()?;
            if access == 0 {
                access = ace4::READ_DATA | ace4::READ_ATTRIBUTES;
            }
        }

        let mut flags = buf.get_u32()?;
        if flags == 0 {
            flags = pflags::READ;
        }

        if self.version < 5 {
            let v3 = flags;
            flags = 0;
            match v3 & (pflags::READ | pflags::WRITE) {
                f if f == pflags::READ => {
                    access |= ace4::READ_DATA | ace4::READ_ATTRIBUTES;
                }
                f if f == pflags::WRITE => {
                    access |= ace4::WRITE_DATA | ace4::WRITE_ATTRIBUTES;
                }
                _ => {
                    access |= ace4::READ_DATA | ace4::READ_ATTRIBUTES;
                    access |= ace4::WRITE_DATA | ace4::WRITE_ATTRIBUTES;
                }
            }
            if v3 & pflags::APPEND != 0 {
                access |= ace4::APPEND_DATA;
                flags |= open_flags::APPEND_DATA | open_flags::APPEND_DATA_ATOMIC;
            }
            if v3 & pflags::CREAT != 0 {
                if v3 & pflags::EXCL != 0 {
                    flags |= open_flags::CREATE_NEW;
                } else if v3 & pflags::TRUNC != 0 {
                    flags |= open_flags::CREATE_TRUNCATE;
                } else {
                    flags |= open_flags::OPEN_OR_CREATE;
                }
            } else if v3 & pflags::TRUNC != 0 {
                flags |= open_flags::TRUNCATE_EXISTING;
            } else {
                flags |= open_flags::OPEN_EXISTING;
            }
        }

        let attrs = FileAttributes::decode(self.version, buf)?;
        let resolved = self.resolve(&path);

        debug!(
            path = %resolved.display(),
            access = format_args!("{:#x}", access),
            flags = format_args!("{:#x}", flags),
            "received SSH_FXP_OPEN"
        );

        let append = flags & (open_flags::APPEND_DATA | open_flags::APPEND_DATA_ATOMIC) != 0
            || access & ace4::APPEND_DATA != 0;
        let wants_write =
            access & (ace4::WRITE_DATA | ace4::WRITE_ATTRIBUTES) != 0 || append;

        let mut options = std::fs::OpenOptions::new();
        options.read(access & (ace4::READ_DATA | ace4::READ_ATTRIBUTES) != 0);
        options.write(wants_write);
        match flags & open_flags::ACCESS_DISPOSITION {
            open_flags::CREATE_NEW => {
                options.write(true).create_new(true);
            }
            open_flags::CREATE_TRUNCATE => {
                options.write(true).create(true).truncate(true);
            }
            open_flags::OPEN_OR_CREATE => {
                options.write(true).create(true);
            }
            open_flags::TRUNCATE_EXISTING => {
                options.write(true).truncate(true);
            }
            _ => {} // OPEN_EXISTING
        }

        #[cfg(unix)]
        if let Some(mode) = attrs.permissions {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }

        let file = options.open(&resolved).map_err(KeelError::Io)?;

        let handle = self.handles.insert(Handle::File(FileHandle {
            file,
            path: resolved,
            access,
            append,
            locks: Vec::new(),
        }))?;

        let mut reply = Buffer::new();
        reply.put_u32(id);
        reply.put_string(&handle);
        Ok((SftpMessageType::Handle, reply.into_bytes()))
    }

    fn do_close(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let handle = buf.get_string()?;
        // Dropping the handle closes the underlying resources.
        self.handles.remove(&handle)?;
        Ok(())
    }

    fn do_read(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let handle = buf.get_string()?;
        let offset = buf.get_u64()?;
        let length = buf.get_u32()?.min(self.config.max_data_length);
        if length == 0 {
            return Err(KeelError::Protocol("Zero-length read".to_string()));
        }

        let file_handle = self.handles.get(&handle)?.as_file()?;
        file_handle
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(KeelError::Io)?;

        let mut data = vec![0u8; length as usize];
        let n = file_handle.file.read(&mut data).map_err(KeelError::Io)?;
        if n == 0 {
            let mut reply = Buffer::new();
            reply.put_u32(id);
            reply.put_u32(StatusCode::Eof as u32);
            reply.put_str(StatusCode::Eof.message());
            reply.put_str("");
            return Ok((SftpMessageType::Status, reply.into_bytes()));
        }
        data.truncate(n);

        let mut reply = Buffer::new();
        reply.put_u32(id);
        reply.put_string(&data);
        Ok((SftpMessageType::Data, reply.into_bytes()))
    }

    fn do_write(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let handle = buf.get_string()?;
        let offset = buf.get_u64()?;
        let data = buf.get_string()?;

        let file_handle = self.handles.get(&handle)?.as_file()?;
        if file_handle.append {
            file_handle
                .file
                .seek(SeekFrom::End(0))
                .map_err(KeelError::Io)?;
        } else {
            file_handle
                .file
                .seek(SeekFrom::Start(offset))
                .map_err(KeelError::Io)?;
        }
        file_handle.file.write_all(&data).map_err(KeelError::Io)?;
        Ok(())
    }

    fn stat_path(&self, path: &Path, follow: bool) -> KeelResult<FileAttributes> {
        let metadata = if follow {
            std::fs::metadata(path)
        } else {
            std::fs::symlink_metadata(path)
        }
        .map_err(KeelError::Io)?;
        Ok(FileAttributes::from_metadata(&metadata))
    }

    fn do_stat(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let path = self.resolve(&buf.get_string_utf8()?);
        if self.version >= 4 && buf.remaining() >= 4 {
            let _desired_flags = buf.get_u32()?;
        }
        let attrs = self.stat_path(&path, true)?;
        let mut reply = Buffer::new();
        reply.put_u32(id);
        attrs.encode(self.version, &mut reply);
        Ok((SftpMessageType::Attrs, reply.into_bytes()))
    }

    fn do_lstat(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let path = self.resolve(&buf.get_string_utf8()?);
        if self.version >= 4 && buf.remaining() >= 4 {
            let _desired_flags = buf.get_u32()?;
        }
        let attrs = self.stat_path(&path, false)?;
        let mut reply = Buffer::new();
        reply.put_u32(id);
        attrs.encode(self.version, &mut reply);
        Ok((SftpMessageType::Attrs, reply.into_bytes()))
    }

    fn do_fstat(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let handle = buf.get_string()?;
        if self.version >= 4 && buf.remaining() >= 4 {
            let _desired_flags = buf.get_u32()?;
        }
        let file_handle = self.handles.get(&handle)?.as_file()?;
        let metadata = file_handle.file.metadata().map_err(KeelError::Io)?;
        let attrs = FileAttributes::from_metadata(&metadata);
        let version = self.version;
        let mut reply = Buffer::new();
        reply.put_u32(id);
        attrs.encode(version, &mut reply);
        Ok((SftpMessageType::Attrs, reply.into_bytes()))
    }

    fn do_setstat(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let path = self.resolve(&buf.get_string_utf8()?);
        let attrs = FileAttributes::decode(self.version, buf)?;
        attrs.apply_to(&path, self.config.policy)
    }

    fn do_fsetstat(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let handle = buf.get_string()?;
        let attrs = FileAttributes::decode(self.version, buf)?;
        let path = self.handles.get(&handle)?.as_file()?.path.clone();
        attrs.apply_to(&path, self.config.policy)
    }

    fn do_opendir(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let path = self.resolve(&buf.get_string_utf8()?);
        let metadata = std::fs::metadata(&path).map_err(KeelError::Io)?;
        if !metadata.is_dir() {
            return Err(KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", path.display()),
            )));
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(KeelError::Io)? {
            entries.push(entry.map_err(KeelError::Io)?.path());
        }

        let handle = self
            .handles
            .insert(Handle::Dir(DirHandle::new(path, entries)))?;

        let mut reply = Buffer::new();
        reply.put_u32(id);
        reply.put_string(&handle);
        Ok((SftpMessageType::Handle, reply.into_bytes()))
    }

    fn do_readdir(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let handle = buf.get_string()?;
        let version = self.version;
        let max_batch = self.config.max_data_length as usize;

        let dir = self.handles.get(&handle)?.as_dir()?;
        if dir.done || !dir.has_pending() {
            dir.done = true;
            let mut reply = Buffer::new();
            reply.put_u32(id);
            reply.put_u32(StatusCode::Eof as u32);
            reply.put_str(StatusCode::Eof.message());
            reply.put_str("");
            return Ok((SftpMessageType::Status, reply.into_bytes()));
        }

        let dir_path = dir.path.clone();
        let mut names: Vec<(String, FileAttributes)> = Vec::new();
        let mut batch_bytes = 0usize;

        // "." and ".." first, then real entries, sized to the packet cap.
        while batch_bytes < max_batch {
            if dir.send_dot {
                dir.send_dot = false;
                if let Ok(metadata) = std::fs::metadata(&dir_path) {
                    let attrs = FileAttributes::from_metadata(&metadata);
                    batch_bytes += 64;
                    names.push((".".to_string(), attrs));
                }
                continue;
            }
            if dir.send_dotdot {
                dir.send_dotdot = false;
                let parent = dir_path.parent().unwrap_or(&dir_path);
                if let Ok(metadata) = std::fs::metadata(parent) {
                    let attrs = FileAttributes::from_metadata(&metadata);
                    batch_bytes += 64;
                    names.push(("..".to_string(), attrs));
                }
                continue;
            }
            let Some(entry) = dir.entries.get(dir.position) else {
                break;
            };
            let filename = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let attrs = std::fs::symlink_metadata(entry)
                .map(|m| FileAttributes::from_metadata(&m))
                .unwrap_or_default();
            batch_bytes += 64 + filename.len();
            names.push((filename, attrs));
            dir.position += 1;
        }

        if !dir.has_pending() {
            dir.done = true;
        }

        let mut reply = Buffer::new();
        reply.put_u32(id);
        reply.put_u32(names.len() as u32);
        for (name, attrs) in &names {
            reply.put_str(name);
            if version <= 3 {
                reply.put_str(&attrs.long_name(name));
            }
            attrs.encode(version, &mut reply);
        }
        Ok((SftpMessageType::Name, reply.into_bytes()))
    }

    fn do_remove(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let path = self.resolve(&buf.get_string_utf8()?);
        std::fs::remove_file(path).map_err(KeelError::Io)
    }

    fn do_mkdir(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let path = self.resolve(&buf.get_string_utf8()?);
        let attrs = FileAttributes::decode(self.version, buf)?;
        std::fs::create_dir(&path).map_err(KeelError::Io)?;
        if attrs.permissions.is_some() {
            attrs.apply_to(&path, self.config.policy)?;
        }
        Ok(())
    }

    fn do_rmdir(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let path = self.resolve(&buf.get_string_utf8()?);
        std::fs::remove_dir(path).map_err(KeelError::Io)
    }

    fn do_rename(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let old_path = self.resolve(&buf.get_string_utf8()?);
        let new_path = self.resolve(&buf.get_string_utf8()?);
        let flags = if self.version >= 5 && buf.remaining() >= 4 {
            buf.get_u32()?
        } else {
            0
        };

        // ATOMIC implies OVERWRITE; a plain rename must not clobber.
        let may_overwrite =
            flags & (rename_flags::OVERWRITE | rename_flags::ATOMIC) != 0 || self.version < 5;
        if !may_overwrite && new_path.exists() {
            return Err(KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", new_path.display()),
            )));
        }

        std::fs::rename(old_path, new_path).map_err(KeelError::Io)
    }

    fn do_readlink(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let path = self.resolve(&buf.get_string_utf8()?);
        let target = std::fs::read_link(path).map_err(KeelError::Io)?;
        let target = target.to_string_lossy().into_owned();

        let mut reply = Buffer::new();
        reply.put_u32(id);
        reply.put_u32(1);
        reply.put_str(&target);
        if self.version <= 3 {
            reply.put_str(&target);
        }
        FileAttributes::new().encode(self.version, &mut reply);
        Ok((SftpMessageType::Name, reply.into_bytes()))
    }

    fn do_symlink(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        // Fixed argument order: target first, then the link path.
        let target = buf.get_string_utf8()?;
        let link_path = self.resolve(&buf.get_string_utf8()?);
        create_symlink(Path::new(&target), &link_path)
    }

    fn do_link(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let link_path = self.resolve(&buf.get_string_utf8()?);
        let target = buf.get_string_utf8()?;
        let symlink = buf.get_bool()?;
        if symlink {
            create_symlink(Path::new(&target), &link_path)
        } else {
            std::fs::hard_link(self.resolve(&target), link_path).map_err(KeelError::Io)
        }
    }

    fn do_realpath(
        &mut self,
        id: u32,
        buf: &mut Buffer,
    ) -> KeelResult<(SftpMessageType, Vec<u8>)> {
        let raw = buf.get_string_utf8()?;
        let raw = if raw.trim().is_empty() {
            ".".to_string()
        } else {
            raw
        };

        let (path, attrs) = if self.version < SFTP_V6 {
            (self.resolve(&raw), FileAttributes::new())
        } else {
            let control = if buf.remaining() > 0 {
                buf.get_u8()?
            } else {
                realpath_control::NO_CHECK
            };

            let mut composed = raw.clone();
            while buf.remaining() > 0 {
                let extra = buf.get_string_utf8()?;
                composed.push('/');
                composed.push_str(&extra);
            }
            let path = self.resolve(&composed);

            let attrs = match control {
                realpath_control::STAT_IF => self.stat_path(&path, true).unwrap_or_default(),
                realpath_control::STAT_ALWAYS => self.stat_path(&path, true)?,
                _ => FileAttributes::new(),
            };
            (path, attrs)
        };

        let display = path.to_string_lossy().into_owned();
        let mut reply = Buffer::new();
        reply.put_u32(id);
        reply.put_u32(1);
        reply.put_str(&display);
        if self.version <= 3 {
            reply.put_str(&attrs.long_name(&display));
        }
        attrs.encode(self.version, &mut reply);
        Ok((SftpMessageType::Name, reply.into_bytes()))
    }

    fn do_block(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let handle = buf.get_string()?;
        let offset = buf.get_u64()?;
        let length = buf.get_u64()?;
        let mask = buf.get_u32()?;
        let file_handle = self.handles.get(&handle)?.as_file()?;
        file_handle.lock(offset, length, mask);
        Ok(())
    }

    fn do_unblock(&mut self, buf: &mut Buffer) -> KeelResult<bool> {
        let handle = buf.get_string()?;
        let offset = buf.get_u64()?;
        let length = buf.get_u64()?;
        let file_handle = self.handles.get(&handle)?.as_file()?;
        Ok(file_handle.unlock(offset, length))
    }

    async fn do_extended(&mut self, id: u32, mut buf: Buffer) -> KeelResult<()> {
        let name = buf.get_string_utf8()?;
        debug!(extension = %name, "received SSH_FXP_EXTENDED");
        match name.as_str() {
            extensions::VERSION_SELECT => self.do_version_select(id, &mut buf).await,
            extensions::COPY_FILE => {
                match self.do_copy_file(&mut buf) {
                    Ok(()) => self.send_status(id, StatusCode::Ok, "").await,
                    Err(e) => self.send_error(id, &e).await,
                }
            }
            extensions::COPY_DATA => {
                match self.do_copy_data(&mut buf) {
                    Ok(()) => self.send_status(id, StatusCode::Ok, "").await,
                    Err(e) => self.send_error(id, &e).await,
                }
            }
            extensions::MD5_HASH | extensions::MD5_HASH_HANDLE => {
                match self.do_md5_hash(&name, &mut buf) {
                    Ok(hash) => {
                        let mut reply = Buffer::new();
                        reply.put_u32(id);
                        reply.put_str(&name);
                        reply.put_string(&hash);
                        self.send(SftpMessageType::ExtendedReply, reply.into_bytes())
                            .await
                    }
                    Err(e) => self.send_error(id, &e).await,
                }
            }
            extensions::CHECK_FILE_HANDLE | extensions::CHECK_FILE_NAME => {
                match self.do_check_file(&name, &mut buf) {
                    Ok((algorithm, blocks)) => {
                        let mut reply = Buffer::new();
                        reply.put_u32(id);
                        reply.put_str(extensions::CHECK_FILE);
                        reply.put_str(&algorithm);
                        for block in blocks {
                            reply.put_string(&block);
                        }
                        self.send(SftpMessageType::ExtendedReply, reply.into_bytes())
                            .await
                    }
                    Err(e) => self.send_error(id, &e).await,
                }
            }
            extensions::SPACE_AVAILABLE => {
                match buf.get_string_utf8() {
                    Ok(_path) => {
                        // The standard library exposes no filesystem usage
                        // query; all-zero fields report "unknown".
                        let mut reply = Buffer::new();
                        reply.put_u32(id);
                        reply.put_u64(0);
                        reply.put_u64(0);
                        reply.put_u64(0);
                        reply.put_u64(0);
                        reply.put_u32(0);
                        self.send(SftpMessageType::ExtendedReply, reply.into_bytes())
                            .await
                    }
                    Err(e) => self.send_error(id, &e).await,
                }
            }
            extensions::TEXT_SEEK => {
                let result = (|| -> KeelResult<()> {
                    let handle = buf.get_string()?;
                    let _line = buf.get_u64()?;
                    self.handles.get(&handle)?.as_file()?;
                    Err(KeelError::NotImplemented("text-seek".to_string()))
                })();
                match result {
                    Err(e) => self.send_error(id, &e).await,
                    Ok(()) => unreachable!("text-seek always reports unsupported"),
                }
            }
            extensions::FSYNC_OPENSSH => {
                let result = (|| -> KeelResult<()> {
                    let handle = buf.get_string()?;
                    let file_handle = self.handles.get(&handle)?.as_file()?;
                    file_handle.file.sync_all().map_err(KeelError::Io)
                })();
                match result {
                    Ok(()) => self.send_status(id, StatusCode::Ok, "").await,
                    Err(e) => self.send_error(id, &e).await,
                }
            }
            _ => {
                info!(extension = %name, "unsupported SSH_FXP_EXTENDED");
                self.send_status(
                    id,
                    StatusCode::OpUnsupported,
                    &format!("Extension '{}' is unsupported or not implemented", name),
                )
                .await
            }
        }
    }

    /// version-select MUST be the first request; anything else sends a
    /// status and then disconnects the session.
    async fn do_version_select(&mut self, id: u32, buf: &mut Buffer) -> KeelResult<()> {
        let proposed = buf.get_string_utf8().unwrap_or_default();

        if self.requests_seen > 0 {
            self.send_status(
                id,
                StatusCode::Failure,
                &format!(
                    "Version selection not the 1st request for proposal = {}",
                    proposed
                ),
            )
            .await?;
            return Err(KeelError::Protocol(
                "version-select after other requests".to_string(),
            ));
        }

        let valid = proposed.len() == 1
            && proposed
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit());
        let value = if valid {
            proposed.parse::<u32>().unwrap_or(0)
        } else {
            0
        };

        if valid && self.supported_versions().contains(&value) {
            self.version = value;
            self.send_status(id, StatusCode::Ok, "").await
        } else {
            self.send_status(
                id,
                StatusCode::Failure,
                &format!("Unsupported version {}", proposed),
            )
            .await?;
            Err(KeelError::Protocol(format!(
                "version-select rejected: {}",
                proposed
            )))
        }
    }

    fn do_copy_file(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let src = self.resolve(&buf.get_string_utf8()?);
        let dst = self.resolve(&buf.get_string_utf8()?);
        let overwrite = buf.get_bool().unwrap_or(false);

        if !overwrite && dst.exists() {
            return Err(KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", dst.display()),
            )));
        }
        std::fs::copy(src, dst).map_err(KeelError::Io)?;
        Ok(())
    }

    fn do_copy_data(&mut self, buf: &mut Buffer) -> KeelResult<()> {
        let read_handle = buf.get_string()?;
        let read_offset = buf.get_u64()?;
        let read_length = buf.get_u64()?;
        let write_handle = buf.get_string()?;
        let mut write_offset = buf.get_u64()?;

        let in_place = read_handle == write_handle;

        let (src_path, src_access, total_size) = {
            let src = self.handles.get(&read_handle)?.as_file()?;
            let size = src.file.metadata().map_err(KeelError::Io)?.len();
            (src.path.clone(), src.access, size)
        };
        if src_access & ace4::READ_DATA == 0 {
            return Err(KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("File not opened for read: {}", src_path.display()),
            )));
        }

        let mut effective = read_length;
        if effective == 0 || read_offset + effective > total_size {
            effective = total_size.saturating_sub(read_offset);
        }
        if effective == 0 {
            return Err(KeelError::Protocol(
                "Non-positive effective copy length".to_string(),
            ));
        }

        let dst_access = {
            let dst = self.handles.get(&write_handle)?.as_file()?;
            dst.access
        };
        if dst_access & ace4::WRITE_DATA == 0 {
            return Err(KeelError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "File not opened for write".to_string(),
            )));
        }

        // Overlapping ranges on the same handle are rejected.
        if in_place {
            let max_read = (read_offset + effective).min(total_size);
            let max_write = write_offset + effective;
            if max_write > read_offset && write_offset < max_read {
                return Err(KeelError::Protocol(format!(
                    "Read range [{}-{}] overlaps with write range [{}-{}]",
                    read_offset, max_read, write_offset, max_write
                )));
            }
        }

        let mut remaining = effective;
        let mut read_offset = read_offset;
        let mut chunk = vec![0u8; 32 * 1024];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            let n = {
                let src = self.handles.get(&read_handle)?.as_file()?;
                src.file
                    .seek(SeekFrom::Start(read_offset))
                    .map_err(KeelError::Io)?;
                src.file.read(&mut chunk[..take]).map_err(KeelError::Io)?
            };
            if n == 0 {
                return Err(KeelError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Premature EOF with {} bytes remaining", remaining),
                )));
            }
            {
                let dst = self.handles.get(&write_handle)?.as_file()?;
                dst.file
                    .seek(SeekFrom::Start(write_offset))
                    .map_err(KeelError::Io)?;
                dst.file.write_all(&chunk[..n]).map_err(KeelError::Io)?;
            }
            remaining -= n as u64;
            read_offset += n as u64;
            write_offset += n as u64;
        }
        Ok(())
    }

    fn md5_target(&mut self, name: &str, buf: &mut Buffer) -> KeelResult<(PathBuf, Vec<u8>)> {
        if name == extensions::MD5_HASH_HANDLE {
            let handle = buf.get_string()?;
            let file_handle = self.handles.get(&handle)?.as_file()?;
            if file_handle.access & ace4::READ_DATA == 0 {
                return Err(KeelError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("File not opened for read: {}", file_handle.path.display()),
                )));
            }
            Ok((file_handle.path.clone(), handle))
        } else {
            let path = self.resolve(&buf.get_string_utf8()?);
            if path.is_dir() {
                return Err(KeelError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    format!("{} is a directory", path.display()),
                )));
            }
            Ok((path, Vec::new()))
        }
    }

    /// md5-hash quick check: an empty quick-check hash means hash the
    /// whole range; a non-empty one is compared against the MD5 of the
    /// first chunk, and a mismatch yields an empty reply hash.
    fn do_md5_hash(&mut self, name: &str, buf: &mut Buffer) -> KeelResult<Vec<u8>> {
        let (path, _handle) = self.md5_target(name, buf)?;
        let start_offset = buf.get_u64()?;
        let length = buf.get_u64()?;
        let quick_check = buf.get_string()?;

        let total_size = std::fs::metadata(&path).map_err(KeelError::Io)?.len();
        let mut effective = length;
        if start_offset == 0 && length == 0 {
            effective = total_size;
        } else if start_offset + effective > total_size {
            effective = total_size.saturating_sub(start_offset);
        }
        if effective == 0 {
            return Err(KeelError::Protocol(
                "Non-positive effective hash length".to_string(),
            ));
        }

        let mut file = std::fs::File::open(&path).map_err(KeelError::Io)?;
        file.seek(SeekFrom::Start(start_offset))
            .map_err(KeelError::Io)?;

        let mut digest = Md5::new();
        let mut remaining = effective;

        if !quick_check.is_empty() {
            let prefix_len = effective.min(MD5_QUICK_HASH_SIZE) as usize;
            let mut prefix = vec![0u8; prefix_len];
            file.read_exact(&mut prefix).map_err(KeelError::Io)?;

            let prefix_hash = Md5::digest(&prefix).to_vec();
            if prefix_hash != quick_check {
                debug!(path = %path.display(), "md5-hash quick check mismatch");
                return Ok(Vec::new());
            }
            digest.update(&prefix);
            remaining -= prefix_len as u64;
        }

        let mut chunk = vec![0u8; 32 * 1024];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            let n = file.read(&mut chunk[..take]).map_err(KeelError::Io)?;
            if n == 0 {
                break;
            }
            digest.update(&chunk[..n]);
            remaining -= n as u64;
        }

        Ok(digest.finalize().to_vec())
    }

    fn do_check_file(
        &mut self,
        name: &str,
        buf: &mut Buffer,
    ) -> KeelResult<(String, Vec<Vec<u8>>)> {
        let path = if name == extensions::CHECK_FILE_HANDLE {
            let handle = buf.get_string()?;
            let file_handle = self.handles.get(&handle)?.as_file()?;
            if file_handle.access & ace4::READ_DATA == 0 {
                return Err(KeelError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("File not opened for read: {}", file_handle.path.display()),
                )));
            }
            file_handle.path.clone()
        } else {
            let mut path = self.resolve(&buf.get_string_utf8()?);
            // check-file-name follows symlinks to the target.
            let mut hops = 0;
            while path.is_symlink() && hops < 127 {
                path = std::fs::read_link(&path).map_err(KeelError::Io)?;
                hops += 1;
            }
            if path.is_symlink() {
                return Err(KeelError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Circular symlink chain".to_string(),
                )));
            }
            if path.is_dir() {
                return Err(KeelError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    format!("{} is a directory", path.display()),
                )));
            }
            path
        };

        let algorithms = buf.get_string_utf8()?;
        let start_offset = buf.get_u64()?;
        let length = buf.get_u64()?;
        let block_size = buf.get_u32()?;

        if block_size != 0 && block_size < MIN_CHKFILE_BLOCKSIZE {
            return Err(KeelError::Protocol(format!(
                "Invalid block size: {}",
                block_size
            )));
        }

        let algorithm = algorithms
            .split(',')
            .map(str::trim)
            .find(|a| matches!(*a, "md5" | "sha1" | "sha256" | "sha512"))
            .ok_or_else(|| {
                KeelError::NotImplemented(format!(
                    "No supported hash algorithm among '{}'",
                    algorithms
                ))
            })?
            .to_string();

        let total_size = std::fs::metadata(&path).map_err(KeelError::Io)?.len();
        let mut effective = length;
        if effective == 0 || start_offset + effective > total_size {
            effective = total_size.saturating_sub(start_offset);
        }
        if effective == 0 {
            return Err(KeelError::Protocol(
                "Non-positive effective hash length".to_string(),
            ));
        }

        let mut file = std::fs::File::open(&path).map_err(KeelError::Io)?;
        file.seek(SeekFrom::Start(start_offset))
            .map_err(KeelError::Io)?;

        let span = if block_size == 0 {
            effective
        } else {
            block_size as u64
        };

        let mut blocks = Vec::new();
        let mut remaining = effective;
        let mut chunk = vec![0u8; 32 * 1024];
        let mut short_read = false;
        while remaining > 0 && !short_read {
            let mut this_block = span.min(remaining);
            let mut hasher = BlockHasher::new(&algorithm);
            while this_block > 0 {
                let take = this_block.min(chunk.len() as u64) as usize;
                let n = file.read(&mut chunk[..take]).map_err(KeelError::Io)?;
                if n == 0 {
                    short_read = true;
                    break;
                }
                hasher.update(&chunk[..n]);
                this_block -= n as u64;
                remaining -= n as u64;
            }
            blocks.push(hasher.finish());
        }

        Ok((algorithm, blocks))
    }
}

fn create_symlink(target: &Path, link_path: &Path) -> KeelResult<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link_path).map_err(KeelError::Io)
    }
    #[cfg(not(unix))]
    {
        let _ = (target, link_path);
        Err(KeelError::NotImplemented(
            "symlinks are not supported on this platform".to_string(),
        ))
    }
}

enum BlockHasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl BlockHasher {
    fn new(algorithm: &str) -> Self {
        match algorithm {
            "md5" => Self::Md5(Md5::new()),
            "sha1" => Self::Sha1(Sha1::new()),
            "sha512" => Self::Sha512(Sha512::new()),
            _ => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            Self::Md5(h) => h.finalize().to_vec(),
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(normalize_path(Path::new("a/b")), PathBuf::from("/a/b"));
    }

    #[test]
    fn test_supported_versions() {
        let writer_less_config = SftpConfig::default();
        assert_eq!(writer_less_config.max_version, SFTP_V6);

        let config = SftpConfig {
            forced_version: Some(4),
            ..SftpConfig::default()
        };
        // forced_version narrows the advertised set to one entry
        assert_eq!(config.forced_version, Some(4));
    }

    #[test]
    fn test_default_client_extensions_include_md5() {
        let extras = default_client_extensions();
        assert!(extras.contains(&"md5-hash".to_string()));
        assert!(extras.contains(&"version-select".to_string()));
        assert!(!extras.contains(&"text-seek".to_string()));
    }
}
