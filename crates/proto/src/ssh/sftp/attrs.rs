//! SFTP file attributes across protocol versions.
//!
//! Attributes are a closed set modeled as a struct of options rather than
//! a free-form map. The wire layout differs between v3 (uid/gid, 32-bit
//! times) and v4+ (type byte, owner/group strings, 64-bit times); both
//! directions go through [`FileAttributes::encode`] /
//! [`FileAttributes::decode`] with the negotiated version.
//!
//! Attributes the platform cannot supply or apply flow through the
//! configured [`UnsupportedAttributePolicy`].

use crate::ssh::buffer::Buffer;
use keel_platform::{KeelError, KeelResult};
use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Attribute presence flags (valid-attribute-flags).
pub mod attr_flags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x0000_0001;
    /// SSH_FILEXFER_ATTR_UIDGID (v3 only)
    pub const UIDGID: u32 = 0x0000_0002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x0000_0004;
    /// SSH_FILEXFER_ATTR_ACMODTIME (v3) / ACCESSTIME (v4+)
    pub const ACMODTIME: u32 = 0x0000_0008;
    /// SSH_FILEXFER_ATTR_ACCESSTIME (v4+)
    pub const ACCESSTIME: u32 = 0x0000_0008;
    /// SSH_FILEXFER_ATTR_CREATETIME (v4+)
    pub const CREATETIME: u32 = 0x0000_0010;
    /// SSH_FILEXFER_ATTR_MODIFYTIME (v4+)
    pub const MODIFYTIME: u32 = 0x0000_0020;
    /// SSH_FILEXFER_ATTR_OWNERGROUP (v4+)
    pub const OWNERGROUP: u32 = 0x0000_0080;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// File type byte (v4+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    /// SSH_FILEXFER_TYPE_REGULAR
    Regular = 1,
    /// SSH_FILEXFER_TYPE_DIRECTORY
    Directory = 2,
    /// SSH_FILEXFER_TYPE_SYMLINK
    Symlink = 3,
    /// SSH_FILEXFER_TYPE_SPECIAL
    Special = 4,
    /// SSH_FILEXFER_TYPE_UNKNOWN
    Unknown = 5,
}

impl FileType {
    /// Converts from u8, defaulting to Unknown.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Regular,
            2 => Self::Directory,
            3 => Self::Symlink,
            4 => Self::Special,
            _ => Self::Unknown,
        }
    }
}

/// How to treat attributes the platform cannot supply or apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedAttributePolicy {
    /// Silently skip.
    Ignore,
    /// Log a warning and skip.
    Warn,
    /// Fail the request.
    ThrowException,
}

impl UnsupportedAttributePolicy {
    /// Applies the policy to one unsupported attribute.
    pub fn handle(&self, attribute: &str) -> KeelResult<()> {
        match self {
            Self::Ignore => Ok(()),
            Self::Warn => {
                warn!(attribute, "unsupported attribute skipped");
                Ok(())
            }
            Self::ThrowException => Err(KeelError::NotImplemented(format!(
                "Unsupported attribute: {}",
                attribute
            ))),
        }
    }
}

/// The attribute union across every supported view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File type (encoded from v4 on).
    pub file_type: Option<FileType>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Numeric owner (v3).
    pub uid: Option<u32>,
    /// Numeric group (v3).
    pub gid: Option<u32>,
    /// Owner name (v4+).
    pub owner: Option<String>,
    /// Group name (v4+).
    pub group: Option<String>,
    /// POSIX permission bits.
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch.
    pub atime: Option<u64>,
    /// Creation time, seconds since the epoch (v4+).
    pub create_time: Option<u64>,
    /// Modification time, seconds since the epoch.
    pub mtime: Option<u64>,
}

impl FileAttributes {
    /// Empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gathers attributes from filesystem metadata.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mut attrs = Self::new();

        attrs.file_type = Some(if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_symlink() {
            FileType::Symlink
        } else if metadata.is_file() {
            FileType::Regular
        } else {
            FileType::Special
        });
        attrs.size = Some(metadata.len());
        attrs.atime = metadata
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        attrs.mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        attrs.create_time = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            attrs.uid = Some(metadata.uid());
            attrs.gid = Some(metadata.gid());
            attrs.permissions = Some(metadata.mode() & 0o7777);
        }
        #[cfg(not(unix))]
        {
            attrs.permissions = Some(if metadata.permissions().readonly() {
                0o444
            } else {
                0o644
            });
        }

        attrs
    }

    /// Serializes for the negotiated protocol version.
    pub fn encode(&self, version: u32, buf: &mut Buffer) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= attr_flags::SIZE;
        }
        if version <= 3 {
            if self.uid.is_some() && self.gid.is_some() {
                flags |= attr_flags::UIDGID;
            }
        } else if self.owner.is_some() || self.uid.is_some() {
            flags |= attr_flags::OWNERGROUP;
        }
        if self.permissions.is_some() {
            flags |= attr_flags::PERMISSIONS;
        }
        if version <= 3 {
            if self.atime.is_some() && self.mtime.is_some() {
                flags |= attr_flags::ACMODTIME;
            }
        } else {
            if self.atime.is_some() {
                flags |= attr_flags::ACCESSTIME;
            }
            if self.create_time.is_some() {
                flags |= attr_flags::CREATETIME;
            }
            if self.mtime.is_some() {
                flags |= attr_flags::MODIFYTIME;
            }
        }

        buf.put_u32(flags);

        if version >= 4 {
            buf.put_u8(self.file_type.unwrap_or(FileType::Unknown) as u8);
        }
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if version <= 3 {
            if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
                buf.put_u32(uid);
                buf.put_u32(gid);
            }
        } else if flags & attr_flags::OWNERGROUP != 0 {
            // Numeric ids serialize as their decimal names when no
            // symbolic name is known.
            let owner = self
                .owner
                .clone()
                .or_else(|| self.uid.map(|u| u.to_string()))
                .unwrap_or_default();
            let group = self
                .group
                .clone()
                .or_else(|| self.gid.map(|g| g.to_string()))
                .unwrap_or_default();
            buf.put_str(&owner);
            buf.put_str(&group);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if version <= 3 {
            if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
                buf.put_u32(atime as u32);
                buf.put_u32(mtime as u32);
            }
        } else {
            if let Some(atime) = self.atime {
                buf.put_u64(atime);
            }
            if let Some(create_time) = self.create_time {
                buf.put_u64(create_time);
            }
            if let Some(mtime) = self.mtime {
                buf.put_u64(mtime);
            }
        }
    }

    /// Parses attributes for the negotiated protocol version.
    pub fn decode(version: u32, buf: &mut Buffer) -> KeelResult<Self> {
        let flags = buf.get_u32()?;
        let mut attrs = Self::new();

        if version >= 4 {
            attrs.file_type = Some(FileType::from_u8(buf.get_u8()?));
        }
        if flags & attr_flags::SIZE != 0 {
            attrs.size = Some(buf.get_u64()?);
        }
        if version <= 3 {
            if flags & attr_flags::UIDGID != 0 {
                attrs.uid = Some(buf.get_u32()?);
                attrs.gid = Some(buf.get_u32()?);
            }
        } else if flags & attr_flags::OWNERGROUP != 0 {
            let owner = buf.get_string_utf8()?;
            let group = buf.get_string_utf8()?;
            // Decimal owner/group names round-trip as numeric ids.
            attrs.uid = owner.parse().ok();
            attrs.gid = group.parse().ok();
            attrs.owner = Some(owner);
            attrs.group = Some(group);
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            attrs.permissions = Some(buf.get_u32()?);
        }
        if version <= 3 {
            if flags & attr_flags::ACMODTIME != 0 {
                attrs.atime = Some(buf.get_u32()? as u64);
                attrs.mtime = Some(buf.get_u32()? as u64);
            }
        } else {
            if flags & attr_flags::ACCESSTIME != 0 {
                attrs.atime = Some(buf.get_u64()?);
            }
            if flags & attr_flags::CREATETIME != 0 {
                attrs.create_time = Some(buf.get_u64()?);
            }
            if flags & attr_flags::MODIFYTIME != 0 {
                attrs.mtime = Some(buf.get_u64()?);
            }
        }

        Ok(attrs)
    }

    /// Applies settable attributes to a path (SETSTAT / FSETSTAT).
    ///
    /// The whitelist is {size, uid, gid, owner, group, permissions,
    /// creationTime, lastModifiedTime, lastAccessTime}; anything the
    /// platform cannot apply goes through `policy`.
    pub fn apply_to(
        &self,
        path: &Path,
        policy: UnsupportedAttributePolicy,
    ) -> KeelResult<()> {
        if let Some(size) = self.size {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(KeelError::Io)?;
            file.set_len(size).map_err(KeelError::Io)?;
        }

        if let Some(permissions) = self.permissions {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions))
                    .map_err(KeelError::Io)?;
            }
            #[cfg(not(unix))]
            {
                let _ = permissions;
                policy.handle("permissions")?;
            }
        }

        if self.uid.is_some() || self.gid.is_some() {
            #[cfg(unix)]
            std::os::unix::fs::chown(path, self.uid, self.gid).map_err(KeelError::Io)?;
            #[cfg(not(unix))]
            policy.handle("uid/gid")?;
        }

        if (self.owner.is_some() || self.group.is_some()) && self.uid.is_none() {
            // Symbolic names require a user database lookup the core does
            // not perform.
            policy.handle("owner/group")?;
        }

        if self.atime.is_some() || self.mtime.is_some() {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .read(true)
                .open(path)
                .map_err(KeelError::Io)?;
            let mut times = std::fs::FileTimes::new();
            if let Some(atime) = self.atime {
                times = times.set_accessed(UNIX_EPOCH + Duration::from_secs(atime));
            }
            if let Some(mtime) = self.mtime {
                times = times.set_modified(UNIX_EPOCH + Duration::from_secs(mtime));
            }
            file.set_times(times).map_err(KeelError::Io)?;
        }

        if self.create_time.is_some() {
            policy.handle("creationTime")?;
        }

        Ok(())
    }

    /// Formats an `ls -l`-style long name for NAME replies.
    pub fn long_name(&self, filename: &str) -> String {
        let perms = self.permissions.unwrap_or(0);
        let kind = match self.file_type {
            Some(FileType::Directory) => 'd',
            Some(FileType::Symlink) => 'l',
            _ => '-',
        };
        let mut mode = String::with_capacity(10);
        mode.push(kind);
        for shift in [6u32, 3, 0] {
            let bits = (perms >> shift) & 0o7;
            mode.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            mode.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            mode.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        format!(
            "{} 1 {} {} {} Jan  1 00:00 {}",
            mode,
            self.uid.map_or("owner".to_string(), |u| u.to_string()),
            self.gid.map_or("group".to_string(), |g| g.to_string()),
            self.size.unwrap_or(0),
            filename
        )
    }
}

/// Converts a system time into epoch seconds for attribute replies.
pub fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
