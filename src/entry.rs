use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::str::FromStr;

use anyhow::{Context, Result, bail};

/// File kinds representable in a backup archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
}

impl EntryKind {
    /// Classify an lstat result.
    ///
    /// Returns `None` for types the archive cannot represent (sockets and
    /// anything with unknown mode bits).
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let file_type = metadata.file_type();

        if file_type.is_file() {
            Some(EntryKind::Regular)
        } else if file_type.is_dir() {
            Some(EntryKind::Directory)
        } else if file_type.is_symlink() {
            Some(EntryKind::Symlink)
        } else if file_type.is_fifo() {
            Some(EntryKind::Fifo)
        } else if file_type.is_char_device() {
            Some(EntryKind::CharDevice)
        } else if file_type.is_block_device() {
            Some(EntryKind::BlockDevice)
        } else {
            None
        }
    }
}

/// Metadata captured for one filesystem entry at scan time.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub rdev: u64,
}

impl EntryMeta {
    pub fn new(kind: EntryKind, metadata: &Metadata) -> Self {
        Self {
            kind,
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime: metadata.mtime(),
            size: metadata.size(),
            dev: metadata.dev(),
            ino: metadata.ino(),
            nlink: metadata.nlink(),
            rdev: metadata.rdev(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            dev: self.dev,
            ino: self.ino,
            mtime: self.mtime,
        }
    }
}

/// Fast identity proxy for an unchanged file: device, inode and whole-second
/// modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub dev: u64,
    pub ino: u64,
    pub mtime: i64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dev, self.ino, self.mtime)
    }
}

impl FromStr for Fingerprint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');

        let mut next = || -> Result<&str> {
            parts
                .next()
                .with_context(|| format!("invalid fingerprint: {:?}", s))
        };
        let (dev, ino, mtime) = (next()?, next()?, next()?);

        if parts.next().is_some() {
            bail!("invalid fingerprint: {:?}", s);
        }

        Ok(Fingerprint {
            dev: dev
                .parse()
                .with_context(|| format!("invalid fingerprint device: {:?}", s))?,
            ino: ino
                .parse()
                .with_context(|| format!("invalid fingerprint inode: {:?}", s))?,
            mtime: mtime
                .parse()
                .with_context(|| format!("invalid fingerprint mtime: {:?}", s))?,
        })
    }
}
