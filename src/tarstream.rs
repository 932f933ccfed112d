use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use camino::Utf8Path;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;

use crate::entry::{EntryKind, EntryMeta};

/// Name of the data archive inside a backup directory, before the optional
/// compression suffix.
pub const DATA_NAME: &str = "data.tar";

/// Compression wrapper around the data archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Compression {
    #[serde(rename = "none")]
    None,
    #[default]
    #[serde(rename = "bz2")]
    Bzip2,
    #[serde(rename = "gz")]
    Gzip,
}

impl Compression {
    pub fn archive_name(self) -> &'static str {
        match self {
            Compression::None => DATA_NAME,
            Compression::Bzip2 => "data.tar.bz2",
            Compression::Gzip => "data.tar.gz",
        }
    }
}

/// Strips the leading slash from an absolute path, yielding the name under
/// which it is stored in the archive.
pub fn tar_name(path: &Utf8Path) -> Result<&Utf8Path> {
    path.strip_prefix("/")
        .map_err(|_| anyhow!("an attempt to store a non-absolute path: {:?}", path))
}

/// Builds a tar header from entry metadata. Owner names that don't fit the
/// header are dropped, leaving the numeric ids.
pub fn file_header(meta: &EntryMeta, uname: Option<&str>, gname: Option<&str>) -> tar::Header {
    let mut header = tar::Header::new_gnu();

    header.set_entry_type(match meta.kind {
        EntryKind::Regular => tar::EntryType::Regular,
        EntryKind::Directory => tar::EntryType::Directory,
        EntryKind::Symlink => tar::EntryType::Symlink,
        EntryKind::Fifo => tar::EntryType::Fifo,
        EntryKind::CharDevice => tar::EntryType::Char,
        EntryKind::BlockDevice => tar::EntryType::Block,
    });

    header.set_size(0);
    header.set_mode(meta.mode & 0o7777);
    header.set_uid(meta.uid.into());
    header.set_gid(meta.gid.into());
    header.set_mtime(meta.mtime.max(0) as u64);

    if let Some(name) = uname {
        let _ = header.set_username(name);
    }
    if let Some(name) = gname {
        let _ = header.set_groupname(name);
    }

    if matches!(meta.kind, EntryKind::CharDevice | EntryKind::BlockDevice) {
        let _ = header.set_device_major(nix::sys::stat::major(meta.rdev) as u32);
        let _ = header.set_device_minor(nix::sys::stat::minor(meta.rdev) as u32);
    }

    header
}

enum Builder {
    Plain(tar::Builder<BufWriter<File>>),
    Bzip2(tar::Builder<BufWriter<BzEncoder<File>>>),
    Gzip(tar::Builder<BufWriter<GzEncoder<File>>>),
}

/// Streaming writer for a backup's data archive.
pub struct TarWriter {
    inner: Builder,
}

impl TarWriter {
    pub fn create(backup_path: &Path, compression: Compression) -> Result<TarWriter> {
        let path = backup_path.join(compression.archive_name());
        let file = File::create(&path).with_context(|| format!("failed to create {:?}", path))?;

        let inner = match compression {
            Compression::None => Builder::Plain(tar::Builder::new(BufWriter::new(file))),
            Compression::Bzip2 => Builder::Bzip2(tar::Builder::new(BufWriter::new(
                BzEncoder::new(file, bzip2::Compression::best()),
            ))),
            Compression::Gzip => Builder::Gzip(tar::Builder::new(BufWriter::new(
                GzEncoder::new(file, flate2::Compression::default()),
            ))),
        };

        Ok(TarWriter { inner })
    }

    /// Appends one entry. The header's size must already match what `body`
    /// will yield.
    pub fn append(
        &mut self,
        header: &mut tar::Header,
        name: &Utf8Path,
        body: &mut dyn Read,
    ) -> Result<()> {
        let name = tar_name(name)?;
        match &mut self.inner {
            Builder::Plain(builder) => builder.append_data(header, name, body),
            Builder::Bzip2(builder) => builder.append_data(header, name, body),
            Builder::Gzip(builder) => builder.append_data(header, name, body),
        }
        .with_context(|| format!("failed to add {:?} to the backup archive", name))
    }

    /// Appends a symlink or hard-link entry. Hard-link targets are stored
    /// names (no leading slash); symlink targets are stored verbatim.
    pub fn append_link(
        &mut self,
        header: &mut tar::Header,
        name: &Utf8Path,
        target: &Path,
    ) -> Result<()> {
        let name = tar_name(name)?;
        match &mut self.inner {
            Builder::Plain(builder) => builder.append_link(header, name, target),
            Builder::Bzip2(builder) => builder.append_link(header, name, target),
            Builder::Gzip(builder) => builder.append_link(header, name, target),
        }
        .with_context(|| format!("failed to add {:?} to the backup archive", name))
    }

    /// Writes the archive trailer, finalizes the compression wrapper and
    /// returns the underlying file so the caller can fsync it before the
    /// commit rename.
    pub fn finish(self) -> Result<File> {
        let context = "failed to finalize the backup archive";

        match self.inner {
            Builder::Plain(builder) => {
                let writer = builder.into_inner().context(context)?;
                writer.into_inner().map_err(|e| e.into_error()).context(context)
            }
            Builder::Bzip2(builder) => {
                let writer = builder.into_inner().context(context)?;
                let encoder = writer.into_inner().map_err(|e| e.into_error()).context(context)?;
                encoder.finish().context(context)
            }
            Builder::Gzip(builder) => {
                let writer = builder.into_inner().context(context)?;
                let encoder = writer.into_inner().map_err(|e| e.into_error()).context(context)?;
                encoder.finish().context(context)
            }
        }
    }
}

/// Read access to a backup's data archive.
///
/// The archive is found by probing the known compression suffixes. Unless
/// `in_place` is requested, a compressed archive is decompressed once into an
/// unlinked temporary file, so that repeated entry lookups don't pay the
/// decompression cost every time.
pub struct TarReader {
    path: PathBuf,
    compression: Compression,
    decompressed: Option<File>,
}

impl TarReader {
    pub fn open(backup_path: &Path, in_place: bool) -> Result<TarReader> {
        let compression = [Compression::None, Compression::Bzip2, Compression::Gzip]
            .into_iter()
            .find(|compression| backup_path.join(compression.archive_name()).exists())
            .with_context(|| format!("{:?} contains no backup data archive", backup_path))?;

        let path = backup_path.join(compression.archive_name());

        let decompressed = if compression == Compression::None || in_place {
            None
        } else {
            let file = File::open(&path).with_context(|| format!("failed to open {:?}", path))?;
            let mut temp = tempfile::tempfile()
                .context("failed to create a temporary file for archive decompression")?;

            match compression {
                Compression::Bzip2 => io::copy(&mut BzDecoder::new(file), &mut temp),
                Compression::Gzip => io::copy(&mut GzDecoder::new(file), &mut temp),
                Compression::None => unreachable!(),
            }
            .with_context(|| format!("failed to decompress {:?}", path))?;

            temp.seek(SeekFrom::Start(0))
                .context("failed to rewind the decompressed archive")?;
            Some(temp)
        };

        Ok(TarReader {
            path,
            compression,
            decompressed,
        })
    }

    /// Opens a fresh single-pass view of the archive. Views share the
    /// underlying temporary file, so only one may be read at a time.
    pub fn archive(&self) -> Result<tar::Archive<Box<dyn Read>>> {
        let reader: Box<dyn Read> = match &self.decompressed {
            Some(file) => {
                let mut file = file
                    .try_clone()
                    .context("failed to reopen the decompressed archive")?;
                file.seek(SeekFrom::Start(0))
                    .context("failed to rewind the decompressed archive")?;
                Box::new(file)
            }
            None => {
                let file = File::open(&self.path)
                    .with_context(|| format!("failed to open {:?}", self.path))?;
                match self.compression {
                    Compression::None => Box::new(file),
                    Compression::Bzip2 => Box::new(BzDecoder::new(file)),
                    Compression::Gzip => Box::new(GzDecoder::new(file)),
                }
            }
        };

        Ok(tar::Archive::new(reader))
    }

    /// Copies the body of the named regular entry into `out`. Returns false
    /// if the archive has no such entry.
    pub fn extract_body(&self, name: &Utf8Path, out: &mut dyn Write) -> Result<bool> {
        let mut archive = self.archive()?;

        for entry in archive.entries().context("failed to read the backup archive")? {
            let mut entry = entry.context("failed to read the backup archive")?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            if entry.path().ok().as_deref() == Some(name.as_std_path()) {
                io::copy(&mut entry, out)
                    .with_context(|| format!("failed to extract {:?}", name))?;
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Reads exactly `size` bytes from the source, zero-padding the tail if the
/// source shrinks mid-read, so a tar entry body always matches its header.
pub struct PaddedReader<R> {
    inner: R,
    remaining: u64,
    padded: u64,
}

impl<R: Read> PaddedReader<R> {
    pub fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            padded: 0,
        }
    }

    /// Number of zero bytes substituted for missing source bytes.
    pub fn padded_bytes(&self) -> u64 {
        self.padded
    }
}

impl<R: Read> Read for PaddedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let size = self.inner.read(&mut buf[..want])?;

        if size == 0 {
            buf[..want].fill(0);
            self.padded += want as u64;
            self.remaining -= want as u64;
            return Ok(want);
        }

        self.remaining -= size as u64;
        Ok(size)
    }
}
