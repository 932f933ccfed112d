use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use camino::Utf8PathBuf;

use crate::entry::Fingerprint;

/// Name of the metadata log inside a backup directory.
pub const METADATA_NAME: &str = "metadata.bz2";

/// One line of the metadata log: the content hash of a regular file, whether
/// its body is stored in this backup (`unique`) or borrowed from another
/// backup in the group (`extern`), its fingerprint and its absolute path.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub hash: String,
    pub unique: bool,
    pub fingerprint: Fingerprint,
    pub path: Utf8PathBuf,
}

impl MetadataRecord {
    fn parse(line: &str) -> Result<MetadataRecord> {
        let mut fields = line.splitn(4, ' ');

        let mut next = || -> Result<&str> {
            fields
                .next()
                .with_context(|| format!("corrupt metadata line: {:?}", line))
        };
        let (hash, status, fingerprint, path) = (next()?, next()?, next()?, next()?);

        let unique = match status {
            "unique" => true,
            "extern" => false,
            _ => bail!("corrupt metadata line (bad status): {:?}", line),
        };

        if hash.is_empty() || hash.bytes().any(|c| !c.is_ascii_hexdigit()) {
            bail!("corrupt metadata line (bad hash): {:?}", line);
        }

        if !path.starts_with('/') {
            bail!("corrupt metadata line (bad path): {:?}", line);
        }

        Ok(MetadataRecord {
            hash: hash.to_owned(),
            unique,
            fingerprint: fingerprint
                .parse()
                .with_context(|| format!("corrupt metadata line: {:?}", line))?,
            path: Utf8PathBuf::from(path),
        })
    }
}

/// Append-only writer for a backup's metadata log.
pub struct MetadataWriter {
    out: BufWriter<BzEncoder<File>>,
}

impl MetadataWriter {
    pub fn create(backup_path: &Path) -> Result<MetadataWriter> {
        let path = backup_path.join(METADATA_NAME);
        let file =
            File::create(&path).with_context(|| format!("failed to create {:?}", path))?;

        Ok(MetadataWriter {
            out: BufWriter::new(BzEncoder::new(file, bzip2::Compression::best())),
        })
    }

    pub fn write(&mut self, record: &MetadataRecord) -> Result<()> {
        let status = if record.unique { "unique" } else { "extern" };
        writeln!(
            self.out,
            "{} {} {} {}",
            record.hash, status, record.fingerprint, record.path
        )
        .context("failed to write backup metadata")?;
        Ok(())
    }

    /// Finalizes the compressed stream and returns the underlying file so the
    /// caller can fsync it before the commit rename.
    pub fn finish(self) -> Result<File> {
        let encoder = self
            .out
            .into_inner()
            .map_err(|e| e.into_error())
            .context("failed to flush backup metadata")?;
        encoder.finish().context("failed to finalize backup metadata")
    }
}

/// Reads a backup's metadata log, yielding one record per line. Blank lines
/// are tolerated; anything else that doesn't match the schema is an error.
pub fn read(backup_path: &Path) -> Result<impl Iterator<Item = Result<MetadataRecord>>> {
    let path = backup_path.join(METADATA_NAME);
    let file = File::open(&path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(BzDecoder::new(file));

    Ok(reader.lines().filter_map(|line| match line {
        Ok(line) if line.is_empty() => None,
        Ok(line) => Some(MetadataRecord::parse(&line)),
        Err(e) => Some(Err(anyhow::Error::new(e).context("failed to read backup metadata"))),
    }))
}
