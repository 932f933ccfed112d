use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use log::error;

use crate::entry::Fingerprint;
use crate::hashing::HashingReader;
use crate::metadata;

/// Result of a dedup query: either the body is already stored somewhere in
/// the group, or it is new. The content hash is known either way.
pub enum Lookup {
    Duplicate(String),
    Fresh(String),
}

/// In-memory view of the deduplication domain for one backup run: every
/// content hash stored as `unique` by a committed backup of the group, plus a
/// per-path fingerprint map from the most recent backup for the
/// modification-time shortcut.
#[derive(Default)]
pub struct DedupIndex {
    known_hashes: HashSet<String>,
    prev_files: HashMap<Utf8PathBuf, (String, Fingerprint)>,
}

impl DedupIndex {
    /// Loads the metadata of the given backups (oldest first). The
    /// fingerprint map is populated from the last one only, and only when
    /// `trust_modify_time` is set. A backup whose metadata fails to load is
    /// logged and skipped; the returned flag is false in that case.
    pub fn load(backup_paths: &[impl AsRef<Path>], trust_modify_time: bool) -> (DedupIndex, bool) {
        let mut index = DedupIndex::default();
        let mut ok = true;

        for (position, backup_path) in backup_paths.iter().enumerate() {
            let backup_path = backup_path.as_ref();
            let with_prev = trust_modify_time && position == backup_paths.len() - 1;

            if let Err(e) = index.load_backup(backup_path, with_prev) {
                error!("Failed to load {:?} backup metadata: {:#}.", backup_path, e);
                ok = false;
            }
        }

        (index, ok)
    }

    fn load_backup(&mut self, backup_path: &Path, with_prev: bool) -> Result<()> {
        for record in metadata::read(backup_path)? {
            let record = record?;

            if with_prev {
                self.prev_files.insert(
                    record.path,
                    (record.hash.clone(), record.fingerprint),
                );
            }

            if record.unique {
                self.known_hashes.insert(record.hash);
            }
        }

        Ok(())
    }

    /// Decides whether the body behind `reader` is a duplicate.
    ///
    /// If the path's fingerprint matches the one recorded by the most recent
    /// backup, the recorded hash is returned without reading a byte.
    /// Otherwise the body is drained through the hashing reader, rewound, and
    /// the fresh hash is checked against the known set. A body that yields
    /// fewer bytes than `size` promised is an error: the file shrank while we
    /// were reading it.
    pub fn lookup(
        &self,
        path: &Utf8Path,
        fingerprint: &Fingerprint,
        reader: &mut (impl Read + Seek),
        size: u64,
    ) -> Result<Lookup> {
        if let Some((hash, prev_fingerprint)) = self.prev_files.get(path) {
            if prev_fingerprint == fingerprint {
                return Ok(Lookup::Duplicate(hash.clone()));
            }
        }

        let (hash, read_size) = HashingReader::new(reader).digest_to_end()?;
        if read_size != size {
            bail!("the file shrank during the backup ({} bytes instead of {})", read_size, size);
        }

        if self.known_hashes.contains(&hash) {
            Ok(Lookup::Duplicate(hash))
        } else {
            Ok(Lookup::Fresh(hash))
        }
    }

    /// Registers a hash that has just been written as `unique`.
    pub fn insert(&mut self, hash: String) {
        self.known_hashes.insert(hash);
    }
}
