use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, warn};

use crate::config::Config;
use crate::dedup::{DedupIndex, Lookup};
use crate::entry::{EntryKind, EntryMeta, Fingerprint};
use crate::hashing;
use crate::metadata::{MetadataRecord, MetadataWriter};
use crate::owners::OwnerCache;
use crate::store::{self, BackupSlot, GroupStore};
use crate::tarstream::{self, PaddedReader, TarWriter};

/// Outcome of adding one entry to the backup. Failures are per-entry: the
/// caller logs them and flips the run's success flag, but keeps going.
/// Errors that compromise the archive itself come back as `Err` instead.
pub enum AddOutcome {
    Added,
    Skipped,
    Failed(anyhow::Error),
}

/// Writes one backup: an in-progress dot-prefixed directory that receives a
/// data archive and a metadata log entry by entry, and either becomes visible
/// atomically on `commit` or is deleted when the writer is dropped.
pub struct BackupWriter<'a> {
    store: &'a GroupStore,
    slot: BackupSlot,

    data: Option<TarWriter>,
    metadata: Option<MetadataWriter>,

    index: DedupIndex,
    owners: OwnerCache,

    added: HashSet<Utf8PathBuf>,
    inodes: HashMap<(u64, u64), Utf8PathBuf>,

    preserve_hard_links: bool,
    max_backup_groups: usize,
    entries: u64,
    committed: bool,
}

impl<'a> BackupWriter<'a> {
    /// Creates the in-progress directory and loads the group's dedup index.
    /// The returned flag is false when some prior backup's metadata couldn't
    /// be loaded (the backup proceeds, with reduced deduplication).
    pub fn create(store: &'a GroupStore, config: &Config) -> Result<(BackupWriter<'a>, bool)> {
        let slot = store.create_backup(config.max_backups)?;
        info!("Creating backup {}/{}...", slot.group, slot.name);

        let prior: Vec<PathBuf> = store
            .backups(&slot.group, true)?
            .iter()
            .map(|name| store.backup_path(&slot.group, name))
            .collect();
        let (index, index_ok) = DedupIndex::load(&prior, config.trust_modify_time);

        let streams = (|| -> Result<(TarWriter, MetadataWriter)> {
            Ok((
                TarWriter::create(&slot.path, config.compression)?,
                MetadataWriter::create(&slot.path)?,
            ))
        })();

        let (data, metadata) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                store.cancel_backup(&slot.group, &slot.name);
                return Err(e);
            }
        };

        let writer = BackupWriter {
            store,
            slot,
            data: Some(data),
            metadata: Some(metadata),
            index,
            owners: OwnerCache::default(),
            added: HashSet::new(),
            inodes: HashMap::new(),
            preserve_hard_links: config.preserve_hard_links,
            max_backup_groups: config.max_backup_groups,
            entries: 0,
            committed: false,
        };

        Ok((writer, index_ok))
    }

    pub fn group(&self) -> &str {
        &self.slot.group
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Adds one filesystem entry. `body` must be a seekable stream of the
    /// file's contents for regular files; it is read twice when the dedup
    /// index has to hash it.
    pub fn add_file(
        &mut self,
        path: &Path,
        meta: &EntryMeta,
        link_target: Option<&Path>,
        body: Option<&mut File>,
    ) -> Result<AddOutcome> {
        let Some(path) = Utf8Path::from_path(path) else {
            warn!("Skipping {:?}: non-UTF-8 paths are not supported.", path);
            return Ok(AddOutcome::Skipped);
        };

        if path.as_str().bytes().any(|c| matches!(c, b'\0' | b'\n' | b'\r')) {
            return Ok(AddOutcome::Failed(anyhow!(
                "the path contains control characters"
            )));
        }
        if !path.is_absolute() {
            return Ok(AddOutcome::Failed(anyhow!("the path is not absolute")));
        }

        if self.added.contains(path) {
            debug!("Skipping {:?}: it's already added to the backup.", path);
            return Ok(AddOutcome::Skipped);
        }

        let uname = self.owners.user_name(meta.uid);
        let gname = self.owners.group_name(meta.gid);
        let mut header = tarstream::file_header(meta, uname.as_deref(), gname.as_deref());

        match meta.kind {
            EntryKind::Directory | EntryKind::Fifo | EntryKind::CharDevice | EntryKind::BlockDevice => {
                self.data().append(&mut header, path, &mut io::empty())?;
            }

            EntryKind::Symlink => {
                let Some(target) = link_target else {
                    return Ok(AddOutcome::Failed(anyhow!("symlink without a target")));
                };
                self.data().append_link(&mut header, path, target)?;
            }

            EntryKind::Regular => {
                if self.preserve_hard_links && meta.nlink > 1 {
                    if let Some(first) = self.inodes.get(&(meta.dev, meta.ino)).cloned() {
                        debug!("{:?} is a hard link to already stored {:?}.", path, first);
                        header.set_entry_type(tar::EntryType::Link);
                        let target = tarstream::tar_name(&first)?;
                        self.data()
                            .append_link(&mut header, path, target.as_std_path())?;
                        self.added.insert(path.to_owned());
                        self.entries += 1;
                        return Ok(AddOutcome::Added);
                    }
                }

                match body {
                    Some(file) if meta.size > 0 => {
                        return self.add_file_body(header, path, meta, file);
                    }
                    Some(_) => {
                        // Empty files are always stored unique: a zero-byte
                        // body is cheaper than the extern bookkeeping
                        self.data().append(&mut header, path, &mut io::empty())?;
                        self.write_metadata(
                            hashing::hash_bytes(b""),
                            true,
                            meta.fingerprint(),
                            path,
                        )?;
                    }
                    None => {
                        debug!("Storing {:?} without a body stream.", path);
                        self.data().append(&mut header, path, &mut io::empty())?;
                    }
                }
            }
        }

        self.remember_inode(path, meta);
        self.added.insert(path.to_owned());
        self.entries += 1;
        Ok(AddOutcome::Added)
    }

    fn add_file_body(
        &mut self,
        mut header: tar::Header,
        path: &Utf8Path,
        meta: &EntryMeta,
        file: &mut File,
    ) -> Result<AddOutcome> {
        let fingerprint = meta.fingerprint();

        let lookup = match self.index.lookup(path, &fingerprint, file, meta.size) {
            Ok(lookup) => lookup,
            Err(e) => return Ok(AddOutcome::Failed(e)),
        };

        match lookup {
            Lookup::Duplicate(hash) => {
                debug!("{:?} deduplicated: its contents are already stored.", path);
                header.set_size(0);
                self.data().append(&mut header, path, &mut io::empty())?;
                self.write_metadata(hash, false, fingerprint, path)?;
            }
            Lookup::Fresh(hash) => {
                header.set_size(meta.size);

                let mut body = PaddedReader::new(&mut *file, meta.size);
                self.data().append(&mut header, path, &mut body)?;

                let padded = body.padded_bytes();
                if padded != 0 {
                    // The entry is already in the archive with a zero-padded
                    // tail; its hash isn't recorded because it no longer
                    // matches the stored body.
                    self.added.insert(path.to_owned());
                    self.entries += 1;
                    return Ok(AddOutcome::Failed(anyhow!(
                        "the file shrank during the backup ({} missing bytes stored as zeroes)",
                        padded
                    )));
                }

                self.write_metadata(hash.clone(), true, fingerprint, path)?;
                self.index.insert(hash);
            }
        }

        self.remember_inode(path, meta);
        self.added.insert(path.to_owned());
        self.entries += 1;
        Ok(AddOutcome::Added)
    }

    /// Registers the first successfully stored path of a multiply-linked
    /// regular file, so later sightings become hard-link records.
    fn remember_inode(&mut self, path: &Utf8Path, meta: &EntryMeta) {
        if self.preserve_hard_links && meta.kind == EntryKind::Regular && meta.nlink > 1 {
            self.inodes
                .entry((meta.dev, meta.ino))
                .or_insert_with(|| path.to_owned());
        }
    }

    /// Finalizes both streams, makes the backup visible with an atomic rename
    /// and rotates old groups out. Returns false when rotation failed for
    /// some group.
    pub fn commit(mut self) -> Result<bool> {
        if self.entries == 0 {
            bail!("nothing was added to the backup");
        }

        debug!("Flushing backup data...");

        let metadata = self.metadata.take().unwrap().finish()?;
        metadata
            .sync_all()
            .context("failed to fsync backup metadata")?;

        let data = self.data.take().unwrap().finish()?;
        data.sync_all().context("failed to fsync the backup archive")?;

        store::fsync_dir(&self.slot.path)?;

        self.store.commit_backup(&self.slot.group, &self.slot.name)?;
        self.committed = true;
        info!("Backup {}/{} is committed.", self.slot.group, self.slot.name);

        self.store.rotate_groups(self.max_backup_groups)
    }
}

impl Drop for BackupWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // Close both streams before deleting the directory under them
            self.metadata.take();
            self.data.take();
            self.store.cancel_backup(&self.slot.group, &self.slot.name);
        }
    }
}

impl BackupWriter<'_> {
    fn data(&mut self) -> &mut TarWriter {
        self.data.as_mut().unwrap()
    }

    fn write_metadata(
        &mut self,
        hash: String,
        unique: bool,
        fingerprint: Fingerprint,
        path: &Utf8Path,
    ) -> Result<()> {
        self.metadata.as_mut().unwrap().write(&MetadataRecord {
            hash,
            unique,
            fingerprint,
            path: path.to_owned(),
        })
    }
}
