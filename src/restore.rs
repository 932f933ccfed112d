use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, chown, lchown, symlink};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use log::{debug, error, info, warn};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::{Uid, mkfifo};

use crate::metadata;
use crate::owners::OwnerCache;
use crate::store::{BACKUP_NAME_RE, GROUP_NAME_RE, GroupStore, Observers, StoreLock};
use crate::tarstream::TarReader;

/// Where an extern file's body comes from: this backup's own archive or one
/// of its committed siblings in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceRef {
    Own,
    Sibling(usize),
}

/// Restores one committed backup into a destination directory, re-stitching
/// extern file bodies from other backups of the same group.
pub struct Restorer {
    store: GroupStore,
    _lock: StoreLock,

    group: String,
    name: String,

    reader: TarReader,
    extern_hashes: HashMap<Utf8PathBuf, String>,
    own_unique: Vec<(Utf8PathBuf, String)>,

    owners: OwnerCache,
    in_place: bool,
}

/// An entry created during the restore pass whose attributes still have to be
/// applied once nothing will be written below it anymore.
struct Restored {
    path: PathBuf,
    depth: usize,
    kind: RestoredKind,
    mode: u32,
    mtime: i64,
    uid: u32,
    gid: u32,
    uname: Option<String>,
    gname: Option<String>,
}

#[derive(PartialEq)]
enum RestoredKind {
    Directory,
    Symlink,
    Other,
}

impl Restorer {
    /// Opens a committed backup for restoring. The path must point at a
    /// committed backup directory (`<root>/<group>/<name>`); the advisory
    /// lock on the backup root is held until the restorer is dropped.
    pub fn new(backup_path: &Path, in_place: bool) -> Result<Restorer> {
        let (root, group, name) = parse_backup_path(backup_path)?;

        let store = GroupStore::open(&root, Observers::default())?;
        let lock = store.lock()?;

        let reader = TarReader::open(backup_path, in_place)?;

        let mut extern_hashes = HashMap::new();
        let mut own_unique = Vec::new();

        for record in metadata::read(backup_path)? {
            let record = record?;
            if record.unique {
                let tar_name = crate::tarstream::tar_name(&record.path)?.to_owned();
                own_unique.push((tar_name, record.hash));
            } else {
                extern_hashes.insert(record.path, record.hash);
            }
        }

        Ok(Restorer {
            store,
            _lock: lock,
            group,
            name,
            reader,
            extern_hashes,
            own_unique,
            owners: OwnerCache::default(),
            in_place,
        })
    }

    /// Restores the backup under `dest`. With a non-empty `paths`, only
    /// entries below one of the given absolute paths (and their ancestor
    /// directories) are restored. Returns true iff every planned entry was
    /// restored with its attributes.
    pub fn restore(mut self, dest: &Path, paths: &[PathBuf]) -> Result<bool> {
        info!("Restoring backup {}/{} to {:?}...", self.group, self.name, dest);

        fs::create_dir_all(dest).with_context(|| format!("failed to create {:?}", dest))?;
        let as_root = Uid::effective().is_root();

        let needed: HashSet<&str> = self
            .extern_hashes
            .iter()
            .filter(|(path, _)| selected(path.as_std_path(), paths))
            .map(|(_, hash)| hash.as_str())
            .collect();
        let (sources, extern_sources) = self.plan(&needed)?;

        let mut ok = true;
        let mut restored = Vec::new();
        let mut extern_jobs: HashMap<SourceRef, Vec<(Utf8PathBuf, PathBuf)>> = HashMap::new();

        let mut archive = self.reader.archive()?;
        for entry in archive.entries().context("failed to read the backup archive")? {
            let mut entry = entry.context("failed to read the backup archive")?;
            let rel = entry
                .path()
                .context("failed to read the backup archive")?
                .into_owned();
            let abs = Path::new("/").join(&rel);

            if !selected(&abs, paths) {
                continue;
            }

            if let Err(e) =
                self.restore_entry(&mut entry, &rel, dest, &extern_sources, &mut extern_jobs, &mut restored)
            {
                error!("Failed to restore {:?}: {:#}.", abs, e);
                ok = false;
            }
        }
        drop(archive);

        // One sequential scan per source archive serves all the extern
        // bodies it was chosen for
        for (source, jobs) in extern_jobs {
            let reader = match source {
                SourceRef::Own => &self.reader,
                SourceRef::Sibling(position) => &sources[position],
            };

            ok &= if let [(tar_name, dst)] = jobs.as_slice() {
                extract_one(reader, tar_name, dst)?
            } else {
                extract_from_source(reader, jobs)?
            };
        }

        // Files first, then directories deepest-first, so applying child
        // attributes can't clobber an already restored directory mtime
        let mut dirs = Vec::new();
        for entry in restored {
            if entry.kind == RestoredKind::Directory {
                dirs.push(entry);
            } else if let Err(e) = self.apply_attrs(&entry, as_root) {
                error!("Failed to restore attributes of {:?}: {:#}.", entry.path, e);
                ok = false;
            }
        }
        dirs.sort_by(|a, b| b.depth.cmp(&a.depth));
        for entry in dirs {
            if let Err(e) = self.apply_attrs(&entry, as_root) {
                error!("Failed to restore attributes of {:?}: {:#}.", entry.path, e);
                ok = false;
            }
        }

        if ok {
            info!("Backup {}/{} is restored.", self.group, self.name);
        } else {
            warn!("Backup {}/{} is restored with errors.", self.group, self.name);
        }

        Ok(ok)
    }

    /// Decides which backup supplies each needed extern hash. Candidates are
    /// ordered by the number of hashes they can supply (descending), oldest
    /// first on ties, so that the restore opens as few archives as possible.
    fn plan(
        &self,
        needed: &HashSet<&str>,
    ) -> Result<(Vec<TarReader>, HashMap<String, (SourceRef, Utf8PathBuf)>)> {
        let mut sources = Vec::new();
        let mut extern_sources = HashMap::new();

        if needed.is_empty() {
            return Ok((sources, extern_sources));
        }

        struct Candidate {
            name: String,
            own: bool,
            supplies: Vec<(Utf8PathBuf, String)>,
        }

        let mut candidates = Vec::new();

        let own_supplies: Vec<_> = self
            .own_unique
            .iter()
            .filter(|(_, hash)| needed.contains(hash.as_str()))
            .cloned()
            .collect();
        if !own_supplies.is_empty() {
            candidates.push(Candidate {
                name: self.name.clone(),
                own: true,
                supplies: own_supplies,
            });
        }

        for sibling in self.store.backups(&self.group, true)? {
            if sibling == self.name {
                continue;
            }

            let backup_path = self.store.backup_path(&self.group, &sibling);
            let supplies = match load_unique_names(&backup_path, needed) {
                Ok(supplies) => supplies,
                Err(e) => {
                    warn!("Failed to load {:?} backup metadata: {:#}.", backup_path, e);
                    continue;
                }
            };

            if !supplies.is_empty() {
                candidates.push(Candidate {
                    name: sibling,
                    own: false,
                    supplies,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.supplies
                .len()
                .cmp(&a.supplies.len())
                .then_with(|| a.name.cmp(&b.name))
        });

        for candidate in candidates {
            let fresh: Vec<_> = candidate
                .supplies
                .into_iter()
                .filter(|(_, hash)| !extern_sources.contains_key(hash))
                .collect();
            if fresh.is_empty() {
                continue;
            }

            let source = if candidate.own {
                SourceRef::Own
            } else {
                debug!("Using backup {} as an extern file source.", candidate.name);
                let backup_path = self.store.backup_path(&self.group, &candidate.name);
                match TarReader::open(&backup_path, self.in_place) {
                    Ok(reader) => {
                        sources.push(reader);
                        SourceRef::Sibling(sources.len() - 1)
                    }
                    Err(e) => {
                        warn!("Failed to open {:?}: {:#}.", backup_path, e);
                        continue;
                    }
                }
            };

            for (tar_name, hash) in fresh {
                extern_sources.insert(hash, (source, tar_name));
            }
        }

        Ok((sources, extern_sources))
    }

    fn restore_entry(
        &mut self,
        entry: &mut tar::Entry<'_, Box<dyn Read>>,
        rel: &Path,
        dest: &Path,
        extern_sources: &HashMap<String, (SourceRef, Utf8PathBuf)>,
        extern_jobs: &mut HashMap<SourceRef, Vec<(Utf8PathBuf, PathBuf)>>,
        restored: &mut Vec<Restored>,
    ) -> Result<()> {
        let dst = safe_join(dest, rel)?;

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().context("invalid entry mode")?;
        let mtime = header.mtime().context("invalid entry mtime")? as i64;
        let uid = header.uid().context("invalid entry owner")? as u32;
        let gid = header.gid().context("invalid entry owner")? as u32;
        let uname = header.username().ok().flatten().map(str::to_owned);
        let gname = header.groupname().ok().flatten().map(str::to_owned);
        let device_major = header.device_major().ok().flatten().unwrap_or(0);
        let device_minor = header.device_minor().ok().flatten().unwrap_or(0);
        let link_target = entry
            .link_name()
            .context("invalid entry link target")?
            .map(|target| target.into_owned());

        let mut attrs = Restored {
            path: dst.clone(),
            depth: rel.components().count(),
            kind: RestoredKind::Other,
            mode,
            mtime,
            uid,
            gid,
            uname,
            gname,
        };

        match entry_type {
            tar::EntryType::Directory => {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&dst)
                    .with_context(|| format!("failed to create {:?}", dst))?;
                attrs.kind = RestoredKind::Directory;
            }

            tar::EntryType::Symlink => {
                let target = link_target.context("symlink entry without a target")?;
                symlink(&target, &dst).with_context(|| format!("failed to create {:?}", dst))?;
                attrs.kind = RestoredKind::Symlink;
            }

            tar::EntryType::Link => {
                let target = link_target.context("hard link entry without a target")?;
                let target_dst = safe_join(dest, &target)?;
                fs::hard_link(&target_dst, &dst)
                    .with_context(|| format!("failed to link {:?} to {:?}", dst, target_dst))?;
                // A hard link shares its target's attributes
                return Ok(());
            }

            tar::EntryType::Regular => {
                if let Some(parent) = dst.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("failed to create {:?}", parent))?;
                    }
                }

                let stored = Utf8Path::from_path(rel)
                    .map(|rel| Utf8PathBuf::from(format!("/{}", rel)));
                let extern_hash = stored.and_then(|path| self.extern_hashes.get(&path));

                if let Some(hash) = extern_hash {
                    let (source, tar_name) = extern_sources
                        .get(hash)
                        .context("no backup in the group provides its contents")?;

                    // Create the file right away so that later hard-link
                    // entries can attach to it; the deferred extraction
                    // fills in the body without replacing the inode
                    File::create(&dst).with_context(|| format!("failed to create {:?}", dst))?;
                    extern_jobs
                        .entry(*source)
                        .or_default()
                        .push((tar_name.clone(), dst));
                } else {
                    let mut out = File::create(&dst)
                        .with_context(|| format!("failed to create {:?}", dst))?;
                    io::copy(entry, &mut out)
                        .with_context(|| format!("failed to extract {:?}", dst))?;
                }
            }

            tar::EntryType::Fifo => {
                mkfifo(dst.as_path(), Mode::from_bits_truncate(mode))
                    .with_context(|| format!("failed to create {:?}", dst))?;
            }

            tar::EntryType::Char | tar::EntryType::Block => {
                if !Uid::effective().is_root() {
                    warn!("Skipping {:?}: restoring device nodes requires root.", dst);
                    return Ok(());
                }

                let kind = if entry_type == tar::EntryType::Char {
                    SFlag::S_IFCHR
                } else {
                    SFlag::S_IFBLK
                };
                mknod(
                    dst.as_path(),
                    kind,
                    Mode::from_bits_truncate(mode),
                    makedev(device_major.into(), device_minor.into()),
                )
                .with_context(|| format!("failed to create {:?}", dst))?;
            }

            _ => {
                warn!("Skipping {:?}: unsupported archive entry type.", rel);
                return Ok(());
            }
        }

        restored.push(attrs);
        Ok(())
    }

    fn apply_attrs(&mut self, entry: &Restored, as_root: bool) -> Result<()> {
        // The entry may be missing when its creation failed; that error has
        // already been reported
        match fs::symlink_metadata(&entry.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("failed to stat {:?}", entry.path)),
            Ok(_) => {}
        }

        let is_symlink = entry.kind == RestoredKind::Symlink;

        // Ownership is only restorable as root. chown first: it clears
        // setuid/setgid bits, which set_permissions restores
        if as_root {
            let uid = entry
                .uname
                .as_deref()
                .and_then(|name| self.owners.uid(name))
                .unwrap_or(entry.uid);
            let gid = entry
                .gname
                .as_deref()
                .and_then(|name| self.owners.gid(name))
                .unwrap_or(entry.gid);

            if is_symlink {
                lchown(&entry.path, Some(uid), Some(gid))?;
            } else {
                chown(&entry.path, Some(uid), Some(gid))?;
            }
        }

        if !is_symlink {
            fs::set_permissions(&entry.path, fs::Permissions::from_mode(entry.mode))?;
        }

        let mtime = FileTime::from_unix_time(entry.mtime, 0);
        if is_symlink {
            filetime::set_symlink_file_times(&entry.path, mtime, mtime)?;
        } else {
            filetime::set_file_mtime(&entry.path, mtime)?;
        }

        Ok(())
    }
}

/// Splits a committed backup path into its backup root, group name and backup
/// name, validating the directory layout.
fn parse_backup_path(backup_path: &Path) -> Result<(PathBuf, String, String)> {
    let parse = || -> Option<(PathBuf, String, String)> {
        let name = backup_path.file_name()?.to_str()?;
        let group_path = backup_path.parent()?;
        let group = group_path.file_name()?.to_str()?;
        let root = group_path.parent()?;

        if !BACKUP_NAME_RE.is_match(name) || !GROUP_NAME_RE.is_match(group) {
            return None;
        }

        Some((root.to_owned(), group.to_owned(), name.to_owned()))
    };

    parse().with_context(|| {
        format!("{:?} doesn't look like a committed backup path", backup_path)
    })
}

/// True when the entry at `abs` is wanted: no filters, the entry is below
/// some filter path, or it is an ancestor directory of one.
fn selected(abs: &Path, filters: &[PathBuf]) -> bool {
    filters.is_empty()
        || filters
            .iter()
            .any(|filter| abs.starts_with(filter) || filter.starts_with(abs))
}

/// Joins an archive-relative name onto the destination, refusing anything
/// that would escape it.
fn safe_join(dest: &Path, rel: &Path) -> Result<PathBuf> {
    let mut path = dest.to_owned();

    for component in rel.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => bail!("unsafe path in the archive: {:?}", rel),
        }
    }

    Ok(path)
}

/// Reads the metadata of a candidate source backup, returning the stored tar
/// names of its unique files whose hashes we need.
fn load_unique_names(
    backup_path: &Path,
    needed: &HashSet<&str>,
) -> Result<Vec<(Utf8PathBuf, String)>> {
    let mut supplies = Vec::new();

    for record in metadata::read(backup_path)? {
        let record = record?;
        if record.unique && needed.contains(record.hash.as_str()) {
            let tar_name = crate::tarstream::tar_name(&record.path)?.to_owned();
            supplies.push((tar_name, record.hash));
        }
    }

    Ok(supplies)
}

/// Extracts a single body by its archive name.
fn extract_one(reader: &TarReader, tar_name: &Utf8Path, dst: &Path) -> Result<bool> {
    let result = File::create(dst)
        .map_err(anyhow::Error::from)
        .and_then(|mut out| reader.extract_body(tar_name, &mut out));

    match result {
        Ok(true) => Ok(true),
        Ok(false) => {
            error!(
                "Failed to restore {:?}: its contents vanished from the source archive.",
                dst
            );
            Ok(false)
        }
        Err(e) => {
            error!("Failed to restore {:?}: {:#}.", dst, e);
            Ok(false)
        }
    }
}

/// Extracts all requested bodies from one source archive in a single
/// sequential scan. Returns false if some of them were not found.
fn extract_from_source(reader: &TarReader, jobs: Vec<(Utf8PathBuf, PathBuf)>) -> Result<bool> {
    let mut wanted: HashMap<Utf8PathBuf, Vec<PathBuf>> = HashMap::new();
    for (tar_name, dst) in jobs {
        wanted.entry(tar_name).or_default().push(dst);
    }

    let mut ok = true;

    let mut archive = reader.archive()?;
    for entry in archive.entries().context("failed to read a source archive")? {
        if wanted.is_empty() {
            break;
        }

        let mut entry = entry.context("failed to read a source archive")?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let Some(name) = entry
            .path()
            .ok()
            .and_then(|path| Utf8PathBuf::from_path_buf(path.into_owned()).ok())
        else {
            continue;
        };

        let Some(destinations) = wanted.remove(&name) else {
            continue;
        };

        let (first, rest) = destinations.split_first().unwrap();
        let result = File::create(first)
            .and_then(|mut out| io::copy(&mut entry, &mut out))
            .with_context(|| format!("failed to extract {:?}", first));
        match result {
            Ok(_) => {
                for dst in rest {
                    if let Err(e) = fs::copy(first, dst) {
                        error!("Failed to restore {:?}: {}.", dst, e);
                        ok = false;
                    }
                }
            }
            Err(e) => {
                error!("Failed to restore {:?}: {:#}.", first, e);
                for dst in rest {
                    error!("Failed to restore {:?}: {:#}.", dst, e);
                }
                ok = false;
            }
        }
    }

    for destinations in wanted.values() {
        for dst in destinations {
            error!(
                "Failed to restore {:?}: its contents vanished from the source archive.",
                dst
            );
            ok = false;
        }
    }

    Ok(ok)
}
