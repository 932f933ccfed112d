use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use chrono::Local;
use log::{error, info};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use regex::Regex;

/// Name of the advisory lock sentinel inside the backup root.
pub const LOCK_NAME: &str = ".lock";

const GROUP_NAME_FORMAT: &str = "%Y.%m.%d";
const BACKUP_NAME_FORMAT: &str = "%Y.%m.%d-%H:%M:%S";

pub static GROUP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}\.\d{2}\.\d{2}$").unwrap());
pub static BACKUP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}\.\d{2}\.\d{2}-\d{2}:\d{2}:\d{2}$").unwrap());

pub type GroupHook = Box<dyn Fn(&str) -> Result<()>>;
pub type BackupHook = Box<dyn Fn(&str, &str) -> Result<()>>;

/// Callbacks fired after group/backup state transitions become visible on
/// disk. A failing observer is logged and flips the run's success flag, but
/// never rolls back the transition it observed.
#[derive(Default)]
pub struct Observers {
    pub on_group_created: Option<GroupHook>,
    pub on_group_deleted: Option<GroupHook>,
    pub on_backup_created: Option<BackupHook>,
}

/// The on-disk layout manager: groups under the backup root, backups under
/// groups, dot-prefixed in-progress backup directories, atomic commit and
/// group rotation.
pub struct GroupStore {
    root: PathBuf,
    observers: Observers,
    observers_ok: Cell<bool>,
}

/// A backup slot handed out by `create_backup`: the in-progress directory
/// exists and is ready to be filled.
pub struct BackupSlot {
    pub group: String,
    pub name: String,
    pub path: PathBuf,
}

/// Holds the exclusive advisory lock on the backup root for the lifetime of a
/// backup or restore run.
#[derive(Debug)]
pub struct StoreLock {
    _lock: Flock<File>,
}

impl GroupStore {
    pub fn open(root: &Path, observers: Observers) -> Result<GroupStore> {
        if !root.is_absolute() {
            bail!("backup root must be an absolute path: {:?}", root);
        }
        if !root.is_dir() {
            bail!("backup root {:?} doesn't exist or is not a directory", root);
        }

        Ok(GroupStore {
            root: root.to_owned(),
            observers,
            observers_ok: Cell::new(true),
        })
    }

    /// True unless some observer hook has failed during this run.
    pub fn observers_ok(&self) -> bool {
        self.observers_ok.get()
    }

    /// Acquires the exclusive non-blocking lock on the root's sentinel file.
    ///
    /// After locking, the sentinel is re-stated to confirm the locked inode
    /// is still the one the path names, guarding against an unlink race with
    /// a process that held the lock before us.
    pub fn lock(&self) -> Result<StoreLock> {
        let path = self.root.join(LOCK_NAME);

        for _ in 0..3 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .with_context(|| format!("failed to open {:?}", path))?;

            let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => lock,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    bail!("another backup or restore is already running on {:?}", self.root)
                }
                Err((_, errno)) => {
                    return Err(anyhow::Error::from(io::Error::from(errno))
                        .context(format!("failed to lock {:?}", path)));
                }
            };

            let held = lock.metadata().with_context(|| format!("failed to stat {:?}", path))?;
            match fs::metadata(&path) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    return Ok(StoreLock { _lock: lock });
                }
                // The file we locked is no longer the one the path names
                Ok(_) | Err(_) => continue,
            }
        }

        bail!("failed to acquire the lock on {:?}", self.root)
    }

    /// Committed backup groups, ascending by name (equals ascending by date).
    pub fn groups(&self) -> Result<Vec<String>> {
        let mut groups = self
            .list_names(&self.root)?
            .into_iter()
            .filter(|name| GROUP_NAME_RE.is_match(name))
            .collect::<Vec<_>>();
        groups.sort();
        Ok(groups)
    }

    /// Backups of a group, ascending by name (equals ascending by creation
    /// time). With `only_committed` the names are validated against the
    /// backup name schema; otherwise anything not dot-prefixed is listed.
    pub fn backups(&self, group: &str, only_committed: bool) -> Result<Vec<String>> {
        let mut backups = self
            .list_names(&self.group_path(group))?
            .into_iter()
            .filter(|name| {
                if only_committed {
                    BACKUP_NAME_RE.is_match(name)
                } else {
                    !name.starts_with('.')
                }
            })
            .collect::<Vec<_>>();
        backups.sort();
        Ok(backups)
    }

    pub fn group_path(&self, group: &str) -> PathBuf {
        self.root.join(group)
    }

    pub fn backup_path(&self, group: &str, name: &str) -> PathBuf {
        self.root.join(group).join(name)
    }

    fn temp_backup_path(&self, group: &str, name: &str) -> PathBuf {
        self.root.join(group).join(format!(".{}", name))
    }

    /// Picks or creates the group the next backup belongs to and creates the
    /// dot-prefixed in-progress directory for it.
    pub fn create_backup(&self, max_backups: usize) -> Result<BackupSlot> {
        let group = match self.groups()?.last() {
            Some(last) if self.backups(last, true)?.len() < max_backups => last.clone(),
            _ => self.create_group()?,
        };

        let name = Local::now().format(BACKUP_NAME_FORMAT).to_string();

        let path = self.temp_backup_path(&group, &name);
        if path.exists() || self.backup_path(&group, &name).exists() {
            bail!("backup {}/{} already exists", group, name);
        }

        fs::create_dir(&path).with_context(|| format!("failed to create {:?}", path))?;

        Ok(BackupSlot { group, name, path })
    }

    fn create_group(&self) -> Result<String> {
        let name = Local::now().format(GROUP_NAME_FORMAT).to_string();
        let path = self.group_path(&name);

        if !path.exists() {
            info!("Creating backup group {}...", name);
            fs::create_dir(&path).with_context(|| format!("failed to create {:?}", path))?;
            fsync_dir(&self.root)?;
            self.notify_group(&self.observers.on_group_created, &name);
        }

        Ok(name)
    }

    /// Makes an in-progress backup visible with a single rename.
    pub fn commit_backup(&self, group: &str, name: &str) -> Result<()> {
        let temp_path = self.temp_backup_path(group, name);
        let path = self.backup_path(group, name);

        fs::rename(&temp_path, &path)
            .with_context(|| format!("failed to commit the backup: rename {:?} failed", temp_path))?;
        fsync_dir(&self.group_path(group))?;

        if let Some(hook) = &self.observers.on_backup_created {
            if let Err(e) = hook(group, name) {
                error!("Backup creation observer failed: {:#}.", e);
                self.observers_ok.set(false);
            }
        }

        Ok(())
    }

    /// Removes an in-progress backup directory. Errors are logged, not
    /// surfaced: cancellation runs on cleanup paths.
    pub fn cancel_backup(&self, group: &str, name: &str) {
        let path = self.temp_backup_path(group, name);
        if let Err(e) = fs::remove_dir_all(&path) {
            error!("Failed to delete {:?}: {}.", path, e);
        }
    }

    /// Deletes every group beyond the newest `max_groups` that contain at
    /// least one committed backup. Returns false if some deletion failed.
    pub fn rotate_groups(&self, max_groups: usize) -> Result<bool> {
        let mut ok = true;

        let mut groups = Vec::new();
        for group in self.groups()? {
            if !self.backups(&group, true)?.is_empty() {
                groups.push(group);
            }
        }
        groups.reverse();

        for group in &groups[groups.len().min(max_groups)..] {
            info!("Removing old backup group {}...", group);

            let path = self.group_path(group);
            if let Err(e) = fs::remove_dir_all(&path) {
                error!("Failed to delete {:?}: {}.", path, e);
                ok = false;
                continue;
            }

            self.notify_group(&self.observers.on_group_deleted, group);
        }

        Ok(ok)
    }

    fn notify_group(&self, hook: &Option<GroupHook>, group: &str) {
        if let Some(hook) = hook {
            if let Err(e) = hook(group) {
                error!("Backup group observer failed: {:#}.", e);
                self.observers_ok.set(false);
            }
        }
    }

    fn list_names(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for dir_entry in fs::read_dir(path).with_context(|| format!("failed to read {:?}", path))? {
            let dir_entry = dir_entry.with_context(|| format!("failed to read {:?}", path))?;
            if let Ok(name) = dir_entry.file_name().into_string() {
                names.push(name);
            }
        }

        Ok(names)
    }
}

/// Flushes directory metadata (entry creation, rename) to disk.
pub fn fsync_dir(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("failed to fsync {:?}", path))
}
