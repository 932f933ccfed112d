use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::backup::{AddOutcome, BackupWriter};
use crate::config::{Config, FilterRule};
use crate::entry::{EntryKind, EntryMeta};
use crate::store::GroupStore;

/// Runs one full backup: locks the store, opens a backup writer, walks every
/// configured item and commits. Returns true iff everything succeeded.
pub fn backup(config: &Config, store: &GroupStore, cancelled: &AtomicBool) -> Result<bool> {
    let _lock = store.lock()?;

    let (writer, index_ok) = BackupWriter::create(store, config)?;
    let mut backuper = Backuper {
        writer,
        cancelled,
        open_flags: libc::O_NOFOLLOW | libc::O_NOATIME,
        ok: index_ok,
    };

    for (path, item) in &config.backup_items {
        if let Some(script) = &item.before {
            backuper.run_script(script);
        }

        backuper.backup_item(Path::new(path), &item.filter)?;

        if let Some(script) = &item.after {
            backuper.run_script(script);
        }
    }

    let Backuper { writer, ok, .. } = backuper;
    let rotation_ok = writer.commit()?;

    Ok(ok && rotation_ok && store.observers_ok())
}

/// Walks the configured backup items and feeds resolved `(path, stat, link
/// target, body)` tuples to the backup writer, folding per-entry outcomes
/// into a run-wide success flag.
struct Backuper<'a> {
    writer: BackupWriter<'a>,
    cancelled: &'a AtomicBool,
    open_flags: libc::c_int,
    ok: bool,
}

impl Backuper<'_> {
    fn backup_item(&mut self, root: &Path, filters: &[FilterRule]) -> Result<()> {
        info!("Backing up {:?}...", root);

        let mut iterator = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                bail!("the backup is cancelled");
            }

            let dir_entry = match iterator.next() {
                None => break,
                Some(Ok(dir_entry)) => dir_entry,
                Some(Err(e)) => {
                    let path = e.path().unwrap_or(root).to_owned();
                    let vanished = e.io_error().and_then(|e| e.raw_os_error()).is_some_and(
                        |errno| matches!(errno, libc::ENOENT | libc::ENOTDIR),
                    );
                    self.source_error(&path, &e.to_string(), vanished && e.depth() > 0);
                    continue;
                }
            };

            let path = dir_entry.path();
            let toplevel = dir_entry.depth() == 0;

            if !toplevel {
                if let Ok(rel) = path.strip_prefix(root) {
                    if filter_match(filters, rel) == Some(false) {
                        info!("Filtering out {:?}...", path);
                        if dir_entry.file_type().is_dir() {
                            iterator.skip_current_dir();
                        }
                        continue;
                    }
                }
            }

            self.backup_dentry(path, toplevel)?;
        }

        Ok(())
    }

    fn backup_dentry(&mut self, path: &Path, toplevel: bool) -> Result<()> {
        debug!("Backing up {:?}...", path);

        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.io_error(path, &e, toplevel);
                return Ok(());
            }
        };

        let Some(kind) = EntryKind::from_metadata(&metadata) else {
            warn!("Skipping {:?}: it has an unsupported file type.", path);
            return Ok(());
        };

        let outcome = match kind {
            EntryKind::Regular => {
                let Some(mut file) = self.open_source_file(path, toplevel) else {
                    return Ok(());
                };

                // The entry may have been replaced between lstat and open
                let metadata = match file.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.io_error(path, &e, toplevel);
                        return Ok(());
                    }
                };
                if !metadata.is_file() {
                    self.type_changed(path);
                    return Ok(());
                }

                let meta = EntryMeta::new(EntryKind::Regular, &metadata);
                self.writer.add_file(path, &meta, None, Some(&mut file))?
            }

            EntryKind::Symlink => {
                let target = match fs::read_link(path) {
                    Ok(target) => target,
                    Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                        self.type_changed(path);
                        return Ok(());
                    }
                    Err(e) => {
                        self.io_error(path, &e, toplevel);
                        return Ok(());
                    }
                };

                let meta = EntryMeta::new(kind, &metadata);
                self.writer.add_file(path, &meta, Some(&target), None)?
            }

            _ => {
                let meta = EntryMeta::new(kind, &metadata);
                self.writer.add_file(path, &meta, None, None)?
            }
        };

        if let AddOutcome::Failed(e) = outcome {
            error!("Failed to backup {:?}: {:#}.", path, e);
            self.ok = false;
        }

        Ok(())
    }

    /// Opens a regular file for reading without following symlinks and,
    /// while the kernel lets us, without updating its access time. The first
    /// EPERM permanently disables O_NOATIME for the rest of the run.
    fn open_source_file(&mut self, path: &Path, toplevel: bool) -> Option<File> {
        loop {
            let result = OpenOptions::new()
                .read(true)
                .custom_flags(self.open_flags)
                .open(path);

            return match result {
                Ok(file) => Some(file),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EPERM) if self.open_flags & libc::O_NOATIME != 0 => {
                        debug!("Got EPERM: disabling O_NOATIME for file opening operations.");
                        self.open_flags &= !libc::O_NOATIME;
                        continue;
                    }
                    // O_NOFOLLOW turns a symlink that appeared here into ELOOP
                    Some(libc::ELOOP) => {
                        self.type_changed(path);
                        None
                    }
                    _ => {
                        self.io_error(path, &e, toplevel);
                        None
                    }
                },
            };
        }
    }

    fn run_script(&mut self, script: &str) {
        info!("Running: {}", script);

        match Command::new("sh").arg("-c").arg(script).output() {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                error!(
                    "The command has failed with {}:\n{}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                );
                self.ok = false;
            }
            Err(e) => {
                error!("Failed to run {:?}: {}.", script, e);
                self.ok = false;
            }
        }
    }

    fn type_changed(&mut self, path: &Path) {
        error!(
            "Failed to backup {:?}: it has suddenly changed its type during the backup.",
            path
        );
        self.ok = false;
    }

    fn io_error(&mut self, path: &Path, e: &std::io::Error, toplevel: bool) {
        let vanished = e
            .raw_os_error()
            .is_some_and(|errno| matches!(errno, libc::ENOENT | libc::ENOTDIR));
        self.source_error(path, &e.to_string(), vanished && !toplevel);
    }

    fn source_error(&mut self, path: &Path, error: &str, vanished: bool) {
        if vanished {
            warn!("Failed to backup {:?}: it has suddenly vanished.", path);
        } else {
            error!("Failed to backup {:?}: {}.", path, error);
            self.ok = false;
        }
    }
}

/// Applies the item's filter rules to a path relative to the item root.
/// The first matching rule wins; no match means the default allow policy.
fn filter_match(filters: &[FilterRule], rel: &Path) -> Option<bool> {
    let rel = rel.to_string_lossy();
    filters
        .iter()
        .find(|rule| rule.regex.is_match(&rel))
        .map(|rule| rule.allow)
}
