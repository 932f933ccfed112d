use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, symlink};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use filetime::FileTime;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::config::{Config, tests::test_config};
use crate::hashing::hash_bytes;
use crate::metadata::{self, MetadataRecord};
use crate::restore::Restorer;
use crate::store::{GroupStore, Observers};
use crate::tarstream::{Compression, TarReader};
use crate::walker;

struct TestEnv {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    source: PathBuf,
    restores: Cell<u32>,
}

impl TestEnv {
    fn new() -> TestEnv {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("backups");
        let source = tmp.path().join("source");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&source).unwrap();

        TestEnv {
            _tmp: tmp,
            root,
            source,
            restores: Cell::new(0),
        }
    }

    fn config(&self) -> Config {
        let mut config = test_config(&self.root);
        config
            .backup_items
            .insert(self.source.to_str().unwrap().to_owned(), Default::default());
        config
    }

    fn src(&self, name: &str) -> PathBuf {
        self.source.join(name)
    }

    /// Runs a full backup and returns the newest committed backup's (group,
    /// name) along with the run's success flag.
    fn backup_with(&self, config: &Config) -> (String, String, bool) {
        let store = GroupStore::open(&self.root, Observers::default()).unwrap();
        let ok = walker::backup(config, &store, &AtomicBool::new(false)).unwrap();

        let group = store.groups().unwrap().pop().unwrap();
        let name = store.backups(&group, true).unwrap().pop().unwrap();
        (group, name, ok)
    }

    fn backup(&self) -> (String, String) {
        let (group, name, ok) = self.backup_with(&self.config());
        assert!(ok);
        (group, name)
    }

    fn backup_path(&self, group: &str, name: &str) -> PathBuf {
        self.root.join(group).join(name)
    }

    fn restore(&self, group: &str, name: &str) -> PathBuf {
        self.restore_paths(group, name, &[])
    }

    fn restore_paths(&self, group: &str, name: &str, paths: &[PathBuf]) -> PathBuf {
        self.restores.set(self.restores.get() + 1);
        let dest = self
            ._tmp
            .path()
            .join(format!("restore-{}", self.restores.get()));

        let restorer = Restorer::new(&self.backup_path(group, name), false).unwrap();
        assert!(restorer.restore(&dest, paths).unwrap());
        dest
    }

    /// Location of the restored source tree inside a restore destination.
    fn restored(&self, dest: &Path) -> PathBuf {
        dest.join(self.source.strip_prefix("/").unwrap())
    }

    fn read_metadata(&self, group: &str, name: &str) -> HashMap<Utf8PathBuf, MetadataRecord> {
        let mut records = HashMap::new();
        for record in metadata::read(&self.backup_path(group, name)).unwrap() {
            let record = record.unwrap();
            assert!(records.insert(record.path.clone(), record).is_none());
        }
        records
    }

    fn record(&self, group: &str, name: &str, file: &str) -> MetadataRecord {
        let path = Utf8PathBuf::from_path_buf(self.src(file)).unwrap();
        self.read_metadata(group, name).remove(&path).unwrap()
    }
}

/// Backup names have second granularity, so two backups of one group must not
/// share a wall clock second.
fn wait_next_second() {
    thread::sleep(Duration::from_millis(1100));
}

#[test]
fn test_simple_round_trip() {
    let env = TestEnv::new();

    fs::write(env.src("a"), "1234").unwrap();
    symlink("a", env.src("l")).unwrap();
    mkfifo(env.src("queue").as_path(), Mode::from_bits_truncate(0o644)).unwrap();

    let (group, name) = env.backup();
    let restored = env.restored(&env.restore(&group, &name));

    assert_eq!(fs::read(restored.join("a")).unwrap(), b"1234");
    assert_eq!(fs::read_link(restored.join("l")).unwrap(), Path::new("a"));

    let queue = fs::symlink_metadata(restored.join("queue")).unwrap();
    assert_eq!(queue.mode() & libc::S_IFMT, libc::S_IFIFO);

    for file in ["a", "queue"] {
        let source = fs::symlink_metadata(env.src(file)).unwrap();
        let target = fs::symlink_metadata(restored.join(file)).unwrap();
        assert_eq!(source.mtime(), target.mtime(), "{} mtime differs", file);
        assert_eq!(
            source.mode() & 0o7777,
            target.mode() & 0o7777,
            "{} mode differs",
            file
        );
    }

    // Directory attributes are restored after its children were created
    let source = fs::metadata(&env.source).unwrap();
    let target = fs::metadata(&restored).unwrap();
    assert_eq!(source.mtime(), target.mtime());
    assert_eq!(source.mode() & 0o7777, target.mode() & 0o7777);
}

#[test]
fn test_dedup_within_one_backup() {
    let env = TestEnv::new();

    fs::write(env.src("a"), "1234").unwrap();
    fs::write(env.src("b"), "1234").unwrap();

    let (group, name) = env.backup();

    let a = env.record(&group, &name, "a");
    let b = env.record(&group, &name, "b");
    assert!(a.unique);
    assert!(!b.unique);
    assert_eq!(a.hash, b.hash);
    assert_eq!(a.hash, hash_bytes(b"1234"));

    // The extern entry takes no space in the archive
    assert_eq!(tar_entry_size(&env.backup_path(&group, &name), "b"), 0);
    assert_eq!(tar_entry_size(&env.backup_path(&group, &name), "a"), 4);

    // The extern body is re-stitched from this backup's own archive
    let restored = env.restored(&env.restore(&group, &name));
    assert_eq!(fs::read(restored.join("a")).unwrap(), b"1234");
    assert_eq!(fs::read(restored.join("b")).unwrap(), b"1234");
}

#[test]
fn test_dedup_across_backups() {
    let env = TestEnv::new();

    fs::write(env.src("a"), "1111").unwrap();
    fs::write(env.src("x"), "2222").unwrap();

    let (group_1, name_1) = env.backup();
    wait_next_second();

    fs::write(env.src("x"), "3333").unwrap();
    let (group_2, name_2) = env.backup();
    assert_eq!(group_1, group_2);

    // The unchanged file became extern, pointing at the first backup's body
    let a_1 = env.record(&group_1, &name_1, "a");
    let a_2 = env.record(&group_2, &name_2, "a");
    assert!(a_1.unique);
    assert!(!a_2.unique);
    assert_eq!(a_1.hash, a_2.hash);

    let x_2 = env.record(&group_2, &name_2, "x");
    assert!(x_2.unique);
    assert_eq!(x_2.hash, hash_bytes(b"3333"));

    // Restoring the second backup pulls the extern body from the first
    let restored = env.restored(&env.restore(&group_2, &name_2));
    assert_eq!(fs::read(restored.join("a")).unwrap(), b"1111");
    assert_eq!(fs::read(restored.join("x")).unwrap(), b"3333");
}

#[test]
fn test_modify_time_trust() {
    let env = TestEnv::new();
    let path = env.src("f");

    fs::write(&path, "aaaa").unwrap();
    let (group, name_1) = env.backup();
    assert_eq!(env.record(&group, &name_1, "f").hash, hash_bytes(b"aaaa"));
    wait_next_second();

    // Rewrite the contents, then forge the old modification time back. The
    // fingerprint matches the previous backup, so the engine must trust it
    // and record the stale hash without reading the file.
    let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
    fs::write(&path, "bbbb").unwrap();
    filetime::set_file_mtime(&path, mtime).unwrap();

    let (_, name_2, ok) = env.backup_with(&env.config());
    assert!(ok);
    let record = env.record(&group, &name_2, "f");
    assert!(!record.unique);
    assert_eq!(record.hash, hash_bytes(b"aaaa"));
    wait_next_second();

    // Without the shortcut the change is detected and hashed fresh
    let mut config = env.config();
    config.trust_modify_time = false;
    let (_, name_3, ok) = env.backup_with(&config);
    assert!(ok);
    let record = env.record(&group, &name_3, "f");
    assert!(record.unique);
    assert_eq!(record.hash, hash_bytes(b"bbbb"));
}

#[test]
fn test_group_rotation() {
    let env = TestEnv::new();
    fs::write(env.src("a"), "1234").unwrap();

    // Two old groups with one committed backup each
    for (group, name) in [
        ("2020.01.01", "2020.01.01-10:00:00"),
        ("2020.01.02", "2020.01.02-10:00:00"),
    ] {
        fs::create_dir_all(env.backup_path(group, name)).unwrap();
    }

    let mut config = env.config();
    config.max_backups = 1;
    config.max_backup_groups = 2;

    // The newest group is full, so the backup lands in a new group; rotation
    // then keeps only the two newest groups
    let (group, _, ok) = env.backup_with(&config);
    assert!(ok);
    assert_ne!(group, "2020.01.02");

    let store = GroupStore::open(&env.root, Observers::default()).unwrap();
    assert_eq!(store.groups().unwrap(), ["2020.01.02".to_owned(), group]);
}

#[test]
fn test_hard_links() {
    let env = TestEnv::new();

    fs::write(env.src("h1"), "aa").unwrap();
    fs::hard_link(env.src("h1"), env.src("h2")).unwrap();

    let (group, name) = env.backup();

    // One body, one hard-link record
    let types = tar_entry_types(&env.backup_path(&group, &name));
    assert_eq!(types[Path::new("h1")], tar::EntryType::Regular);
    assert_eq!(types[Path::new("h2")], tar::EntryType::Link);

    let restored = env.restored(&env.restore(&group, &name));
    let h1 = fs::metadata(restored.join("h1")).unwrap();
    let h2 = fs::metadata(restored.join("h2")).unwrap();
    assert_eq!(h1.ino(), h2.ino());
    assert_eq!(fs::read(restored.join("h2")).unwrap(), b"aa");
}

#[test]
fn test_hard_links_disabled() {
    let env = TestEnv::new();

    fs::write(env.src("h1"), "aa").unwrap();
    fs::hard_link(env.src("h1"), env.src("h2")).unwrap();

    let mut config = env.config();
    config.preserve_hard_links = false;
    let (group, name, ok) = env.backup_with(&config);
    assert!(ok);

    // Both are regular entries; the second deduplicates to extern
    let types = tar_entry_types(&env.backup_path(&group, &name));
    assert_eq!(types[Path::new("h1")], tar::EntryType::Regular);
    assert_eq!(types[Path::new("h2")], tar::EntryType::Regular);

    let records = env.read_metadata(&group, &name);
    assert_eq!(records.len(), 2);

    let restored = env.restored(&env.restore(&group, &name));
    let h1 = fs::metadata(restored.join("h1")).unwrap();
    let h2 = fs::metadata(restored.join("h2")).unwrap();
    assert_ne!(h1.ino(), h2.ino());
    assert_eq!(fs::read(restored.join("h2")).unwrap(), b"aa");
}

#[test]
fn test_compressions() {
    for compression in [Compression::None, Compression::Bzip2, Compression::Gzip] {
        let env = TestEnv::new();
        fs::write(env.src("a"), "1234").unwrap();

        let mut config = env.config();
        config.compression = compression;
        let (group, name, ok) = env.backup_with(&config);
        assert!(ok);

        assert!(
            env.backup_path(&group, &name)
                .join(compression.archive_name())
                .exists()
        );

        let restored = env.restored(&env.restore(&group, &name));
        assert_eq!(fs::read(restored.join("a")).unwrap(), b"1234");
    }
}

#[test]
fn test_item_filters() {
    let env = TestEnv::new();

    fs::write(env.src("keep.txt"), "keep").unwrap();
    fs::write(env.src("skip.log"), "skip").unwrap();
    fs::create_dir(env.src("cache")).unwrap();
    fs::write(env.src("cache/blob"), "blob").unwrap();
    fs::create_dir(env.src("data")).unwrap();
    fs::write(env.src("data/kept"), "kept").unwrap();
    fs::write(env.src("data/dropped"), "dropped").unwrap();

    let mut config = env.config();
    let item = &mut config.backup_items[0];
    item.filter = [r"-.*\.log", "+data/kept", "-data/.*", "-cache"]
        .iter()
        .map(|rule| rule.parse().unwrap())
        .collect();

    let (group, name, ok) = env.backup_with(&config);
    assert!(ok);

    let records = env.read_metadata(&group, &name);
    let has = |file: &str| {
        records.contains_key(&Utf8PathBuf::from_path_buf(env.src(file)).unwrap())
    };

    assert!(has("keep.txt"));
    assert!(has("data/kept"));
    assert!(!has("skip.log"));
    assert!(!has("cache/blob"));
    assert!(!has("data/dropped"));

    // Filtered-out files are untouched on the source
    assert!(env.src("skip.log").exists());
    assert!(env.src("cache/blob").exists());
}

#[test]
fn test_item_hooks() {
    let env = TestEnv::new();
    fs::write(env.src("a"), "1234").unwrap();

    let before = env.src("created-by-hook");
    let mut config = env.config();
    let item = &mut config.backup_items[0];
    item.before = Some(format!("touch {}", before.display()));
    item.after = Some(format!("rm {}", before.display()));

    let (group, name, ok) = env.backup_with(&config);
    assert!(ok);

    // The before hook ran before the walk, the after hook after it
    let records = env.read_metadata(&group, &name);
    assert!(records.contains_key(&Utf8PathBuf::from_path_buf(before.clone()).unwrap()));
    assert!(!before.exists());
}

#[test]
fn test_failing_hook_marks_run_failed() {
    let env = TestEnv::new();
    fs::write(env.src("a"), "1234").unwrap();

    let mut config = env.config();
    config.backup_items[0].before = Some("exit 3".to_owned());

    let (group, name, ok) = env.backup_with(&config);
    assert!(!ok);

    // The backup itself is still committed
    assert!(env.backup_path(&group, &name).is_dir());
}

#[test]
fn test_observer_ordering() {
    let env = TestEnv::new();
    fs::write(env.src("a"), "1234").unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));

    let (created, backup_created) = (Rc::clone(&events), Rc::clone(&events));
    let observers = Observers {
        on_group_created: Some(Box::new(move |group| {
            created.borrow_mut().push(format!("group-created {}", group));
            Ok(())
        })),
        on_backup_created: Some(Box::new(move |group, name| {
            backup_created
                .borrow_mut()
                .push(format!("backup-created {}/{}", group, name));
            Ok(())
        })),
        ..Default::default()
    };

    let store = GroupStore::open(&env.root, observers).unwrap();
    assert!(walker::backup(&env.config(), &store, &AtomicBool::new(false)).unwrap());

    let group = store.groups().unwrap().pop().unwrap();
    let name = store.backups(&group, true).unwrap().pop().unwrap();

    assert_eq!(
        *events.borrow(),
        [
            format!("group-created {}", group),
            format!("backup-created {}/{}", group, name),
        ]
    );
}

#[test]
fn test_failing_observer_marks_run_failed() {
    let env = TestEnv::new();
    fs::write(env.src("a"), "1234").unwrap();

    let observers = Observers {
        on_backup_created: Some(Box::new(|_, _| anyhow::bail!("hook failure"))),
        ..Default::default()
    };

    let store = GroupStore::open(&env.root, observers).unwrap();
    assert!(!walker::backup(&env.config(), &store, &AtomicBool::new(false)).unwrap());

    // The backup survives the observer failure
    let group = store.groups().unwrap().pop().unwrap();
    assert_eq!(store.backups(&group, true).unwrap().len(), 1);
}

#[test]
fn test_cancellation_discards_backup() {
    let env = TestEnv::new();
    fs::write(env.src("a"), "1234").unwrap();

    let store = GroupStore::open(&env.root, Observers::default()).unwrap();
    let result = walker::backup(&env.config(), &store, &AtomicBool::new(true));
    assert!(result.is_err());

    // No committed backup and no in-progress leftovers
    for group in store.groups().unwrap() {
        assert!(store.backups(&group, true).unwrap().is_empty());
        let leftovers: Vec<_> = fs::read_dir(env.root.join(&group))
            .unwrap()
            .map(|dir_entry| dir_entry.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
    }
}

#[test]
fn test_restore_path_filters() {
    let env = TestEnv::new();

    fs::write(env.src("a"), "1234").unwrap();
    fs::create_dir(env.src("sub")).unwrap();
    fs::write(env.src("sub/c"), "5678").unwrap();

    let (group, name) = env.backup();

    let dest = env.restore_paths(&group, &name, &[env.src("sub")]);
    let restored = env.restored(&dest);

    assert_eq!(fs::read(restored.join("sub/c")).unwrap(), b"5678");
    assert!(!restored.join("a").exists());
}

#[test]
fn test_long_names_round_trip() {
    let env = TestEnv::new();

    // Names beyond the 100-byte tar header field
    let dir = "d".repeat(120);
    let file = "f".repeat(120);
    fs::create_dir(env.src(&dir)).unwrap();
    let path = env.src(&dir).join(&file);
    fs::write(&path, "1234").unwrap();

    let (group, name) = env.backup();
    let restored = env.restored(&env.restore(&group, &name));
    assert_eq!(fs::read(restored.join(&dir).join(&file)).unwrap(), b"1234");
}

#[test]
fn test_empty_files_stay_unique() {
    let env = TestEnv::new();

    fs::write(env.src("empty-1"), "").unwrap();
    fs::write(env.src("empty-2"), "").unwrap();

    let (group, name) = env.backup();

    let first = env.record(&group, &name, "empty-1");
    let second = env.record(&group, &name, "empty-2");
    assert!(first.unique);
    assert!(second.unique);
    assert_eq!(first.hash, hash_bytes(b""));

    let restored = env.restored(&env.restore(&group, &name));
    assert_eq!(fs::read(restored.join("empty-1")).unwrap(), b"");
    assert_eq!(fs::read(restored.join("empty-2")).unwrap(), b"");
}

fn tar_entry_size(backup_path: &Path, file: &str) -> u64 {
    let reader = TarReader::open(backup_path, false).unwrap();
    let mut archive = reader.archive().unwrap();

    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        if entry.path().unwrap().file_name() == Some(file.as_ref()) {
            return entry.header().size().unwrap();
        }
    }

    panic!("{:?} is not in the archive", file);
}

fn tar_entry_types(backup_path: &Path) -> HashMap<PathBuf, tar::EntryType> {
    let reader = TarReader::open(backup_path, false).unwrap();
    let mut archive = reader.archive().unwrap();

    let mut types = HashMap::new();
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let path = entry.path().unwrap().into_owned();
        let name = path.file_name().map(PathBuf::from).unwrap_or(path);
        types.insert(name, entry.header().entry_type());
    }
    types
}
