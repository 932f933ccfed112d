use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::tarstream::Compression;

/// Run configuration, deserialized from a JSON file and validated before the
/// run touches the filesystem.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Absolute path of the directory the backup groups live under.
    pub backup_root: PathBuf,

    /// Subtrees to back up, in order, with their per-item parameters.
    pub backup_items: IndexMap<String, BackupItem>,

    /// Committed backups per group before a new group is started.
    pub max_backups: usize,

    /// Groups to retain; older ones are deleted after a commit.
    pub max_backup_groups: usize,

    /// Treat an unchanged (device, inode, mtime) fingerprint as proof that a
    /// file is unchanged since the most recent backup.
    #[serde(default = "default_true")]
    pub trust_modify_time: bool,

    /// Store multiply-linked regular files as tar hard-link records instead
    /// of duplicating their bodies.
    #[serde(default = "default_true")]
    pub preserve_hard_links: bool,

    #[serde(default)]
    pub compression: Compression,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BackupItem {
    /// Shell command to run before backing up this item.
    pub before: Option<String>,

    /// Shell command to run after backing up this item.
    pub after: Option<String>,

    /// Filter rules applied to each path relative to the item root. First
    /// match wins; unmatched paths are allowed.
    #[serde(default)]
    pub filter: Vec<FilterRule>,
}

/// One filter rule: a `+` (allow) or `-` (deny) policy prefix followed by a
/// regular expression.
#[derive(Clone)]
pub struct FilterRule {
    pub allow: bool,
    pub regex: Regex,
}

impl FromStr for FilterRule {
    type Err = anyhow::Error;

    fn from_str(rule: &str) -> Result<FilterRule> {
        let allow = match rule.chars().next() {
            Some('+') => true,
            Some('-') => false,
            _ => bail!(
                "invalid filter {:?}: it must be prepended with a filtering policy ('+' or '-')",
                rule
            ),
        };

        let regex = Regex::new(&rule[1..])
            .with_context(|| format!("invalid filter regular expression {:?}", &rule[1..]))?;

        Ok(FilterRule { allow, regex })
    }
}

impl<'de> Deserialize<'de> for FilterRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FilterRule, D::Error> {
        let rule = String::deserialize(deserializer)?;
        rule.parse()
            .map_err(|e: anyhow::Error| serde::de::Error::custom(format!("{:#}", e)))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;

        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {:?}", path))?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.backup_root.is_absolute() {
            bail!("backup_root must be an absolute path");
        }

        if self.backup_items.is_empty() {
            bail!("backup_items must not be empty");
        }
        for path in self.backup_items.keys() {
            if !Path::new(path).is_absolute() {
                bail!("backup item path {:?} must be absolute", path);
            }
        }

        if self.max_backups == 0 {
            bail!("max_backups must be a positive number");
        }
        if self.max_backup_groups == 0 {
            bail!("max_backup_groups must be a positive number");
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}
