//! On-disk market-cap files: one per coin and one per calendar date.
//!
//! Every update reads the whole file, merges by key (text before the first
//! comma, last write wins) and rewrites it sorted by key through a temp file
//! and rename. Writes are serialized through a store-wide lock so per-date
//! files touched by many coins never interleave.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const UNIVERSE_DIR: &str = "universe";
const FILE_EXTENSION: &str = "csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreTarget {
    Coin,
    Universe,
}

/// All-digit keys are calendar dates and go to the universe store.
pub fn route(file_key: &str) -> StoreTarget {
    if !file_key.is_empty() && file_key.bytes().all(|b| b.is_ascii_digit()) {
        StoreTarget::Universe
    } else {
        StoreTarget::Coin
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid file key '{0}'")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub path: PathBuf,
    pub target: StoreTarget,
    pub lines_written: usize,
    pub added: usize,
    pub conflicts: usize,
    pub rewritten: bool,
}

#[derive(Debug)]
pub struct MarketCapStore {
    root: PathBuf,
    universe_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl MarketCapStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let universe_dir = root.join(UNIVERSE_DIR);
        fs::create_dir_all(&universe_dir).map_err(|source| StoreError::Io {
            path: universe_dir.clone(),
            source,
        })?;

        Ok(Self {
            root,
            universe_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn universe_dir(&self) -> &Path {
        &self.universe_dir
    }

    pub fn path_for(&self, file_key: &str) -> Result<PathBuf, StoreError> {
        validate_key(file_key)?;
        let dir = match route(file_key) {
            StoreTarget::Universe => &self.universe_dir,
            StoreTarget::Coin => &self.root,
        };
        Ok(dir.join(format!("{file_key}.{FILE_EXTENSION}")))
    }

    /// Current lines of a file in key order; a missing file reads as empty.
    pub fn read_lines(&self, file_key: &str) -> Result<Vec<String>, StoreError> {
        let path = self.path_for(file_key)?;
        Ok(read_existing(&path)?
            .map(|content| clean_lines(&content).map(str::to_string).collect())
            .unwrap_or_default())
    }

    pub fn merge_write<I, S>(&self, file_key: &str, new_lines: I) -> Result<MergeReport, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path = self.path_for(file_key)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let existing = read_existing(&path)?;
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        if let Some(content) = existing.as_deref() {
            for line in clean_lines(content) {
                merged.insert(line_key(line).to_string(), line.to_string());
            }
        }

        let mut added = 0usize;
        let mut conflicts = 0usize;
        for raw in new_lines {
            let Some(line) = clean_lines(raw.as_ref()).next() else {
                continue;
            };
            match merged.entry(line_key(line).to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(line.to_string());
                    added += 1;
                }
                Entry::Occupied(mut slot) => {
                    if slot.get() != line {
                        warn!(
                            component = "store",
                            event = "store.merge.conflict",
                            file_key,
                            previous = %slot.get(),
                            replacement = %line
                        );
                        conflicts += 1;
                        slot.insert(line.to_string());
                    }
                }
            }
        }

        let content = merged.values().map(String::as_str).collect::<Vec<_>>().join("\n");
        let rewritten = existing.as_deref() != Some(content.as_str());
        if rewritten {
            write_atomic(&path, content.as_bytes())?;
        }

        debug!(
            component = "store",
            event = "store.merge.done",
            file_key,
            path = %path.display(),
            lines = merged.len(),
            added,
            conflicts,
            rewritten
        );

        Ok(MergeReport {
            path,
            target: route(file_key),
            lines_written: merged.len(),
            added,
            conflicts,
            rewritten,
        })
    }
}

fn validate_key(file_key: &str) -> Result<(), StoreError> {
    let valid = !file_key.is_empty()
        && file_key != "."
        && file_key != ".."
        && file_key != UNIVERSE_DIR
        && !file_key
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(file_key.to_string()))
    }
}

fn line_key(line: &str) -> &str {
    line.split_once(',').map(|(key, _)| key).unwrap_or(line)
}

fn clean_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
}

fn read_existing(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    let io_err = |source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    };

    {
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }

    fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
