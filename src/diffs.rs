//! Append-only diff log.
//!
//! One sealed diff per file, named `diff_<base>_<target>.json` with
//! zero-padded versions so lexical order equals version order. The log
//! trusts the caller's stated base version; serializing "read version,
//! compute diff, append" is the store facade's job.

use crate::error::{Result, StoreError};
use crate::integrity::{SealedRecord, SigningKey};
use crate::migrate::CURRENT_SCHEMA_VERSION;
use crate::types::{Operation, Timestamp, WorldDiff, WorldVersion, VERSION_PAD_WIDTH};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Append-only store of sealed world diffs.
pub struct DiffLog {
    dir: PathBuf,
    key: SigningKey,
}

impl DiffLog {
    /// Open the log rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, key: SigningKey) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, key })
    }

    /// Seal and persist a diff transforming `base` into `base + 1`.
    ///
    /// The declared base is trusted as-is; `target` is stamped as
    /// `base + 1`. Writing a second diff for the same base fails rather
    /// than overwriting, because records are write-once.
    pub fn append(
        &self,
        base: WorldVersion,
        tick: u64,
        operations: Vec<Operation>,
    ) -> Result<WorldDiff> {
        let diff = WorldDiff {
            schema_version: CURRENT_SCHEMA_VERSION,
            base_world_version: base,
            target_world_version: base.next(),
            tick,
            operations,
            created_at: Timestamp::now(),
        };

        let record = SealedRecord::seal(diff.clone(), &self.key)?;
        let path = self.diff_path(diff.base_world_version, diff.target_world_version);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::InvalidOperation(format!(
                        "diff for base version {} already exists",
                        diff.base_world_version
                    ))
                } else {
                    StoreError::Io(e)
                }
            })?;
        file.write_all(&serde_json::to_vec_pretty(&record)?)?;
        file.sync_all()?;

        debug!(
            base = diff.base_world_version.0,
            target = diff.target_world_version.0,
            operations = diff.operations.len(),
            "appended diff"
        );
        Ok(diff)
    }

    /// Lazy, restartable stream of diffs with `base_world_version >= min`,
    /// ascending by target version.
    ///
    /// Each pull reads and verifies one file. An invalid envelope surfaces
    /// as an error rather than being skipped: a silent gap here would
    /// corrupt replay. The stream stops after the first error.
    pub fn stream_from(&self, min: WorldVersion) -> Result<DiffStream<'_>> {
        let mut paths: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            // Base version is in the file name, so filtering needs no IO.
            if let Some((base, target)) = parse_diff_stem(stem) {
                if base >= min.0 {
                    paths.push((target, path));
                }
            }
        }
        paths.sort();

        Ok(DiffStream {
            log: self,
            paths: paths.into_iter(),
            failed: false,
        })
    }

    /// Read and verify one diff file.
    fn read_diff(&self, path: &Path) -> Result<WorldDiff> {
        let raw = fs::read(path)?;
        let record: SealedRecord<Value> = serde_json::from_slice(&raw)?;
        if !record.verify(&self.key) {
            return Err(StoreError::SignatureMismatch(path.display().to_string()));
        }
        Ok(serde_json::from_value(record.payload)?)
    }

    fn diff_path(&self, base: WorldVersion, target: WorldVersion) -> PathBuf {
        self.dir.join(format!(
            "diff_{:0w$}_{:0w$}.json",
            base.0,
            target.0,
            w = VERSION_PAD_WIDTH
        ))
    }
}

/// Parse `diff_<base>_<target>` into version numbers.
fn parse_diff_stem(stem: &str) -> Option<(u64, u64)> {
    let rest = stem.strip_prefix("diff_")?;
    let mut parts = rest.split('_');
    let base = parts.next()?;
    let target = parts.next()?;
    if parts.next().is_some()
        || base.len() != VERSION_PAD_WIDTH
        || target.len() != VERSION_PAD_WIDTH
    {
        return None;
    }
    Some((base.parse().ok()?, target.parse().ok()?))
}

/// Iterator over sealed diffs, verifying each on read.
pub struct DiffStream<'a> {
    log: &'a DiffLog,
    paths: std::vec::IntoIter<(u64, PathBuf)>,
    failed: bool,
}

impl<'a> Iterator for DiffStream<'a> {
    type Item = Result<WorldDiff>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (_, path) = self.paths.next()?;
        match self.log.read_diff(&path) {
            Ok(diff) => Some(Ok(diff)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
