//! Build caching - per-stage stamp records.
//!
//! A stamp is proof that a stage completed against a given fingerprint. One
//! JSON file per stage lives under the stamp directory. Writes go to a
//! temporary file that is renamed into place, so a crash mid-write never
//! leaves a record that reads as valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CacheError;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::stage::ArtifactRef;

const STAMP_VERSION: u32 = 2;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifier unique to one execution of one stage.
fn new_run_id(stage: &str, fingerprint: &Fingerprint, now: std::time::Duration) -> String {
    FingerprintBuilder::new()
        .field("stage", stage)
        .field("fingerprint", fingerprint.as_str())
        .field("nanos", now.as_nanos().to_string())
        .field("pid", std::process::id().to_string())
        .field("seq", RUN_SEQ.fetch_add(1, Ordering::Relaxed).to_string())
        .finish()
        .as_str()
        .to_string()
}

/// Persisted completion record for one stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StampRecord {
    pub version: u32,
    pub stage: String,
    pub fingerprint: String,
    /// Changes every time the stage executes. Chained into the next
    /// stage's fingerprint.
    pub run_id: String,
    pub artifacts: Vec<PathBuf>,
    pub completed: bool,
    pub completed_at_unix: u64,
}

/// Why a stage would or would not run, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampStatus {
    /// No stamp on disk.
    Missing,
    /// Stamp exists but could not be parsed.
    Corrupt,
    /// Stamp was made with different inputs.
    Stale,
    /// Stamp matches but a recorded output is gone.
    ArtifactMissing(PathBuf),
    Valid,
}

impl StampStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Missing => "not built".to_string(),
            Self::Corrupt => "stamp unreadable (will rebuild)".to_string(),
            Self::Stale => "inputs changed".to_string(),
            Self::ArtifactMissing(path) => format!("output missing: {}", path.display()),
            Self::Valid => "up to date".to_string(),
        }
    }
}

/// Stamp store rooted at a build-metadata directory.
#[derive(Debug, Clone)]
pub struct StageCache {
    dir: PathBuf,
}

impl StageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the stamp file for a stage.
    pub fn stamp_path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stage))
    }

    fn temp_path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", stage))
    }

    /// Read the stamp for a stage.
    ///
    /// Returns None if the stamp doesn't exist.
    /// Logs a warning if it exists but can't be read or parsed.
    pub fn read(&self, stage: &str) -> Option<StampRecord> {
        self.load(stage).ok().flatten()
    }

    fn load(&self, stage: &str) -> Result<Option<StampRecord>, ()> {
        let path = self.stamp_path(stage);
        if !path.exists() {
            return Ok(None);
        }
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    "Failed to read stamp {}: {} (stage will rebuild)",
                    path.display(),
                    e
                );
                return Err(());
            }
        };
        match serde_json::from_str::<StampRecord>(&content) {
            Ok(record) if record.version != STAMP_VERSION => {
                tracing::warn!(
                    "Stamp {} has version {} (stage will rebuild)",
                    path.display(),
                    record.version
                );
                Err(())
            }
            Ok(record) if record.stage == stage => Ok(Some(record)),
            Ok(record) => {
                tracing::warn!(
                    "Stamp {} names stage '{}' (stage will rebuild)",
                    path.display(),
                    record.stage
                );
                Err(())
            }
            Err(e) => {
                tracing::warn!(
                    "Corrupted stamp {}: {} (stage will rebuild)",
                    path.display(),
                    e
                );
                Err(())
            }
        }
    }

    /// Full status of a stage's stamp against the current fingerprint.
    pub fn status(&self, stage: &str, fingerprint: &Fingerprint) -> StampStatus {
        let record = match self.load(stage) {
            Ok(Some(r)) => r,
            Ok(None) => return StampStatus::Missing,
            Err(()) => return StampStatus::Corrupt,
        };

        if !record.completed || record.fingerprint != fingerprint.as_str() {
            return StampStatus::Stale;
        }

        if let Some(missing) = record.artifacts.iter().find(|p| !p.exists()) {
            return StampStatus::ArtifactMissing(missing.clone());
        }

        StampStatus::Valid
    }

    /// True iff the stage completed with this fingerprint and all of its
    /// outputs are still on disk. Never writes.
    pub fn is_valid(&self, stage: &str, fingerprint: &Fingerprint) -> bool {
        self.status(stage, fingerprint).is_valid()
    }

    /// Record a completed stage, replacing any earlier stamp.
    ///
    /// Every call stamps a fresh run id, even for an unchanged fingerprint.
    pub fn record(
        &self,
        stage: &str,
        fingerprint: &Fingerprint,
        artifacts: &ArtifactRef,
    ) -> Result<StampRecord, CacheError> {
        fs::create_dir_all(&self.dir).map_err(|source| CacheError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let record = StampRecord {
            version: STAMP_VERSION,
            stage: stage.to_string(),
            fingerprint: fingerprint.as_str().to_string(),
            run_id: new_run_id(stage, fingerprint, now),
            artifacts: artifacts.paths().to_vec(),
            completed: true,
            completed_at_unix: now.as_secs(),
        };
        let content =
            serde_json::to_string_pretty(&record).map_err(|source| CacheError::Serialize {
                stage: stage.to_string(),
                source,
            })?;

        let path = self.stamp_path(stage);
        let temp_path = self.temp_path(stage);
        let write_err = |source| CacheError::Write {
            path: path.clone(),
            source,
        };

        let mut file = fs::File::create(&temp_path).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&temp_path, &path).map_err(write_err)?;

        tracing::debug!("Stamped '{}' ({})", stage, fingerprint);
        Ok(record)
    }

    /// Remove a stage's stamp so it runs next time.
    pub fn invalidate(&self, stage: &str) -> Result<(), CacheError> {
        for path in [self.stamp_path(stage), self.temp_path(stage)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::Remove { path, source }),
            }
        }
        Ok(())
    }

    /// Remove every stamp.
    pub fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Remove {
                path: self.dir.clone(),
                source,
            }),
        }
    }
}
