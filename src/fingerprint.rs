//! Stage fingerprints - hash-based input summaries.
//!
//! Uses SHA256 over the declared inputs of a stage, not mtimes or wall-clock
//! time, so a cached stage stays valid for as long as it is asked to build
//! the same thing.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Hex-encoded SHA256 summary of a stage's inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Combine this fingerprint with the stage before it.
    ///
    /// `upstream` is the previous stage's chained fingerprint and
    /// `upstream_run` the run id from its stamp. A change in any earlier
    /// stage's inputs, or any re-execution of it, moves every later
    /// stage's chained fingerprint.
    pub fn chain(&self, upstream: Option<&Fingerprint>, upstream_run: Option<&str>) -> Fingerprint {
        let mut builder = FingerprintBuilder::new();
        if let Some(upstream) = upstream {
            builder = builder.field("upstream", upstream.as_str());
        }
        if let Some(run) = upstream_run {
            builder = builder.field("upstream-run", run);
        }
        builder.field("own", self.as_str()).finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incrementally hashes labelled inputs.
///
/// Every input is framed with its label and byte length, so
/// `field("a", "bc")` and `field("ab", "c")` never collide.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn frame(&mut self, label: &str, bytes: &[u8]) {
        self.hasher.update((label.len() as u64).to_le_bytes());
        self.hasher.update(label.as_bytes());
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Add a plain string value.
    pub fn field(mut self, label: &str, value: impl AsRef<str>) -> Self {
        self.frame(label, value.as_ref().as_bytes());
        self
    }

    /// Add any serializable value through its JSON form.
    ///
    /// Struct fields serialize in declaration order, so the encoding is
    /// stable for a given type.
    pub fn json<T: Serialize + ?Sized>(mut self, label: &str, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value)
            .with_context(|| format!("Failed to encode '{}' for fingerprinting", label))?;
        self.frame(label, &encoded);
        Ok(self)
    }

    /// Add the contents of a file.
    pub fn file(mut self, label: &str, path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
        self.frame(label, &content);
        Ok(self)
    }

    /// Add every file below a directory: relative path, then content.
    ///
    /// Entries are visited in sorted order. Symlinks are hashed by target,
    /// not followed.
    pub fn tree(mut self, label: &str, root: &Path) -> Result<Self> {
        self.frame(label, root.to_string_lossy().as_bytes());
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("Failed to walk {} for hashing", root.display()))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                self.frame(&format!("link:{}", rel), target.to_string_lossy().as_bytes());
            } else if file_type.is_file() {
                let content = fs::read(entry.path()).with_context(|| {
                    format!("Failed to read {} for hashing", entry.path().display())
                })?;
                self.frame(&format!("file:{}", rel), &content);
            } else if file_type.is_dir() {
                self.frame(&format!("dir:{}", rel), &[]);
            }
        }
        Ok(self)
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.hasher.finalize()))
    }
}
