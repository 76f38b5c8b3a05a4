//! Build directory layout.
//!
//! ```text
//! <output>/
//!     .lock                     held while a pipeline runs
//!     .stamps/<stage>.json      one stamp per completed stage
//!     <name>/                   working tree handed from stage to stage
//!     <name>.<stage>.tar.gz     archived snapshots
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ConfigProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    output: PathBuf,
    name: String,
}

impl Layout {
    /// Layout for a working tree called `name` under `output`.
    pub fn new(output: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            name: name.into(),
        }
    }

    /// Working tree named `<board>-<release>-<variant>`.
    pub fn for_config(output: impl Into<PathBuf>, config: &dyn ConfigProvider) -> Self {
        let name = format!(
            "{}-{}-{}",
            config.board().name,
            config.distribution().release,
            config.variant().name
        );
        Self::new(output, name)
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Basename of the working tree, used to name archives.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The working directory stages read from and write to.
    pub fn work_dir(&self) -> PathBuf {
        self.output.join(&self.name)
    }

    pub fn stamp_dir(&self) -> PathBuf {
        self.output.join(".stamps")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.output.join(".lock")
    }

    /// `<output>/<name>.<stage>.tar.gz`
    pub fn archive(&self, stage: &str) -> PathBuf {
        self.output.join(format!("{}.{}.tar.gz", self.name, stage))
    }

    /// Remove the working directory if it exists and create it fresh.
    pub fn prepare_work_dir(&self) -> Result<PathBuf> {
        let work_dir = self.work_dir();

        // Clean up if it exists from a previous run
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir)
                .with_context(|| format!("Failed to remove {}", work_dir.display()))?;
        }

        fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;

        Ok(work_dir)
    }
}
