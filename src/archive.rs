//! Tarball operations for the working tree.
//!
//! Both directions stage into a `.partial` sibling and rename it into place,
//! so a crash or error never leaves a half-written archive or a
//! half-extracted tree at the destination path.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::running_as_root;

/// Compresses and extracts artifact trees. Both operations are
/// all-or-nothing.
pub trait ArchiveCodec {
    /// Pack `src_dir` into the archive at `dest`.
    fn compress(&self, src_dir: &Path, dest: &Path) -> Result<PathBuf>;

    /// Unpack `archive` into `dest_dir`, replacing anything already there.
    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<PathBuf>;
}

/// gzip-compressed tar archives.
#[derive(Debug, Clone, Copy)]
pub struct TarGz {
    level: Compression,
}

impl Default for TarGz {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl TarGz {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

/// Sibling of `path` with `.partial` appended to its final component.
fn partial_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn remove_any(path: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.with_context(|| format!("Failed to remove {}", path.display()))
}

impl ArchiveCodec for TarGz {
    fn compress(&self, src_dir: &Path, dest: &Path) -> Result<PathBuf> {
        if !src_dir.is_dir() {
            anyhow::bail!("Cannot archive {}: not a directory", src_dir.display());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let partial = partial_path(dest);
        let result = (|| -> Result<()> {
            let file = fs::File::create(&partial)
                .with_context(|| format!("Failed to create {}", partial.display()))?;
            let mut builder = tar::Builder::new(GzEncoder::new(file, self.level));
            builder.follow_symlinks(false);
            builder
                .append_dir_all(".", src_dir)
                .with_context(|| format!("Failed to archive {}", src_dir.display()))?;
            let file = builder.into_inner()?.finish()?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        fs::rename(&partial, dest)
            .with_context(|| format!("Failed to move archive into {}", dest.display()))?;

        let size_mb = fs::metadata(dest)?.len() as f64 / 1024.0 / 1024.0;
        tracing::info!("  Archive {} ({:.2} MB)", dest.display(), size_mb);
        Ok(dest.to_path_buf())
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<PathBuf> {
        if !archive.exists() {
            anyhow::bail!("Archive not found: {}", archive.display());
        }

        let partial = partial_path(dest_dir);
        remove_any(&partial)?;
        fs::create_dir_all(&partial)?;

        let result = (|| -> Result<()> {
            let file = fs::File::open(archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;
            let mut tar = tar::Archive::new(GzDecoder::new(file));
            tar.set_preserve_permissions(true);
            tar.set_preserve_ownerships(running_as_root());
            tar.set_overwrite(true);
            tar.unpack(&partial)
                .with_context(|| format!("Failed to extract {}", archive.display()))?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&partial);
            return Err(e);
        }

        remove_any(dest_dir)?;
        fs::rename(&partial, dest_dir)
            .with_context(|| format!("Failed to move tree into {}", dest_dir.display()))?;
        Ok(dest_dir.to_path_buf())
    }
}
