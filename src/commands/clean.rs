//! Clean command - removes stamps or build outputs.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use boardfs::lock::BuildLock;
use boardfs::{Layout, StageCache};

/// Clean target for the clean command.
pub enum CleanTarget {
    /// Drop every stamp so the next build runs all stages (default)
    Stamps,
    /// Remove the whole output directory
    All,
}

/// Execute the clean command.
pub fn cmd_clean(output: &Path, target: CleanTarget) -> Result<()> {
    if !output.exists() {
        println!("Nothing to clean: {} does not exist.", output.display());
        return Ok(());
    }

    // Stamp dir and lock file don't depend on the tree name.
    let layout = Layout::new(output, "");
    let _lock = BuildLock::acquire(&layout.lock_file(), "clean")?;

    match target {
        CleanTarget::Stamps => {
            let cache = StageCache::new(layout.stamp_dir());
            cache.clear()?;
            println!(
                "Removed stamps in {}. The next build runs every stage.",
                cache.dir().display()
            );
        }
        CleanTarget::All => {
            println!("Removing {}...", output.display());
            fs::remove_dir_all(output)
                .with_context(|| format!("Failed to remove {}", output.display()))?;
            println!("Clean complete.");
        }
    }
    Ok(())
}
