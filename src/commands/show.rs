//! Show command - displays information.

use anyhow::Result;
use std::path::Path;

use boardfs::config::BuildConfig;
use boardfs::rootfs;
use boardfs::Layout;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show the resolved configuration
    Config,
    /// Show the stage list of the configured variant
    Stages,
}

/// Execute the show command.
pub fn cmd_show(config_path: &Path, output: &Path, target: ShowTarget) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    match target {
        ShowTarget::Config => {
            config.print();
            let layout = Layout::for_config(output, &config);
            println!("  Working tree: {}", layout.work_dir().display());
        }
        ShowTarget::Stages => {
            for (i, stage) in rootfs::stages(&config.variant.name)?.iter().enumerate() {
                println!("  {}. {}", i + 1, stage.name());
            }
        }
    }
    Ok(())
}
