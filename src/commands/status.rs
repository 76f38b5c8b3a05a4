//! Status command - shows which stages would be skipped.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use boardfs::archive::TarGz;
use boardfs::config::BuildConfig;
use boardfs::pipeline::Pipeline;
use boardfs::process::HostShell;
use boardfs::rootfs;
use boardfs::{Layout, Toolbox};

/// Execute the status command.
pub fn cmd_status(config_path: &Path, output: &Path) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    let layout = Layout::for_config(output, &config);
    let stages = rootfs::stages(&config.variant.name)?;

    let tools = Toolbox::new(Arc::new(HostShell), Arc::new(TarGz::default()));
    let pipeline = Pipeline::new(&config, layout, tools);

    println!("Stages for {}:", pipeline.layout().name());
    // A cached stage after a pending one is stamped against a run id the
    // pending stage will replace.
    let mut rebuilds: Option<String> = None;
    for (stage, status) in pipeline.status(&stages)? {
        match (&rebuilds, status.is_valid()) {
            (Some(earlier), true) => println!(
                "  {:<10} {:<8} up to date, goes stale when '{}' runs",
                stage, "cached", earlier
            ),
            (_, valid) => {
                let mark = if valid { "cached" } else { "pending" };
                println!("  {:<10} {:<8} {}", stage, mark, status.describe());
            }
        }
        if rebuilds.is_none() && !status.is_valid() {
            rebuilds = Some(stage);
        }
    }
    Ok(())
}
