//! Preflight command - runs preflight checks.

use anyhow::Result;
use std::path::Path;

use boardfs::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(output: &Path, strict: bool) -> Result<()> {
    if strict {
        preflight::run_preflight_or_fail(output)?;
    } else {
        let report = preflight::run_preflight(output);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail the command.");
        }
    }
    Ok(())
}
