//! Preflight checks.
//!
//! Verifies the host can run a build before any stage starts.
//! Run with `boardfs preflight` to check everything is ready.

use anyhow::{bail, Result};
use std::path::Path;

use crate::process;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - build will fail.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if all checks passed (no failures).
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let (icon, status_str) = match check.status {
                CheckStatus::Pass => ("✓", "PASS"),
                CheckStatus::Fail => ("✗", "FAIL"),
                CheckStatus::Warn => ("⚠", "WARN"),
            };

            print!("  {} [{}] {}", icon, status_str, check.name);
            if let Some(details) = &check.details {
                println!(": {}", details);
            } else {
                println!();
            }
        }

        println!();
        let total = self.checks.len();
        let passed = self.count(CheckStatus::Pass);
        println!("Summary: {}/{} passed", passed, total);
        if self.fail_count() > 0 {
            println!("         {} FAILED - build will not succeed", self.fail_count());
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }
}

/// Tools a build shells out to, with the package providing them.
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("qemu-debootstrap", "qemu-user-static", "Required to bootstrap a foreign-arch rootfs"),
    ("debootstrap", "debootstrap", "Required by qemu-debootstrap"),
    ("chroot", "coreutils", "Required to configure the rootfs"),
];

/// Run all preflight checks against the given output directory.
pub fn run_preflight(output: &Path) -> PreflightReport {
    let mut checks = Vec::new();

    for (tool, package, purpose) in REQUIRED_TOOLS {
        checks.push(check_tool_exists(tool, package, purpose));
    }

    if process::running_as_root() {
        checks.push(CheckResult::pass("root privileges"));
    } else {
        checks.push(CheckResult::fail(
            "root privileges",
            "debootstrap and chroot need root. Run with sudo.",
        ));
    }

    if Path::new("/proc/sys/fs/binfmt_misc").is_dir() {
        checks.push(CheckResult::pass("binfmt_misc"));
    } else {
        checks.push(CheckResult::warn(
            "binfmt_misc",
            "Not mounted - foreign-arch binaries won't run in the chroot",
        ));
    }

    checks.push(check_writable(output));

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(output: &Path) -> Result<()> {
    let report = run_preflight(output);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

fn check_tool_exists(tool: &str, package: &str, purpose: &str) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => CheckResult::fail(
            tool,
            &format!("Not found. Install '{}' package. {}", package, purpose),
        ),
    }
}

fn check_writable(output: &Path) -> CheckResult {
    let name = format!("{} writable", output.display());
    if let Err(e) = std::fs::create_dir_all(output) {
        return CheckResult::fail(&name, &format!("Cannot create: {}", e));
    }
    let probe = output.join(".preflight-test");
    match std::fs::write(&probe, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::pass(&name)
        }
        Err(e) => CheckResult::fail(&name, &format!("Cannot write: {}", e)),
    }
}
