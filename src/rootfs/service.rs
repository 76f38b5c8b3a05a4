//! Systemd units and the APT proxy.
//!
//! Units are enabled by creating the `wants` symlinks directly in the tree;
//! systemd is not running inside the chroot. Debian's own services are
//! toggled through `systemctl` in the chroot, which works offline.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::common::{remove_if_exists, write_file_mode, write_file_with_dirs};
use crate::process::{Cmd, ShellRunner};

const UNIT_DIR: &str = "etc/systemd/system";
const APT_PROXY: &str = "etc/apt/apt.conf.d/01proxy";
const RESIZE_SCRIPT: &str = "usr/local/sbin/resize-rootfs";

/// Route APT through an apt-cacher-ng instance on the build host.
pub fn enable_apt_proxy(root: &Path, host: &str, port: u16) -> Result<()> {
    write_file_with_dirs(
        root.join(APT_PROXY),
        format!("Acquire::http::Proxy \"http://{}:{}\";\n", host, port),
    )
}

pub fn disable_apt_proxy(root: &Path) -> Result<()> {
    remove_if_exists(&root.join(APT_PROXY))
}

/// Enable a unit by linking it from `<target>.wants`.
fn want(root: &Path, target: &str, link_name: &str, unit_path: &str) -> Result<()> {
    let wants = root.join(UNIT_DIR).join(format!("{}.wants", target));
    fs::create_dir_all(&wants)?;

    let link = wants.join(link_name);
    if fs::symlink_metadata(&link).is_err() {
        std::os::unix::fs::symlink(unit_path, &link)
            .with_context(|| format!("Failed to enable {}", link_name))?;
    }
    Ok(())
}

/// Log-in prompt on the board's serial console.
pub fn enable_getty(root: &Path, console: &str) -> Result<()> {
    want(
        root,
        "getty.target",
        &format!("serial-getty@{}.service", console),
        "/lib/systemd/system/serial-getty@.service",
    )
}

/// One-shot unit growing the root partition to fill the card on first boot.
pub fn enable_resize_rootfs(root: &Path) -> Result<()> {
    write_file_mode(
        root.join(RESIZE_SCRIPT),
        r#"#!/bin/sh
set -e
ROOT=$(findmnt -n -o SOURCE /)
DISK=/dev/$(lsblk -n -o PKNAME "$ROOT")
PART=$(cat /sys/class/block/$(basename "$ROOT")/partition)
growpart "$DISK" "$PART" || true
resize2fs "$ROOT"
systemctl disable resize-rootfs.service
"#,
        0o755,
    )?;

    write_file_with_dirs(
        root.join(UNIT_DIR).join("resize-rootfs.service"),
        format!(
            r#"[Unit]
Description=Resize root filesystem to fill the storage
After=local-fs.target

[Service]
Type=oneshot
ExecStart=/{}
RemainAfterExit=no

[Install]
WantedBy=multi-user.target
"#,
            RESIZE_SCRIPT
        ),
    )?;

    want(
        root,
        "multi-user.target",
        "resize-rootfs.service",
        "/etc/systemd/system/resize-rootfs.service",
    )
}

/// Toggle a packaged unit with `systemctl`.
///
/// Enabling must succeed. Disabling a unit the image doesn't ship is
/// reported and ignored.
pub fn set_enabled(shell: &dyn ShellRunner, root: &Path, service: &str, enabled: bool) -> Result<()> {
    if enabled {
        Cmd::new("systemctl")
            .args(["enable", service])
            .chroot(root)
            .error_msg(format!("Failed to enable {}", service))
            .run_with(shell)?;
        return Ok(());
    }

    let result = Cmd::new("systemctl")
        .args(["disable", service])
        .chroot(root)
        .allow_fail()
        .run_with(shell)?;
    if !result.success() {
        tracing::warn!(
            "systemctl disable {} failed: {}",
            service,
            result.stderr_trimmed()
        );
    }
    Ok(())
}
