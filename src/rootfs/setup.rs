//! Configuration steps run against a bootstrapped rootfs.
//!
//! Files are written directly into the tree; anything that needs the
//! target's own tools (apt-get, locale-gen, useradd) runs in a chroot.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::common::{remove_if_exists, write_file_mode, write_file_with_dirs};
use crate::config::{locale_codeset, Distribution, User};
use crate::process::{Cmd, CommandResult, ShellRunner};

const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";

/// Run apt-get non-interactively inside the rootfs.
pub fn apt_get<I, S>(shell: &dyn ShellRunner, root: &Path, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Cmd::new("apt-get")
        .args(args)
        .chroot(root)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .run_with(shell)
}

/// Install packages inside the rootfs.
pub fn install(shell: &dyn ShellRunner, root: &Path, packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }
    apt_get(
        shell,
        root,
        ["install", "-y", "--no-install-recommends"]
            .into_iter()
            .map(String::from)
            .chain(packages.iter().cloned()),
    )?;
    Ok(())
}

/// Stop package maintainer scripts from starting daemons in the chroot.
pub fn block_daemons(root: &Path) -> Result<()> {
    write_file_mode(root.join(POLICY_RC_D), "#!/bin/sh\nexit 101\n", 0o755)
}

pub fn unblock_daemons(root: &Path) -> Result<()> {
    remove_if_exists(&root.join(POLICY_RC_D))
}

/// Contents of /etc/apt/sources.list.
pub fn sources_list(distribution: &Distribution) -> String {
    let components = distribution.components.join(" ");
    format!(
        "deb {repo} {release} {components}\n\
         deb {repo} {release}-updates {components}\n",
        repo = distribution.repository,
        release = distribution.release,
        components = components,
    )
}

/// Point APT at the configured mirror and refresh the package lists.
pub fn apt(shell: &dyn ShellRunner, root: &Path, distribution: &Distribution) -> Result<()> {
    write_file_with_dirs(root.join("etc/apt/sources.list"), sources_list(distribution))?;
    apt_get(shell, root, ["update"])?;
    Ok(())
}

/// Drop downloaded .deb files and package lists left by the build.
pub fn apt_clean(shell: &dyn ShellRunner, root: &Path) -> Result<()> {
    apt_get(shell, root, ["clean"])?;
    let lists = root.join("var/lib/apt/lists");
    if lists.is_dir() {
        for entry in fs::read_dir(&lists)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

/// Generate and select the system locale.
pub fn locales(shell: &dyn ShellRunner, root: &Path, locale: &str) -> Result<()> {
    let Some(charset) = locale_codeset(locale) else {
        bail!("Locale '{}' has no codeset (expected e.g. en_US.UTF-8)", locale);
    };
    install(shell, root, &["locales".to_string()])?;
    write_file_with_dirs(
        root.join("etc/locale.gen"),
        format!("{} {}\n", locale, charset),
    )?;
    Cmd::new("locale-gen").chroot(root).run_with(shell)?;
    Cmd::new("update-locale")
        .arg(format!("LANG={}", locale))
        .chroot(root)
        .run_with(shell)?;
    Ok(())
}

/// Contents of /etc/default/keyboard.
pub fn keyboard_config(keymap: &str, layout: &str) -> String {
    format!(
        "XKBMODEL=\"{}\"\nXKBLAYOUT=\"{}\"\nXKBVARIANT=\"\"\nXKBOPTIONS=\"\"\nBACKSPACE=\"guess\"\n",
        keymap, layout
    )
}

/// Configure the console keyboard.
pub fn console(shell: &dyn ShellRunner, root: &Path, keymap: &str, layout: &str) -> Result<()> {
    write_file_with_dirs(
        root.join("etc/default/keyboard"),
        keyboard_config(keymap, layout),
    )?;
    install(
        shell,
        root,
        &["console-setup".to_string(), "keyboard-configuration".to_string()],
    )
}

/// Write the boot-time mount table.
pub fn boot(root: &Path) -> Result<()> {
    write_file_with_dirs(
        root.join("etc/fstab"),
        "# <file system>\t<mount point>\t<type>\t<options>\t<dump>\t<pass>\n\
         LABEL=rootfs\t/\text4\tdefaults,noatime\t0\t1\n\
         tmpfs\t/tmp\ttmpfs\tdefaults,nosuid\t0\t0\n",
    )
}

pub fn hostname(root: &Path, hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.contains(char::is_whitespace) {
        bail!("Invalid hostname '{}'", hostname);
    }
    write_file_with_dirs(root.join("etc/hostname"), format!("{}\n", hostname))?;
    write_file_with_dirs(
        root.join("etc/hosts"),
        format!(
            "127.0.0.1\tlocalhost\n127.0.1.1\t{}\n\n\
             ::1\t\tlocalhost ip6-localhost ip6-loopback\n\
             ff02::1\t\tip6-allnodes\nff02::2\t\tip6-allrouters\n",
            hostname
        ),
    )
}

/// Create a login user (or just set the password for root).
///
/// The password travels through the environment so it never has to be
/// quoted into a shell command line.
pub fn user(shell: &dyn ShellRunner, root: &Path, user: &User) -> Result<()> {
    if user.name != "root" {
        let mut cmd = Cmd::new("useradd").args(["-m", "-s", "/bin/bash"]);
        if !user.groups.is_empty() {
            cmd = cmd.arg("-G").arg(user.groups.join(","));
        }
        cmd.arg(&user.name)
            .chroot(root)
            .error_msg(format!("Failed to add user '{}'", user.name))
            .run_with(shell)?;
    }

    Cmd::new("sh")
        .args(["-c", "printf '%s\\n' \"$BOARDFS_CREDENTIALS\" | chpasswd"])
        .env("BOARDFS_CREDENTIALS", format!("{}:{}", user.name, user.password))
        .chroot(root)
        .error_msg(format!("Failed to set password for '{}'", user.name))
        .run_with(shell)?;
    Ok(())
}

/// Point /etc/localtime at the zone file and record the zone name.
pub fn timezone(root: &Path, zone: &str) -> Result<()> {
    if zone.contains("..") {
        bail!("Invalid timezone '{}'", zone);
    }
    let zone_file = Path::new("/usr/share/zoneinfo").join(zone);
    let in_root = root.join(zone_file.strip_prefix("/")?);
    if !in_root.exists() {
        bail!("Unknown timezone '{}' ({} not found)", zone, in_root.display());
    }

    let localtime = root.join("etc/localtime");
    remove_if_exists(&localtime)?;
    std::os::unix::fs::symlink(&zone_file, &localtime)
        .with_context(|| format!("Failed to link {}", localtime.display()))?;
    write_file_with_dirs(root.join("etc/timezone"), format!("{}\n", zone))
}
