//! The `lite` variant: a console-only Debian image.
//!
//! `build` bootstraps the base system and archives it. `configure` starts
//! from a fresh copy of that archive every time, so it can be re-run after
//! any configuration change without re-bootstrapping. Build-time state that
//! must not ship (APT proxy, package caches, the daemon blocker) is undone
//! by `cleanup` before `export` packs the tree.

use anyhow::Result;
use std::path::PathBuf;

use super::{service, setup, BUILD, CLEANUP, CONFIGURE, EXPORT};
use crate::common::copy_tree;
use crate::config::ConfigProvider;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::process::Cmd;
use crate::stage::{ArtifactRef, Stage, StageContext};
use crate::timing::step;

/// Packaged services nobody needs on a headless board.
const DISABLED_SERVICES: &[&str] = &["hwclock.sh", "nfs-common", "rpcbind"];

pub fn stages() -> Vec<Stage> {
    vec![
        Stage::new(BUILD, build_fingerprint, build),
        Stage::new(CONFIGURE, configure_fingerprint, configure),
        Stage::new(CLEANUP, constant_fingerprint(CLEANUP), cleanup),
        Stage::new(EXPORT, constant_fingerprint(EXPORT), export),
    ]
}

fn build_fingerprint(config: &dyn ConfigProvider) -> Result<Fingerprint> {
    let distribution = config.distribution();
    Ok(FingerprintBuilder::new()
        .field("arch", &config.board().arch)
        .field("release", &distribution.release)
        .field("repository", &distribution.repository)
        .field("components", distribution.components.join(","))
        .finish())
}

fn configure_fingerprint(config: &dyn ConfigProvider) -> Result<Fingerprint> {
    let mut fp = FingerprintBuilder::new()
        .json("board", config.board())?
        .field("release", &config.distribution().release)
        .json("variant", config.variant())?
        .json("users", config.users())?
        .json("options", config.options())?;
    if let Some(overlay) = &config.options().overlay {
        fp = fp.tree("overlay", overlay)?;
    }
    Ok(fp.finish())
}

/// Stages whose output depends only on upstream stages.
fn constant_fingerprint(
    stage: &'static str,
) -> impl Fn(&dyn ConfigProvider) -> Result<Fingerprint> {
    move |_| Ok(FingerprintBuilder::new().field("stage", stage).finish())
}

fn build(ctx: &mut StageContext<'_>) -> Result<ArtifactRef> {
    let config = ctx.config();
    let layout = ctx.layout();
    let shell = ctx.shell();

    let work_dir = layout.prepare_work_dir()?;
    {
        let dir = work_dir.clone();
        ctx.on_failure("remove bootstrap directory", move || {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        });
    }

    let board = config.board();
    let distribution = config.distribution();
    step("Running qemu-debootstrap", || {
        Cmd::new("qemu-debootstrap")
            .arg(format!("--arch={}", board.arch))
            .arg(format!("--components={}", distribution.components.join(",")))
            .arg(&distribution.release)
            .arg_path(&work_dir)
            .arg(&distribution.repository)
            .error_msg("qemu-debootstrap failed")
            .run_with(shell)?;
        Ok(())
    })?;

    let archive = layout.archive(BUILD);
    let codec = ctx.archive();
    step("Creating archive", || codec.compress(&work_dir, &archive))?;

    Ok(ArtifactRef::new(archive))
}

fn configure(ctx: &mut StageContext<'_>) -> Result<ArtifactRef> {
    let config = ctx.config();
    let layout = ctx.layout();
    let shell = ctx.shell();
    let options = config.options();
    let root: PathBuf = layout.work_dir();

    let codec = ctx.archive();
    step("Extracting archive", || {
        codec.extract(&layout.archive(BUILD), &root)
    })?;

    setup::block_daemons(&root)?;
    {
        let root = root.clone();
        ctx.defer("allow daemons to start", move || setup::unblock_daemons(&root));
    }

    if options.apt_cacher {
        step("Enabling APT proxy", || {
            service::enable_apt_proxy(&root, &options.apt_cacher_host, options.apt_cacher_port)
        })?;
        let root = root.clone();
        ctx.defer("disable APT proxy", move || service::disable_apt_proxy(&root));
    }

    step("Configuring the APT repositories", || {
        setup::apt(shell, &root, config.distribution())
    })?;
    {
        let root = root.clone();
        let shell = ctx.shell_handle();
        ctx.defer("clean APT caches", move || setup::apt_clean(shell.as_ref(), &root));
    }

    // Locales and console come first so package scripts see them.
    step("Configuring locales", || {
        setup::locales(shell, &root, &options.locale)
    })?;
    step("Configuring console", || {
        setup::console(
            shell,
            &root,
            &options.keyboard_keymap,
            &options.keyboard_layout,
        )
    })?;

    step("Installing packages", || {
        setup::install(shell, &root, &config.variant().packages)
    })?;
    step("Generating boot files", || setup::boot(&root))?;
    step("Installing kernel", || {
        setup::install(shell, &root, std::slice::from_ref(&options.kernel_package))
    })?;

    let hostname = config.hostname();
    step(&format!("Configuring hostname: '{}'", hostname), || {
        setup::hostname(&root, hostname)
    })?;

    for user in config.users() {
        step(&format!("Adding user: '{}'", user.name), || {
            setup::user(shell, &root, user)
        })?;
    }

    step(
        &format!("Configuring timezone: '{}'", options.timezone),
        || setup::timezone(&root, &options.timezone),
    )?;

    step("Configuring services", || {
        for name in DISABLED_SERVICES {
            service::set_enabled(shell, &root, name, false)?;
        }
        service::enable_getty(&root, &config.board().console)?;
        service::enable_resize_rootfs(&root)?;
        service::set_enabled(shell, &root, "ssh", options.ssh)
    })?;

    if let Some(overlay) = &options.overlay {
        step(&format!("Copying overlay {}", overlay.display()), || {
            let copied = copy_tree(overlay, &root)?;
            tracing::debug!("  {} file(s) from overlay", copied);
            Ok(())
        })?;
    }

    Ok(ArtifactRef::new(root))
}

fn cleanup(ctx: &mut StageContext<'_>) -> Result<ArtifactRef> {
    let mut pending = ctx.take_phase_cleanup();
    if pending.is_empty() {
        tracing::info!("  Nothing to clean up");
    } else {
        tracing::info!("  Undoing {} build-time change(s)", pending.len());
        let failed = pending.unwind();
        if failed > 0 {
            tracing::warn!("  {} cleanup action(s) failed", failed);
        }
    }
    Ok(ArtifactRef::new(ctx.work_dir()))
}

fn export(ctx: &mut StageContext<'_>) -> Result<ArtifactRef> {
    let work_dir = ctx.work_dir();
    let archive = ctx.layout().archive(EXPORT);
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let codec = ctx.archive();
    step(&format!("Creating archive: {}", name), || {
        codec.compress(&work_dir, &archive)
    })?;
    Ok(ArtifactRef::new(archive))
}
