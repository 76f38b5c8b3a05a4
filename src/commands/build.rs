//! Build command - runs the stage pipeline.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;

use boardfs::archive::TarGz;
use boardfs::config::BuildConfig;
use boardfs::lock::BuildLock;
use boardfs::pipeline::{Pipeline, StageRun};
use boardfs::process::HostShell;
use boardfs::rootfs;
use boardfs::timing::{format_duration, Timer};
use boardfs::{Layout, Toolbox};

pub struct BuildArgs {
    pub config: PathBuf,
    pub output: PathBuf,
    /// Last stage to run. All stages when unset.
    pub stage: Option<String>,
    /// Stages whose stamps are dropped before the run.
    pub force: Vec<String>,
}

/// Execute the build command.
pub fn cmd_build(args: BuildArgs) -> Result<()> {
    let config = BuildConfig::load(&args.config)?;
    let layout = Layout::for_config(&args.output, &config);

    let all = rootfs::stages(&config.variant.name)?;
    for name in &args.force {
        if !all.iter().any(|s| s.name() == name) {
            bail!("Cannot force unknown stage '{}'", name);
        }
    }
    let stages = rootfs::select_until(all, args.stage.as_deref())?;

    let command = match &args.stage {
        Some(stage) => format!("build {}", stage),
        None => "build".to_string(),
    };
    let _lock = BuildLock::acquire(&layout.lock_file(), &command)?;

    println!(
        "Building {} ({} stage(s)) in {}",
        layout.name(),
        stages.len(),
        layout.output().display()
    );

    let tools = Toolbox::new(Arc::new(HostShell), Arc::new(TarGz::default()));
    let mut pipeline = Pipeline::new(&config, layout, tools);
    for name in &args.force {
        pipeline.force(name)?;
    }

    let timer = Timer::start("Total build time");
    let result = pipeline.run(&stages);

    // Stopping before `cleanup` still has to undo build-time changes.
    let failed = pipeline.cleanup();
    if failed > 0 {
        tracing::warn!("{} cleanup action(s) failed", failed);
    }

    match result {
        Ok(report) => {
            println!();
            for outcome in &report.stages {
                match &outcome.run {
                    StageRun::Executed(elapsed) => {
                        println!("  [DONE] {} ({})", outcome.stage, format_duration(*elapsed))
                    }
                    StageRun::Skipped => println!("  [SKIP] {}", outcome.stage),
                }
            }
            println!(
                "\n{} stage(s) run, {} cached",
                report.executed().len(),
                report.skipped().len()
            );
            timer.finish();
            Ok(())
        }
        Err(e) => {
            let stage = e.stage().unwrap_or("pipeline");
            eprintln!("\nBuild failed at '{}'", stage);
            Err(e.into())
        }
    }
}
