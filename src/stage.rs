//! Stage definitions.
//!
//! A stage is plain data: a name, a function computing its fingerprint from
//! the configuration, and a function doing the work. The pipeline decides
//! whether and when the work function is called.

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::ArchiveCodec;
use crate::cache::StageCache;
use crate::cleanup::{CleanupAction, CleanupStack};
use crate::config::ConfigProvider;
use crate::fingerprint::Fingerprint;
use crate::layout::Layout;
use crate::process::ShellRunner;

/// Outputs a stage produced. Recorded in the stamp and checked for
/// existence before the stage is considered cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactRef {
    paths: Vec<PathBuf>,
}

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
        }
    }

    /// A stage with no file output.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// First recorded path that doesn't exist.
    pub fn first_missing(&self) -> Option<&Path> {
        self.paths.iter().find(|p| !p.exists()).map(PathBuf::as_path)
    }
}

/// External tools a stage may call.
#[derive(Clone)]
pub struct Toolbox {
    pub shell: Arc<dyn ShellRunner>,
    pub archive: Arc<dyn ArchiveCodec>,
}

impl Toolbox {
    pub fn new(shell: Arc<dyn ShellRunner>, archive: Arc<dyn ArchiveCodec>) -> Self {
        Self { shell, archive }
    }
}

/// Everything a running stage can see and touch.
pub struct StageContext<'a> {
    stage: &'a str,
    config: &'a dyn ConfigProvider,
    layout: &'a Layout,
    tools: &'a Toolbox,
    cleanup: &'a mut CleanupStack,
    phase: &'a mut CleanupStack,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        stage: &'a str,
        config: &'a dyn ConfigProvider,
        layout: &'a Layout,
        tools: &'a Toolbox,
        cleanup: &'a mut CleanupStack,
        phase: &'a mut CleanupStack,
    ) -> Self {
        Self {
            stage,
            config,
            layout,
            tools,
            cleanup,
            phase,
        }
    }

    pub fn stage(&self) -> &'a str {
        self.stage
    }

    pub fn config(&self) -> &'a dyn ConfigProvider {
        self.config
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    pub fn work_dir(&self) -> PathBuf {
        self.layout.work_dir()
    }

    pub fn shell(&self) -> &'a dyn ShellRunner {
        self.tools.shell.as_ref()
    }

    pub fn archive(&self) -> &'a dyn ArchiveCodec {
        self.tools.archive.as_ref()
    }

    /// Shared handle to the shell, for use inside cleanup actions.
    pub fn shell_handle(&self) -> Arc<dyn ShellRunner> {
        Arc::clone(&self.tools.shell)
    }

    /// Register an action that runs only if this stage fails.
    pub fn on_failure(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> Result<()> + 'static,
    ) {
        self.cleanup.push(CleanupAction::new(label, action));
    }

    /// Register an action that runs if this stage fails, or otherwise when
    /// the phase cleanup stage runs.
    pub fn defer(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> Result<()> + 'static,
    ) {
        self.cleanup.push(CleanupAction::deferred(label, action));
    }

    /// Take every phase action accumulated by earlier stages of this run.
    pub fn take_phase_cleanup(&mut self) -> CleanupStack {
        self.phase.take()
    }
}

type FingerprintFn = dyn Fn(&dyn ConfigProvider) -> Result<Fingerprint>;
type ExecuteFn = dyn Fn(&mut StageContext<'_>) -> Result<ArtifactRef>;

/// One named, ordered unit of a pipeline.
pub struct Stage {
    name: String,
    fingerprint: Box<FingerprintFn>,
    execute: Box<ExecuteFn>,
}

impl Stage {
    pub fn new<F, E>(name: impl Into<String>, fingerprint: F, execute: E) -> Self
    where
        F: Fn(&dyn ConfigProvider) -> Result<Fingerprint> + 'static,
        E: Fn(&mut StageContext<'_>) -> Result<ArtifactRef> + 'static,
    {
        Self {
            name: name.into(),
            fingerprint: Box::new(fingerprint),
            execute: Box::new(execute),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fingerprint of this stage's own inputs.
    pub fn fingerprint(&self, config: &dyn ConfigProvider) -> Result<Fingerprint> {
        (self.fingerprint)(config)
    }

    /// True unless the cache holds a valid stamp for `fingerprint`.
    pub fn should_run(&self, cache: &StageCache, fingerprint: &Fingerprint) -> bool {
        !cache.is_valid(&self.name, fingerprint)
    }

    pub fn execute(&self, ctx: &mut StageContext<'_>) -> Result<ArtifactRef> {
        (self.execute)(ctx)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
