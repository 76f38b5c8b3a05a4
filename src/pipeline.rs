//! The staged build driver.
//!
//! Runs stages in declared order. A stage is skipped when its stamp matches
//! its chained fingerprint and its outputs still exist. An executed stage is
//! stamped only after it returns successfully and its outputs exist; a
//! failed stage has its cleanup stack unwound and halts the run.
//!
//! Every stamp carries a run id that changes each time the stage executes.
//! The next stage chains that id into its fingerprint, so re-executing a
//! stage leaves every later stamp stale.

use std::collections::HashSet;
use std::time::Duration;

use crate::cache::{StageCache, StampStatus};
use crate::cleanup::CleanupStack;
use crate::config::ConfigProvider;
use crate::error::PipelineError;
use crate::fingerprint::Fingerprint;
use crate::layout::Layout;
use crate::stage::{Stage, StageContext, Toolbox};
use crate::timing::Timer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRun {
    Executed(Duration),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: String,
    pub run: StageRun,
}

/// What a pipeline run did, stage by stage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|o| matches!(o.run, StageRun::Executed(_)))
            .map(|o| o.stage.as_str())
            .collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|o| o.run == StageRun::Skipped)
            .map(|o| o.stage.as_str())
            .collect()
    }
}

/// Previous stage's chained fingerprint and the run id in its stamp.
type Upstream = (Fingerprint, Option<String>);

pub struct Pipeline<'a> {
    config: &'a dyn ConfigProvider,
    layout: Layout,
    cache: StageCache,
    tools: Toolbox,
    /// Cross-stage cleanup accumulated from stages that ran in this process.
    phase: CleanupStack,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a dyn ConfigProvider, layout: Layout, tools: Toolbox) -> Self {
        let cache = StageCache::new(layout.stamp_dir());
        Self {
            config,
            layout,
            cache,
            tools,
            phase: CleanupStack::new(),
        }
    }

    pub fn cache(&self) -> &StageCache {
        &self.cache
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Pending cross-stage cleanup actions, in registration order.
    pub fn pending_cleanup(&self) -> Vec<&str> {
        self.phase.labels()
    }

    /// Drop a stage's stamp so the next run executes it.
    pub fn force(&self, stage: &str) -> Result<(), PipelineError> {
        tracing::debug!("Forcing '{}'", stage);
        self.cache.invalidate(stage)?;
        Ok(())
    }

    /// Replay the cross-stage cleanup list in reverse order.
    ///
    /// Returns the number of actions that failed.
    pub fn cleanup(&mut self) -> usize {
        if !self.phase.is_empty() {
            tracing::info!("Running {} pending cleanup action(s)", self.phase.len());
        }
        self.phase.unwind()
    }

    fn validate(stages: &[Stage]) -> Result<(), PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Definition("no stages".to_string()));
        }
        let mut seen = HashSet::new();
        for stage in stages {
            let name = stage.name();
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(PipelineError::Definition(format!(
                    "invalid stage name '{}'",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(PipelineError::Definition(format!(
                    "duplicate stage name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Each stage's own fingerprint, in order.
    ///
    /// Computed for every stage before anything runs, so an unreadable input
    /// fails the run up front.
    fn own_fingerprints(&self, stages: &[Stage]) -> Result<Vec<Fingerprint>, PipelineError> {
        stages
            .iter()
            .map(|stage| {
                stage
                    .fingerprint(self.config)
                    .map_err(|source| PipelineError::Fingerprint {
                        stage: stage.name().to_string(),
                        source,
                    })
            })
            .collect()
    }

    /// Stamp status of every stage without running anything.
    ///
    /// Each stage is checked against its predecessor's current stamp. A
    /// stage reported `Valid` here still becomes `Stale` once anything
    /// before it executes.
    pub fn status(&self, stages: &[Stage]) -> Result<Vec<(String, StampStatus)>, PipelineError> {
        Self::validate(stages)?;
        let own = self.own_fingerprints(stages)?;

        let mut out = Vec::with_capacity(stages.len());
        let mut upstream: Option<Upstream> = None;
        for (stage, own) in stages.iter().zip(&own) {
            let fingerprint = Self::chained(own, upstream.as_ref());
            out.push((stage.name().to_string(), self.cache.status(stage.name(), &fingerprint)));
            let run_id = self.cache.read(stage.name()).map(|r| r.run_id);
            upstream = Some((fingerprint, run_id));
        }
        Ok(out)
    }

    fn chained(own: &Fingerprint, upstream: Option<&Upstream>) -> Fingerprint {
        match upstream {
            Some((fingerprint, run_id)) => own.chain(Some(fingerprint), run_id.as_deref()),
            None => own.chain(None, None),
        }
    }

    /// Run stages in order, skipping the ones with a valid stamp.
    ///
    /// A stage's chained fingerprint includes the run id its predecessor
    /// stamped, so executing a stage makes every later stamp stale.
    ///
    /// On the first failure the failing stage's cleanup stack is unwound,
    /// any cross-stage cleanup accumulated so far is replayed, and the error
    /// is returned. Stages completed before the failure keep their stamps.
    pub fn run(&mut self, stages: &[Stage]) -> Result<RunReport, PipelineError> {
        Self::validate(stages)?;
        let own = self.own_fingerprints(stages)?;

        let mut report = RunReport::default();
        let mut upstream: Option<Upstream> = None;

        for (stage, own) in stages.iter().zip(&own) {
            let fingerprint = Self::chained(own, upstream.as_ref());

            if !stage.should_run(&self.cache, &fingerprint) {
                if let Some(record) = self.cache.read(stage.name()) {
                    tracing::info!("[SKIP] {} (using cached result)", stage.name());
                    report.stages.push(StageOutcome {
                        stage: stage.name().to_string(),
                        run: StageRun::Skipped,
                    });
                    upstream = Some((fingerprint, Some(record.run_id)));
                    continue;
                }
            }

            match self.execute(stage, &fingerprint) {
                Ok((elapsed, run_id)) => {
                    report.stages.push(StageOutcome {
                        stage: stage.name().to_string(),
                        run: StageRun::Executed(elapsed),
                    });
                    upstream = Some((fingerprint, Some(run_id)));
                }
                Err(e) => {
                    self.cleanup();
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Execute one stage and stamp it. Returns the elapsed time and the
    /// new run id.
    fn execute(
        &mut self,
        stage: &Stage,
        fingerprint: &Fingerprint,
    ) -> Result<(Duration, String), PipelineError> {
        let name = stage.name();
        tracing::info!("==> {}", name);

        // No stamp may survive across a partial re-run.
        self.cache.invalidate(name)?;

        let timer = Timer::start(name);
        let mut cleanup = CleanupStack::new();

        let result = {
            let mut ctx = StageContext::new(
                name,
                self.config,
                &self.layout,
                &self.tools,
                &mut cleanup,
                &mut self.phase,
            );
            stage.execute(&mut ctx)
        };

        let artifacts = match result {
            Ok(artifacts) => artifacts,
            Err(source) => {
                tracing::error!("Stage '{}' failed: {:#}", name, source);
                Self::rollback(name, &mut cleanup);
                return Err(PipelineError::Stage {
                    stage: name.to_string(),
                    source,
                });
            }
        };

        if let Some(missing) = artifacts.first_missing() {
            let path = missing.to_path_buf();
            tracing::error!("Stage '{}' did not produce {}", name, path.display());
            Self::rollback(name, &mut cleanup);
            return Err(PipelineError::MissingArtifact {
                stage: name.to_string(),
                path,
            });
        }

        let record = match self.cache.record(name, fingerprint, &artifacts) {
            Ok(record) => record,
            Err(e) => {
                Self::rollback(name, &mut cleanup);
                return Err(e.into());
            }
        };

        let deferred = cleanup.into_phase();
        if !deferred.is_empty() {
            tracing::debug!(
                "'{}' left {} action(s) for the cleanup stage",
                name,
                deferred.len()
            );
        }
        self.phase.extend(deferred);

        Ok((timer.finish(), record.run_id))
    }

    fn rollback(stage: &str, cleanup: &mut CleanupStack) {
        if cleanup.is_empty() {
            return;
        }
        tracing::info!("Rolling back '{}' ({} action(s))", stage, cleanup.len());
        let failed = cleanup.unwind();
        if failed > 0 {
            tracing::warn!("{} cleanup action(s) for '{}' failed", failed, stage);
        }
    }
}
