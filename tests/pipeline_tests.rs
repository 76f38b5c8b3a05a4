//! Pipeline behavior tests.
//!
//! These use synthetic stages whose inputs, failures and cleanup actions are
//! driven from the test body, so every property of the driver can be checked
//! without running real tools.

mod helpers;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::rc::Rc;

use anyhow::bail;
use boardfs::config::ConfigProvider;
use boardfs::{
    ArtifactRef, FingerprintBuilder, PipelineError, Stage, StageContext, StageRun, StampStatus,
};
use helpers::{entries, log, sample_config, Log, TestEnv};

/// Knobs shared by every synthetic stage of a test.
#[derive(Clone, Default)]
struct Probe {
    log: Log,
    inputs: Rc<RefCell<HashMap<&'static str, String>>>,
    failing: Rc<RefCell<HashSet<&'static str>>>,
}

impl Probe {
    fn new() -> Self {
        Self {
            log: log(),
            ..Default::default()
        }
    }

    fn set_input(&self, stage: &'static str, value: &str) {
        self.inputs.borrow_mut().insert(stage, value.to_string());
    }

    fn fail(&self, stage: &'static str) {
        self.failing.borrow_mut().insert(stage);
    }

    fn heal(&self, stage: &'static str) {
        self.failing.borrow_mut().remove(stage);
    }

    fn runs(&self) -> Vec<String> {
        entries(&self.log)
            .into_iter()
            .filter(|e| e.starts_with("run:"))
            .collect()
    }

    /// A stage that writes `<output>/<name>.out` and returns it.
    fn stage(&self, name: &'static str) -> Stage {
        self.stage_with(name, |_, _| Ok(()))
    }

    /// Like [`Probe::stage`], with `register` called before the stage's
    /// failure point so it can push cleanup actions.
    fn stage_with<R>(&self, name: &'static str, register: R) -> Stage
    where
        R: Fn(&mut StageContext<'_>, &Log) -> anyhow::Result<()> + 'static,
    {
        let inputs = self.inputs.clone();
        let failing = self.failing.clone();
        let log = self.log.clone();
        Stage::new(
            name,
            move |_: &dyn ConfigProvider| {
                let input = inputs.borrow().get(name).cloned().unwrap_or_default();
                Ok(FingerprintBuilder::new().field("input", input).finish())
            },
            move |ctx: &mut StageContext<'_>| {
                log.borrow_mut().push(format!("run:{}", name));
                register(ctx, &log)?;

                let out = ctx.layout().output().join(format!("{}.out", name));
                fs::create_dir_all(ctx.layout().output())?;
                fs::write(&out, name)?;

                if failing.borrow().contains(name) {
                    bail!("{} exploded", name);
                }
                Ok(ArtifactRef::new(out))
            },
        )
    }
}

/// Cleanup action that records its label when fired.
fn note(log: &Log, label: &str) -> impl FnOnce() -> anyhow::Result<()> + 'static {
    let log = log.clone();
    let label = label.to_string();
    move || {
        log.borrow_mut().push(label);
        Ok(())
    }
}

fn fired(log: &Log) -> Vec<String> {
    entries(log)
        .into_iter()
        .filter(|e| !e.starts_with("run:"))
        .collect()
}

// =============================================================================
// Caching
// =============================================================================

#[test]
fn test_second_run_skips_everything() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b"), probe.stage("c")];

    let first = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(first.executed(), ["a", "b", "c"]);

    let second = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(second.skipped(), ["a", "b", "c"]);
    assert!(second.executed().is_empty());
    assert_eq!(probe.runs(), ["run:a", "run:b", "run:c"]);
}

#[test]
fn test_changed_input_reruns_stage_and_everything_after() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b"), probe.stage("c")];

    env.pipeline(&config).run(&stages).unwrap();
    probe.set_input("b", "changed");

    let report = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(report.skipped(), ["a"]);
    assert_eq!(report.executed(), ["b", "c"]);
}

#[test]
fn test_changed_input_of_last_stage_reruns_only_it() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b"), probe.stage("c")];

    env.pipeline(&config).run(&stages).unwrap();
    probe.set_input("c", "changed");

    let report = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(report.skipped(), ["a", "b"]);
    assert_eq!(report.executed(), ["c"]);
}

#[test]
fn test_upstream_change_invalidates_downstream_stamp() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b")];

    let mut pipeline = env.pipeline(&config);
    pipeline.run(&stages).unwrap();
    probe.set_input("a", "changed");

    let status = pipeline.status(&stages).unwrap();
    assert_eq!(status[0].1, StampStatus::Stale);
    // b's own inputs didn't change, but its effective fingerprint did
    assert_eq!(status[1].1, StampStatus::Stale);
}

#[test]
fn test_deleted_artifact_forces_rerun() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b")];

    env.pipeline(&config).run(&stages).unwrap();
    fs::remove_file(env.output.join("b.out")).unwrap();

    let report = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(report.skipped(), ["a"]);
    assert_eq!(report.executed(), ["b"]);
}

#[test]
fn test_rerun_upstream_makes_downstream_stale() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b"), probe.stage("c")];

    env.pipeline(&config).run(&stages).unwrap();
    fs::remove_file(env.output.join("a.out")).unwrap();

    let mut pipeline = env.pipeline(&config);
    let status = pipeline.status(&stages).unwrap();
    assert_eq!(
        status[0].1,
        StampStatus::ArtifactMissing(env.output.join("a.out"))
    );
    // Downstream stamps are intact until a actually executes again
    assert_eq!(status[1].1, StampStatus::Valid);
    assert_eq!(status[2].1, StampStatus::Valid);

    let report = pipeline.run(&stages[..1]).unwrap();
    assert_eq!(report.executed(), ["a"]);

    let status = pipeline.status(&stages).unwrap();
    assert_eq!(status[0].1, StampStatus::Valid);
    assert_eq!(status[1].1, StampStatus::Stale);
    assert_eq!(status[2].1, StampStatus::Stale);

    let report = pipeline.run(&stages).unwrap();
    assert_eq!(report.skipped(), ["a"]);
    assert_eq!(report.executed(), ["b", "c"]);
    assert_eq!(probe.runs(), ["run:a", "run:b", "run:c", "run:a", "run:b", "run:c"]);
}

#[test]
fn test_valid_stamps_are_never_executed() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b"), probe.stage("c")];

    env.pipeline(&config).run(&stages).unwrap();
    fs::remove_file(env.output.join("c.out")).unwrap();

    let pipeline = env.pipeline(&config);
    let before = pipeline.status(&stages).unwrap();
    let report = env.pipeline(&config).run(&stages).unwrap();

    for ((name, status), outcome) in before.iter().zip(&report.stages) {
        assert_eq!(name, &outcome.stage);
        if status.is_valid() {
            assert_eq!(outcome.run, StageRun::Skipped, "{} was valid", name);
        }
    }
    assert_eq!(report.executed(), ["c"]);
}

#[test]
fn test_corrupt_stamp_is_a_miss() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a")];

    let mut pipeline = env.pipeline(&config);
    pipeline.run(&stages).unwrap();
    fs::write(pipeline.cache().stamp_path("a"), "{ not json").unwrap();

    let report = pipeline.run(&stages).unwrap();
    assert_eq!(report.executed(), ["a"]);
    assert!(pipeline.cache().read("a").is_some());
}

#[test]
fn test_leftover_temp_stamp_never_validates() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a")];

    let mut pipeline = env.pipeline(&config);
    pipeline.run(&stages).unwrap();

    // Crash between writing the temp file and renaming it
    let stamp = pipeline.cache().stamp_path("a");
    let temp = stamp.with_extension("json.tmp");
    fs::rename(&stamp, &temp).unwrap();

    let report = pipeline.run(&stages).unwrap();
    assert_eq!(report.executed(), ["a"]);
    assert!(!temp.exists());
}

#[test]
fn test_force_reruns_a_valid_stage() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b")];

    env.pipeline(&config).run(&stages).unwrap();

    let mut pipeline = env.pipeline(&config);
    pipeline.force("b").unwrap();
    let report = pipeline.run(&stages).unwrap();
    assert_eq!(report.skipped(), ["a"]);
    assert_eq!(report.executed(), ["b"]);
}

#[test]
fn test_stage_without_outputs_is_cached() {
    let env = TestEnv::new();
    let config = sample_config();
    let log = log();
    let runs = log.clone();
    let stages = vec![Stage::new(
        "noop",
        |_: &dyn ConfigProvider| Ok(FingerprintBuilder::new().finish()),
        move |_: &mut StageContext<'_>| {
            runs.borrow_mut().push("noop".to_string());
            Ok(ArtifactRef::none())
        },
    )];

    env.pipeline(&config).run(&stages).unwrap();
    let report = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(report.stages[0].run, StageRun::Skipped);
    assert_eq!(entries(&log), ["noop"]);
}

// =============================================================================
// Failure and rollback
// =============================================================================

#[test]
fn test_failure_halts_and_keeps_earlier_stamps() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b"), probe.stage("c")];
    probe.fail("b");

    let mut pipeline = env.pipeline(&config);
    let err = pipeline.run(&stages).unwrap_err();
    assert_eq!(err.stage(), Some("b"));
    assert!(format!("{}", err).contains("b exploded"));
    assert_eq!(probe.runs(), ["run:a", "run:b"]);

    assert!(pipeline.cache().read("a").is_some());
    assert!(pipeline.cache().read("b").is_none());
    assert!(pipeline.cache().read("c").is_none());

    // Resume after the fix: a is not repeated
    probe.heal("b");
    let report = env.pipeline(&config).run(&stages).unwrap();
    assert_eq!(report.skipped(), ["a"]);
    assert_eq!(report.executed(), ["b", "c"]);
}

#[test]
fn test_failed_rerun_drops_old_stamp() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("b")];

    env.pipeline(&config).run(&stages).unwrap();

    // a reruns for a missing output, which leaves b's stamp stale
    fs::remove_file(env.output.join("a.out")).unwrap();
    probe.fail("b");
    let mut pipeline = env.pipeline(&config);
    assert!(pipeline.run(&stages).is_err());

    // b's old stamp matched its inputs, but the tree it describes is gone
    assert!(pipeline.cache().read("b").is_none());
    assert!(pipeline.cache().read("a").is_some());
}

#[test]
fn test_rollback_runs_in_reverse_order() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage_with("a", |ctx, log| {
        ctx.on_failure("a1", note(log, "a1"));
        ctx.on_failure("a2", note(log, "a2"));
        ctx.on_failure("a3", note(log, "a3"));
        Ok(())
    })];
    probe.fail("a");

    assert!(env.pipeline(&config).run(&stages).is_err());
    assert_eq!(fired(&probe.log), ["a3", "a2", "a1"]);
}

#[test]
fn test_rollback_is_best_effort() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage_with("a", |ctx, log| {
        ctx.on_failure("a1", note(log, "a1"));
        ctx.on_failure("a2", || bail!("umount: target is busy"));
        ctx.on_failure("a3", note(log, "a3"));
        Ok(())
    })];
    probe.fail("a");

    let err = env.pipeline(&config).run(&stages).unwrap_err();
    // The stage's own error is reported, not the rollback failure
    assert!(format!("{}", err).contains("a exploded"));
    assert_eq!(fired(&probe.log), ["a3", "a1"]);
}

#[test]
fn test_success_discards_stage_rollback() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage_with("a", |ctx, log| {
        ctx.on_failure("a1", note(log, "a1"));
        Ok(())
    })];

    let mut pipeline = env.pipeline(&config);
    pipeline.run(&stages).unwrap();
    assert_eq!(pipeline.cleanup(), 0);
    assert!(fired(&probe.log).is_empty());
}

#[test]
fn test_missing_artifact_fails_stage() {
    let env = TestEnv::new();
    let config = sample_config();
    let log = log();
    let rollback = log.clone();
    let stages = vec![Stage::new(
        "ghost",
        |_: &dyn ConfigProvider| Ok(FingerprintBuilder::new().finish()),
        move |ctx: &mut StageContext<'_>| {
            ctx.on_failure("undo", note(&rollback, "undo"));
            Ok(ArtifactRef::new(ctx.layout().output().join("never-written")))
        },
    )];

    let mut pipeline = env.pipeline(&config);
    match pipeline.run(&stages) {
        Err(PipelineError::MissingArtifact { stage, path }) => {
            assert_eq!(stage, "ghost");
            assert!(path.ends_with("never-written"));
        }
        other => panic!("expected MissingArtifact, got {:?}", other),
    }
    assert_eq!(entries(&log), ["undo"]);
    assert!(pipeline.cache().read("ghost").is_none());
}

// =============================================================================
// Cross-stage cleanup
// =============================================================================

/// configure defers an undo action; cleanup replays the pending list.
fn phased(probe: &Probe) -> Vec<Stage> {
    vec![
        probe.stage("build"),
        probe.stage_with("configure", |ctx, log| {
            ctx.defer("disable proxy", note(log, "disable proxy"));
            ctx.defer("apt clean", note(log, "apt clean"));
            Ok(())
        }),
        probe.stage_with("cleanup", |ctx, _| {
            ctx.take_phase_cleanup().unwind();
            Ok(())
        }),
        probe.stage("export"),
    ]
}

#[test]
fn test_deferred_actions_fire_in_cleanup_stage_once() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = phased(&probe);

    let mut pipeline = env.pipeline(&config);
    pipeline.run(&stages).unwrap();
    assert_eq!(
        entries(&probe.log),
        [
            "run:build",
            "run:configure",
            "run:cleanup",
            "apt clean",
            "disable proxy",
            "run:export"
        ]
    );

    assert!(pipeline.pending_cleanup().is_empty());
    assert_eq!(pipeline.cleanup(), 0);
    assert_eq!(fired(&probe.log), ["apt clean", "disable proxy"]);
}

#[test]
fn test_stopping_before_cleanup_leaves_actions_pending() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let mut stages = phased(&probe);
    stages.truncate(2);

    let mut pipeline = env.pipeline(&config);
    pipeline.run(&stages).unwrap();
    assert_eq!(pipeline.pending_cleanup(), ["disable proxy", "apt clean"]);
    assert!(fired(&probe.log).is_empty());

    assert_eq!(pipeline.cleanup(), 0);
    assert_eq!(fired(&probe.log), ["apt clean", "disable proxy"]);
}

#[test]
fn test_failing_stage_fires_its_deferred_actions_once() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = phased(&probe);
    probe.fail("configure");

    let mut pipeline = env.pipeline(&config);
    let err = pipeline.run(&stages).unwrap_err();
    assert_eq!(err.stage(), Some("configure"));
    assert_eq!(fired(&probe.log), ["apt clean", "disable proxy"]);

    // Nothing left to replay
    assert_eq!(pipeline.cleanup(), 0);
    assert_eq!(fired(&probe.log).len(), 2);
}

#[test]
fn test_later_failure_replays_accumulated_actions() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let mut stages = phased(&probe);
    stages.remove(2);
    probe.fail("export");

    let mut pipeline = env.pipeline(&config);
    let err = pipeline.run(&stages).unwrap_err();
    assert_eq!(err.stage(), Some("export"));
    assert_eq!(fired(&probe.log), ["apt clean", "disable proxy"]);
    assert!(pipeline.pending_cleanup().is_empty());
}

#[test]
fn test_skipped_stage_contributes_no_cleanup() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let mut stages = phased(&probe);
    stages.truncate(2);

    let mut first = env.pipeline(&config);
    first.run(&stages).unwrap();
    first.cleanup();
    probe.log.borrow_mut().clear();

    let mut second = env.pipeline(&config);
    let report = second.run(&stages).unwrap();
    assert_eq!(report.skipped(), ["build", "configure"]);
    assert!(second.pending_cleanup().is_empty());
    assert!(entries(&probe.log).is_empty());
}

// =============================================================================
// Definition errors
// =============================================================================

#[test]
fn test_duplicate_stage_names_rejected_before_running() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![probe.stage("a"), probe.stage("a")];

    let err = env.pipeline(&config).run(&stages).unwrap_err();
    assert!(matches!(err, PipelineError::Definition(_)));
    assert!(probe.runs().is_empty());
}

#[test]
fn test_invalid_stage_names_rejected() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();

    for name in ["", "../escape", ".hidden"] {
        let stages = vec![Stage::new(
            name,
            |_: &dyn ConfigProvider| Ok(FingerprintBuilder::new().finish()),
            |_: &mut StageContext<'_>| Ok(ArtifactRef::none()),
        )];
        let err = env.pipeline(&config).run(&stages).unwrap_err();
        assert!(matches!(err, PipelineError::Definition(_)), "{:?}", name);
    }
    assert!(env.pipeline(&config).run(&[]).is_err());
    assert!(probe.runs().is_empty());
}

#[test]
fn test_fingerprint_error_runs_nothing() {
    let env = TestEnv::new();
    let config = sample_config();
    let probe = Probe::new();
    let stages = vec![
        probe.stage("a"),
        Stage::new(
            "b",
            |_: &dyn ConfigProvider| bail!("overlay directory missing"),
            |_: &mut StageContext<'_>| Ok(ArtifactRef::none()),
        ),
    ];

    let err = env.pipeline(&config).run(&stages).unwrap_err();
    assert!(matches!(err, PipelineError::Fingerprint { .. }));
    assert_eq!(err.stage(), Some("b"));
    assert!(probe.runs().is_empty());
}
