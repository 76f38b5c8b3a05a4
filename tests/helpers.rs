//! Shared test utilities for boardfs tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use boardfs::archive::TarGz;
use boardfs::config::{Board, BuildConfig, BuildOptions, Distribution, User, Variant};
use boardfs::process::{CommandResult, Invocation, ShellRunner};
use boardfs::{Layout, Pipeline, Toolbox};
use tempfile::TempDir;

/// Shell that records every invocation instead of running it.
///
/// `qemu-debootstrap` gets a tiny fake rootfs written into its target
/// directory so later stages have something to archive and configure.
#[derive(Default)]
pub struct RecordingShell {
    calls: Mutex<Vec<Invocation>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every command whose command line contains `pattern` exit 1.
    pub fn fail_on(&self, pattern: &str) {
        *self.fail_on.lock().unwrap() = Some(pattern.to_string());
    }

    pub fn succeed(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.invocations().iter().map(|i| i.command_line()).collect()
    }

    /// Number of recorded commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl ShellRunner for RecordingShell {
    fn run(&self, invocation: &Invocation) -> Result<CommandResult> {
        self.calls.lock().unwrap().push(invocation.clone());

        if let Some(pattern) = self.fail_on.lock().unwrap().as_deref() {
            if invocation.command_line().contains(pattern) {
                // Exit status 1, honoring allow_fail like the host shell
                return invocation.check(CommandResult {
                    status: ExitStatus::from_raw(1 << 8),
                    stdout: String::new(),
                    stderr: "simulated failure".to_string(),
                });
            }
        }

        if invocation.program == "qemu-debootstrap" {
            // qemu-debootstrap --arch=.. --components=.. <release> <dir> <mirror>
            if let Some(dir) = invocation.args.get(3) {
                create_fake_rootfs(Path::new(dir));
            }
        }

        Ok(CommandResult {
            status: ExitStatus::from_raw(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Minimal tree standing in for a bootstrapped Debian system.
pub fn create_fake_rootfs(root: &Path) {
    for (path, content) in [
        ("etc/os-release", "ID=debian\n"),
        ("etc/apt/sources.list", ""),
        ("usr/share/zoneinfo/UTC", "TZif"),
        ("usr/share/zoneinfo/Europe/Sofia", "TZif"),
        ("var/lib/apt/lists/deb.debian.org_Packages", "Package: bash\n"),
    ] {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Append-only event log shared between test stages and the test body.
pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

/// Test environment with a temporary output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub output: PathBuf,
    pub shell: Arc<RecordingShell>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let output = temp_dir.path().join("output");
        Self {
            _temp_dir: temp_dir,
            output,
            shell: RecordingShell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }

    pub fn layout(&self, config: &BuildConfig) -> Layout {
        Layout::for_config(&self.output, config)
    }

    pub fn tools(&self) -> Toolbox {
        Toolbox::new(self.shell.clone(), Arc::new(TarGz::with_level(1)))
    }

    pub fn pipeline<'a>(&self, config: &'a BuildConfig) -> Pipeline<'a> {
        Pipeline::new(config, self.layout(config), self.tools())
    }
}

/// Configuration of an A64-OLinuXino running Debian buster.
pub fn sample_config() -> BuildConfig {
    BuildConfig {
        board: Board {
            name: "a64-olinuxino".to_string(),
            arch: "arm64".to_string(),
            console: "ttyS0".to_string(),
        },
        distribution: Distribution {
            name: "debian".to_string(),
            release: "buster".to_string(),
            repository: "http://deb.debian.org/debian".to_string(),
            components: vec!["main".to_string(), "contrib".to_string()],
        },
        variant: Variant {
            name: "lite".to_string(),
            packages: vec!["openssh-server".to_string(), "sudo".to_string()],
        },
        users: vec![
            User {
                name: "root".to_string(),
                password: "olimex".to_string(),
                groups: vec![],
            },
            User {
                name: "olimex".to_string(),
                password: "olimex".to_string(),
                groups: vec!["sudo".to_string(), "dialout".to_string()],
            },
        ],
        options: BuildOptions::default(),
    }
}
