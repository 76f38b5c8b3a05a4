//! boardfs library exports.
//!
//! The binary is a thin CLI over these modules; integration tests drive the
//! pipeline through them with fake collaborators.

pub mod archive;
pub mod cache;
pub mod cleanup;
pub mod common;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod layout;
pub mod lock;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod stage;
pub mod timing;

pub use cache::{StageCache, StampRecord, StampStatus};
pub use cleanup::{CleanupAction, CleanupScope, CleanupStack};
pub use config::{BuildConfig, ConfigProvider};
pub use error::{CacheError, PipelineError};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use layout::Layout;
pub use pipeline::{Pipeline, RunReport, StageRun};
pub use stage::{ArtifactRef, Stage, StageContext, Toolbox};
