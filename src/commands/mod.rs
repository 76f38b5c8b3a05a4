//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Run the stage pipeline
//! - `status` - Show which stages are cached
//! - `clean` - Remove stamps or the whole output directory
//! - `show` - Display information
//! - `preflight` - Run preflight checks

pub mod build;
pub mod clean;
mod preflight;
pub mod show;
mod status;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
pub use status::cmd_status;
