//! Root filesystem variants.
//!
//! A variant is nothing more than an ordered list of [`Stage`]s. The pipeline
//! runs them; this module only decides which ones and in what order.

pub mod lite;
pub mod service;
pub mod setup;

use anyhow::{bail, Result};

use crate::stage::Stage;

pub const BUILD: &str = "build";
pub const CONFIGURE: &str = "configure";
pub const CLEANUP: &str = "cleanup";
pub const EXPORT: &str = "export";

/// Variants this build knows how to produce.
pub const VARIANTS: &[&str] = &["lite"];

/// Stage list for a variant, in execution order.
pub fn stages(variant: &str) -> Result<Vec<Stage>> {
    match variant {
        "lite" => Ok(lite::stages()),
        other => bail!(
            "Unknown variant '{}'. Available: {}",
            other,
            VARIANTS.join(", ")
        ),
    }
}

/// Keep stages up to and including `target`.
pub fn select_until(mut stages: Vec<Stage>, target: Option<&str>) -> Result<Vec<Stage>> {
    let Some(target) = target else {
        return Ok(stages);
    };
    match stages.iter().position(|s| s.name() == target) {
        Some(index) => {
            stages.truncate(index + 1);
            Ok(stages)
        }
        None => {
            let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
            bail!("Unknown stage '{}'. Available: {}", target, names.join(", "))
        }
    }
}
