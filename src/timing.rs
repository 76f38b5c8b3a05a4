//! Build timing utilities.

use std::time::{Duration, Instant};

/// A simple timer for measuring stage and step durations.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Start a new timer with the given phase name.
    pub fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    /// Finish the timer, log the elapsed time and return it.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::info!("  [{}] {}", format_duration(elapsed), self.name);
        elapsed
    }
}

/// Run one named step of a stage.
///
/// Logs the step, times it, and attaches the step name to any error.
pub fn step<T>(label: &str, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    use anyhow::Context;

    tracing::info!("  {}", label);
    let start = Instant::now();
    let value = f().with_context(|| label.to_string())?;
    tracing::debug!("  {} done [{}]", label, format_duration(start.elapsed()));
    Ok(value)
}

/// `12.3s` below a minute, `4.5m` above.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
