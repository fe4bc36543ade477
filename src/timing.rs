//! Phase timing for packaging runs.

use std::time::Instant;

/// Measures one phase (mount, resolve, plan, assemble) of a run.
pub struct Timer {
    phase: String,
    start: Instant,
}

impl Timer {
    pub fn start(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Print the elapsed time next to the phase name.
    pub fn finish(self) {
        println!("  [{}] {}", format_duration(self.elapsed_secs()), self.phase);
    }
}

fn format_duration(secs: f64) -> String {
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else if secs >= 1.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{}ms", (secs * 1000.0).round() as u64)
    }
}
