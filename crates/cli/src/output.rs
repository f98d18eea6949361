use std::{env, fs::OpenOptions, io::Write};

use anyhow::{Context, Result};

pub const ARTIFACTS_REUSED: &str = "artifacts-reused";

/// Append a step output in the `name=value` form the runner consumes.
/// Outside a runner (no `GITHUB_OUTPUT`) the value is only logged.
pub fn set_output(name: &str, value: &str) -> Result<()> {
    let Ok(path) = env::var("GITHUB_OUTPUT") else {
        tracing::warn!("GITHUB_OUTPUT is not set, skipping output {}={}", name, value);
        return Ok(());
    };
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .with_context(|| format!("Failed to open {path}"))?;
    writeln!(file, "{name}={value}").with_context(|| format!("Failed to write {path}"))?;
    Ok(())
}

pub fn set_artifacts_reused(reused: bool) -> Result<()> {
    set_output(ARTIFACTS_REUSED, if reused { "true" } else { "false" })
}
