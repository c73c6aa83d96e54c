//! `jobherd completions` - Generate shell completions

use anyhow::{Context, Result};
use clap_complete::{Shell, generate};
use std::fs;
use std::path::Path;

/// Renders the completion script for `shell`
pub fn generate_completions(shell: Shell) -> Result<String> {
    let mut cmd = super::build_cli();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, "jobherd", &mut buf);

    String::from_utf8(buf).context("Failed to generate completions")
}

/// Writes the script to `output`, or stdout when none is given
pub fn write_completions(shell: Shell, output: Option<&Path>) -> Result<()> {
    let completions = generate_completions(shell)?;
    match output {
        Some(path) => fs::write(path, completions)
            .with_context(|| format!("Failed to write completions to: {}", path.display())),
        None => {
            print!("{completions}");
            Ok(())
        }
    }
}
