// Subcommand implementations

pub mod config;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};
use taskqueue_engine::task::Task;

/// Read a task file and check it decodes as a job body
pub fn read_task_file(path: &Path) -> Result<(Vec<u8>, Task)> {
    let body = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let task = Task::from_wire(0, &body)
        .with_context(|| format!("Invalid task file {}", path.display()))?;
    Ok((body, task))
}
