// Task file validation

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::Serialize;

use super::read_task_file;
use crate::output::{print_field, OutputFormat};

#[derive(Debug, Serialize)]
struct FileReport {
    file: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run(files: &[PathBuf], output: OutputFormat) -> Result<()> {
    let reports: Vec<FileReport> = files
        .iter()
        .map(|path| match read_task_file(path) {
            Ok((_, task)) => FileReport {
                file: path.display().to_string(),
                valid: true,
                name: Some(task.name),
                error: None,
            },
            Err(e) => FileReport {
                file: path.display().to_string(),
                valid: false,
                name: None,
                error: Some(format!("{e:#}")),
            },
        })
        .collect();

    if output.is_text() {
        for report in &reports {
            match (&report.name, &report.error) {
                (Some(name), _) => print_field(&report.file, &format!("ok ({name})")),
                (_, Some(error)) => print_field(&report.file, error),
                _ => {}
            }
        }
    } else {
        output.print_value(&reports)?;
    }

    let invalid = reports.iter().filter(|r| !r.valid).count();
    if invalid > 0 {
        bail!("{invalid} of {} task files are invalid", reports.len());
    }
    Ok(())
}
