// Default configuration output

use std::path::Path;

use anyhow::{Context, Result};
use taskqueue_engine::ServerConfig;

pub fn run(output: Option<&Path>) -> Result<()> {
    let json = ServerConfig::default_json()?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Default configuration written");
        }
        None => println!("{json}"),
    }

    Ok(())
}
