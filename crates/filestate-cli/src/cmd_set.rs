use anyhow::{Context, Result};
use filestate::FileStateManager;

pub async fn run(manager: &FileStateManager, path: &str, module: &str, state: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(state).context("State must be valid JSON")?;
    manager.update_module_state(path, module, value)?;
    manager.flush().await?;
    eprintln!("Updated {} for {}", module, path);
    Ok(())
}
