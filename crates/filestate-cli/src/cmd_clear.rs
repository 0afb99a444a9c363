use anyhow::Result;
use filestate::FileStateManager;

pub async fn run(manager: &FileStateManager, path: &str, module: Option<&str>) -> Result<()> {
    manager.clear_file_state(path, module).await?;
    match module {
        Some(module) => eprintln!("Cleared {} for {}", module, path),
        None => eprintln!("Cleared all state for {}", path),
    }
    Ok(())
}
