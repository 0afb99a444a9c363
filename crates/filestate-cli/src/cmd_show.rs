use anyhow::Result;
use filestate::FileStateManager;

pub async fn run(manager: &FileStateManager, path: &str, json: bool) -> Result<()> {
    let state = manager.load_file_state(path).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("{}", state.file_path);
    println!(
        "  opened {} times, first {}, last {}",
        state.metadata.access_count,
        state.metadata.first_opened.format("%Y-%m-%d %H:%M:%S"),
        state.metadata.last_accessed.format("%Y-%m-%d %H:%M:%S"),
    );
    for (module_id, value) in &state.modules {
        println!("  {}: {}", module_id, serde_json::to_string(value)?);
    }
    for warning in &state.warnings {
        eprintln!("Warning: {}: {}", warning.module_id, warning.message);
    }
    Ok(())
}
