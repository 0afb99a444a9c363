use anyhow::Result;
use filestate::FileStateManager;
use serde_json::json;

pub fn run(manager: &FileStateManager, json: bool) -> Result<()> {
    let modules = manager.modules();
    if json {
        let rows: Vec<_> = modules
            .iter()
            .map(|(id, priority)| json!({ "id": id, "priority": priority }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for (id, priority) in modules {
        println!("{:<12} priority {}", id, priority);
    }
    Ok(())
}
