use anyhow::Result;
use filestate::{FileMetadata, FileStateManager};
use serde::Serialize;

#[derive(Serialize)]
struct FileRow {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<FileMetadata>,
}

pub async fn run(manager: &FileStateManager, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for path in manager.get_tracked_files().await? {
        let metadata = manager.store().get_file_metadata(&path).await?;
        rows.push(FileRow { path, metadata });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        eprintln!("No files tracked");
        return Ok(());
    }
    for row in rows {
        match row.metadata {
            Some(m) => println!(
                "{}\t{} opens\tlast {}",
                row.path,
                m.access_count,
                m.last_accessed.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("{}\tnever opened", row.path),
        }
    }
    Ok(())
}
