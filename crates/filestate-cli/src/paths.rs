use anyhow::{Result, anyhow};
use std::env;
use std::path::PathBuf;

const DATABASE_FILE: &str = "filestate.db";

/// Resolves where the state database lives.
///
/// `$FILESTATE_HOME` wins, then `$XDG_DATA_HOME/filestate`, then
/// `~/.local/share/filestate`.
#[derive(Debug, Clone, Default)]
pub struct DataDirResolver {
    filestate_home: Option<PathBuf>,
    xdg_data_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
}

impl DataDirResolver {
    pub fn from_env() -> Self {
        Self {
            filestate_home: non_empty_var("FILESTATE_HOME"),
            xdg_data_home: non_empty_var("XDG_DATA_HOME"),
            home_dir: dirs::home_dir(),
        }
    }

    pub fn with_filestate_home<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.filestate_home = Some(dir.into());
        self
    }

    pub fn with_xdg_data_home<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.xdg_data_home = Some(dir.into());
        self
    }

    pub fn with_home<P: Into<PathBuf>>(mut self, home: P) -> Self {
        self.home_dir = Some(home.into());
        self
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.filestate_home {
            return Ok(dir.clone());
        }
        if let Some(xdg) = &self.xdg_data_home {
            return Ok(xdg.join("filestate"));
        }
        let home = self
            .home_dir
            .as_ref()
            .ok_or_else(|| anyhow!("could not determine home directory; pass --db"))?;
        Ok(home.join(".local").join("share").join("filestate"))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DATABASE_FILE))
    }
}

fn non_empty_var(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

mod dirs {
    use super::*;

    pub fn home_dir() -> Option<PathBuf> {
        env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
