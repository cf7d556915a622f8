// src/file_manager.rs - program files on disk
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;

const PROGRAM_EXTENSIONS: [&str; 6] = ["nc", "ngc", "gcode", "gc", "tap", "cnc"];

#[derive(Debug, Error)]
pub enum FileManagerError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not valid UTF-8 text")]
    NotText(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProgramFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Reads programs from a directory. Relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new(".")
    }
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) }
    }

    pub async fn load_program(&self, path: impl AsRef<Path>) -> Result<String, FileManagerError> {
        let path = self.resolve(path.as_ref());
        tracing::info!("Reading program: {}", path.display());
        let bytes = fs::read(&path).await.map_err(|source| FileManagerError::Io { path: path.clone(), source })?;
        String::from_utf8(bytes).map_err(|_| FileManagerError::NotText(path))
    }

    /// Program files directly under `root`, sorted by name.
    pub async fn list_programs(&self) -> Result<Vec<ProgramFile>, FileManagerError> {
        let io_error = |source| FileManagerError::Io { path: self.root.clone(), source };
        let mut entries = fs::read_dir(&self.root).await.map_err(io_error)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let is_program = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| PROGRAM_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if !is_program {
                continue;
            }
            let metadata = entry.metadata().await.map_err(io_error)?;
            if !metadata.is_file() {
                continue;
            }
            files.push(ProgramFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
