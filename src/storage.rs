use crate::config::DataPaths;
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

// STORAGE MANAGER

pub struct AsyncStorageManager {
    pub archive_dir: PathBuf,
}

impl AsyncStorageManager {
    /// **Constructor: prepare**
    /// Creates the archive directory and the parent directories of the
    /// dataset and model files, so later writes never have to check.
    pub async fn prepare(paths: &DataPaths) -> anyhow::Result<Self> {
        fs::create_dir_all(&paths.archive_dir).await?;
        for file in [&paths.training_csv, &paths.model_file] {
            if let Some(parent) = file.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
        }

        Ok(Self {
            archive_dir: paths.archive_dir.clone(),
        })
    }

    /// Writes one downloaded archive, unmodified, into the archive directory.
    pub async fn save_archive(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.archive_dir.join(file_name);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// **Generic Save Function**
    /// Serializes `data` to pretty JSON at `path` using an atomic write.
    pub async fn save_json<T: Serialize>(path: &Path, data: &T) -> anyhow::Result<()> {
        let json_bytes = serde_json::to_vec_pretty(data)?;
        write_atomic(path, &json_bytes).await
    }

    /// **Generic Load Function**
    pub async fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
        // serde_json validates the bytes itself, no need for read_to_string.
        let content = fs::read(path).await?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes to `<name>.tmp` first, then renames over the final name. A crash
/// mid-write leaves the previous file untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Blocking twin of [`write_atomic`] for code already running on a blocking
/// thread.
pub fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        name: String,
        values: Vec<f64>,
    }

    #[tokio::test]
    async fn prepare_creates_all_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::under(dir.path());
        AsyncStorageManager::prepare(&paths).await.unwrap();

        assert!(paths.archive_dir.is_dir());
        assert!(paths.training_csv.parent().unwrap().is_dir());
        assert!(paths.model_file.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn json_save_and_load_leave_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let sample = Sample {
            name: "eth".to_string(),
            values: vec![1.5, 2.5],
        };

        AsyncStorageManager::save_json(&path, &sample).await.unwrap();
        let loaded: Sample = AsyncStorageManager::load_json(&path).await.unwrap();

        assert_eq!(loaded, sample);
        assert!(!dir.path().join("sample.json.tmp").exists());
    }

    #[test]
    fn blocking_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_atomic_blocking(&path, b"first").unwrap();
        write_atomic_blocking(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }
}
