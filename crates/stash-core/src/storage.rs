//! Storage layer for the data directory (settings file and download folder)

use crate::error::StashError;
use stash_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";
const QUEUE_DB_FILE: &str = "queue.db";

/// Layout of the Stash data directory
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create the data directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self, StashError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    /// Platform default data directory
    pub fn default_data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "stash")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".stash"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_DB_FILE)
    }

    /// Directory transfers write into
    pub fn download_dir(&self, settings: &Settings) -> PathBuf {
        settings
            .download_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    // ========================================================================
    // Settings (JSON file)
    // ========================================================================

    /// Load settings, falling back to defaults when missing or unreadable
    pub async fn load_settings(&self) -> Result<Settings, StashError> {
        let path = self.data_dir.join(SETTINGS_FILE);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                Ok(Settings::default())
            }
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StashError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.data_dir.join(SETTINGS_FILE), content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.load_settings().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn test_settings_round_trip_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();

        let settings = Settings {
            file_prefix: "wall".to_string(),
            max_resume_restarts: 1,
            ..Settings::default()
        };
        storage.save_settings(&settings).await.unwrap();
        assert_eq!(storage.load_settings().await.unwrap(), settings);

        fs::write(dir.path().join(SETTINGS_FILE), r#"{"file_extension":"png"}"#)
            .await
            .unwrap();
        let partial = storage.load_settings().await.unwrap();
        assert_eq!(partial.file_extension, "png");
        assert_eq!(partial.file_prefix, "stash");
    }

    #[tokio::test]
    async fn test_download_dir_defaults_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(
            storage.download_dir(&Settings::default()),
            dir.path().join("downloads")
        );
    }
}
