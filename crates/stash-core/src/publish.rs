//! Publish handoff
//!
//! A finished transfer is handed to a [`GalleryPublisher`], which commits the
//! file into permanent user storage. The engine keeps its own copy until the
//! publisher reports success.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a publish attempt did not go through
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Rejected(String),
}

/// Commits finished files into permanent storage
#[async_trait]
pub trait GalleryPublisher: Send + Sync {
    /// Checked before a transfer starts writing
    async fn ensure_permission(&self) -> Result<(), PublishError> {
        Ok(())
    }

    /// Commit the file at `path`. The caller deletes its copy on success.
    async fn publish(&self, path: &Path) -> Result<(), PublishError>;
}

/// Publishes by copying into a directory
#[derive(Debug, Clone)]
pub struct DirectoryGallery {
    root: PathBuf,
}

impl DirectoryGallery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl GalleryPublisher for DirectoryGallery {
    async fn ensure_permission(&self) -> Result<(), PublishError> {
        fs::create_dir_all(&self.root).await.map_err(|e| map_io(&self.root, e))?;

        let metadata = fs::metadata(&self.root).await.map_err(|e| map_io(&self.root, e))?;
        if metadata.permissions().readonly() {
            return Err(PublishError::PermissionDenied(format!(
                "{} is read-only",
                self.root.display()
            )));
        }

        self.sweep_staging(STALE_STAGING).await;
        Ok(())
    }

    async fn publish(&self, path: &Path) -> Result<(), PublishError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| PublishError::Rejected(format!("{} has no file name", path.display())))?;

        fs::create_dir_all(&self.root).await.map_err(|e| map_io(&self.root, e))?;

        // Copy under a hidden name first so the gallery never shows a partial file
        let staging = Staging::new(&self.root);
        let target = self.root.join(file_name);

        debug!("Copying {} to {}", path.display(), staging.path.display());
        fs::copy(path, &staging.path).await.map_err(|e| map_io(path, e))?;
        staging.commit(&target).await.map_err(|e| map_io(&target, e))?;

        info!("Published {}", target.display());
        Ok(())
    }
}

impl DirectoryGallery {
    /// Remove staging files untouched for longer than `older_than`
    async fn sweep_staging(&self, older_than: Duration) {
        let Ok(mut entries) = fs::read_dir(&self.root).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if !is_staging_name(&name.to_string_lossy()) {
                continue;
            }
            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified.elapsed().map_or(false, |age| age >= older_than),
                Err(_) => false,
            };
            if stale {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => debug!("Removed stale staging file {}", entry.path().display()),
                    Err(e) => warn!("Could not remove {}: {}", entry.path().display(), e),
                }
            }
        }
    }
}

/// Staging files still growing are left alone
const STALE_STAGING: Duration = Duration::from_secs(10 * 60);

const STAGING_SUFFIX: &str = ".tmp";

fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

/// Hidden copy inside the gallery, deleted on drop unless renamed into place
struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Staging {
    fn new(root: &Path) -> Self {
        Self {
            path: root.join(format!(".{}{}", Uuid::new_v4(), STAGING_SUFFIX)),
            committed: false,
        }
    }

    async fn commit(mut self, target: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, target).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn map_io(path: &Path, error: std::io::Error) -> PublishError {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
        PublishError::PermissionDenied(format!("{}: {}", path.display(), error))
    } else {
        PublishError::Rejected(format!("{}: {}", path.display(), error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_gallery_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("stash_1.jpg");
        fs::write(&source, b"pixels").await.unwrap();

        let gallery = DirectoryGallery::new(dir.path().join("gallery"));
        gallery.ensure_permission().await.unwrap();
        gallery.publish(&source).await.unwrap();

        let published = fs::read(gallery.root().join("stash_1.jpg")).await.unwrap();
        assert_eq!(published, b"pixels");
        // The source stays; removing it is the caller's job
        assert!(source.exists());

        let mut entries = fs::read_dir(gallery.root()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["stash_1.jpg"]);
    }

    #[tokio::test]
    async fn test_missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = DirectoryGallery::new(dir.path().join("gallery"));

        let result = gallery.publish(&dir.path().join("missing.jpg")).await;
        assert!(matches!(result, Err(PublishError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unfinished_staging_copy_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();

        let staging = Staging::new(dir.path());
        fs::write(&staging.path, b"half").await.unwrap();
        let path = staging.path.clone();
        drop(staging);
        assert!(!path.exists());

        let staging = Staging::new(dir.path());
        fs::write(&staging.path, b"whole").await.unwrap();
        let target = dir.path().join("stash_2.jpg");
        staging.commit(&target).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"whole");
    }

    #[tokio::test]
    async fn test_ensure_permission_sweeps_stale_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = DirectoryGallery::new(dir.path().join("gallery"));
        gallery.ensure_permission().await.unwrap();

        let stale = gallery.root().join(".left-behind.tmp");
        let fresh = gallery.root().join(".in-progress.tmp");
        let photo = gallery.root().join("stash_3.jpg");
        for path in [&stale, &fresh, &photo] {
            fs::write(path, b"bytes").await.unwrap();
        }
        let old = std::time::SystemTime::now() - Duration::from_secs(60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(old)
            .unwrap();

        gallery.ensure_permission().await.unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(photo.exists());
    }
}
