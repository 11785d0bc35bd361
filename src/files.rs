use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use crate::config::PathsConfig;
use crate::error::Result;
use crate::space::{free_mb, FsVolume, VolumeProbe};

/// How loudly a failed delete should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSeverity {
    Debug,
    Warn,
    Error,
}

/// Staged uploads live in the queue directory and finished encodes in the results
/// directory, both named by job id.
pub struct FileStore {
    queue_dir: PathBuf,
    results_dir: PathBuf,
    recovery_dir: PathBuf,
    queue_volume: Arc<dyn VolumeProbe>,
    results_volume: Arc<dyn VolumeProbe>,
}

impl FileStore {
    pub fn new(paths: &PathsConfig) -> Self {
        Self::with_volumes(
            paths,
            Arc::new(FsVolume::new(&paths.queue_dir)),
            Arc::new(FsVolume::new(&paths.results_dir)),
        )
    }

    pub fn with_volumes(
        paths: &PathsConfig,
        queue_volume: Arc<dyn VolumeProbe>,
        results_volume: Arc<dyn VolumeProbe>,
    ) -> Self {
        Self {
            queue_dir: paths.queue_dir.clone(),
            results_dir: paths.results_dir.clone(),
            recovery_dir: paths.recovery_dir.clone(),
            queue_volume,
            results_volume,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.queue_dir).await?;
        tokio::fs::create_dir_all(&self.results_dir).await?;
        Ok(())
    }

    pub fn queue_volume(&self) -> Arc<dyn VolumeProbe> {
        self.queue_volume.clone()
    }

    pub fn queue_free_mb(&self) -> i64 {
        free_mb(self.queue_volume.as_ref())
    }

    pub fn results_free_mb(&self) -> i64 {
        free_mb(self.results_volume.as_ref())
    }

    pub fn queue_path(&self, job_id: Uuid) -> PathBuf {
        self.queue_dir.join(job_id.to_string())
    }

    pub fn result_path(&self, job_id: Uuid) -> PathBuf {
        self.results_dir.join(job_id.to_string())
    }

    pub async fn save_to_queue<R>(&self, job_id: Uuid, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        save(&self.queue_path(job_id), reader).await
    }

    pub async fn save_to_results<R>(&self, job_id: Uuid, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        save(&self.result_path(job_id), reader).await
    }

    pub async fn result_size(&self, job_id: Uuid) -> Result<u64> {
        Ok(tokio::fs::metadata(self.result_path(job_id)).await?.len())
    }

    pub async fn delete_queue_file(&self, job_id: Uuid, reason: &str, severity: DeleteSeverity) {
        delete(&self.queue_path(job_id), job_id, reason, severity).await
    }

    pub async fn delete_result_file(&self, job_id: Uuid, reason: &str, severity: DeleteSeverity) {
        delete(&self.result_path(job_id), job_id, reason, severity).await
    }

    /// Files waiting in the recovery directory. Missing directory means nothing to recover.
    pub async fn recovery_files(&self) -> Vec<PathBuf> {
        let mut entries = match tokio::fs::read_dir(&self.recovery_dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files
    }
}

async fn save<R>(dest: &Path, reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = tokio::fs::File::create(dest).await?;
    let written = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(written)
}

async fn delete(path: &Path, job_id: Uuid, reason: &str, severity: DeleteSeverity) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        let path = path.display();
        match severity {
            DeleteSeverity::Debug => {
                tracing::debug!(job_id = %job_id, %path, reason, error = %e, "Failed to delete file")
            }
            DeleteSeverity::Warn => {
                tracing::warn!(job_id = %job_id, %path, reason, error = %e, "Failed to delete file")
            }
            DeleteSeverity::Error => {
                tracing::error!(job_id = %job_id, %path, reason, error = %e, "Failed to delete file")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::FixedVolume;

    fn store(dir: &Path) -> FileStore {
        let paths = PathsConfig {
            queue_dir: dir.join("queue"),
            results_dir: dir.join("results"),
            recovery_dir: dir.join("recovery"),
        };
        FileStore::with_volumes(
            &paths,
            Arc::new(FixedVolume::with_free_mb(100)),
            Arc::new(FixedVolume::with_free_mb(7)),
        )
    }

    #[tokio::test]
    async fn save_and_delete_queue_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(dir.path());
        files.ensure_dirs().await.unwrap();

        let id = Uuid::new_v4();
        let mut data: &[u8] = b"not really a video";
        let written = files.save_to_queue(id, &mut data).await.unwrap();
        assert_eq!(written, 18);
        assert!(files.queue_path(id).exists());

        files
            .delete_queue_file(id, "test", DeleteSeverity::Warn)
            .await;
        assert!(!files.queue_path(id).exists());

        // deleting again is tolerated
        files
            .delete_queue_file(id, "test", DeleteSeverity::Debug)
            .await;
    }

    #[tokio::test]
    async fn missing_recovery_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(dir.path());
        assert!(files.recovery_files().await.is_empty());
        assert_eq!(files.queue_free_mb(), 100);
        assert_eq!(files.results_free_mb(), 7);
    }
}
