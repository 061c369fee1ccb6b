//! Task-scoped output storage and ZIP packaging.
//!
//! Layout under the store root:
//!
//! ```text
//! {root}/{task_id}/          converted JPGs of one batch
//! {root}/{task_id}.zip       the packaged archive, once ready
//! {root}/{task_id}.zip.tmp   archive being written (never served)
//! ```
//!
//! Task ids are UUID v4. Anything that does not parse as a UUID is treated
//! as an unknown task, so a caller-supplied id can never address a path
//! outside the root.

use crate::error::ConvertError;
use crate::output::OutputFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A freshly allocated task: its id and the paths it owns.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    directory: PathBuf,
    archive: PathBuf,
    created_at: DateTime<Utc>,
}

impl TaskHandle {
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Result of [`TaskStore::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub exists: bool,
    pub zip_ready: bool,
    pub zip_size: Option<u64>,
}

/// Filesystem-backed store shared by all batches.
///
/// Batches never share a directory, so concurrent batches need no locking.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ConvertError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ConvertError::storage(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, id: &Uuid) -> (PathBuf, PathBuf) {
        (
            self.root.join(id.to_string()),
            self.root.join(format!("{id}.zip")),
        )
    }

    /// Allocate a new task id and create its empty directory.
    pub async fn create(&self) -> Result<TaskHandle, ConvertError> {
        let id = Uuid::new_v4();
        let (directory, archive) = self.paths(&id);
        // `create_dir` rather than `create_dir_all`: an existing directory
        // must fail instead of being shared.
        tokio::fs::create_dir(&directory)
            .await
            .map_err(|e| ConvertError::storage(&directory, e))?;
        debug!("Created task {} at {}", id, directory.display());
        Ok(TaskHandle {
            id,
            directory,
            archive,
            created_at: Utc::now(),
        })
    }

    /// Write one converted file into the task directory.
    pub async fn write_output(
        &self,
        task: &TaskHandle,
        filename: &str,
        bytes: &[u8],
    ) -> Result<OutputFile, ConvertError> {
        if Path::new(filename).file_name().and_then(|n| n.to_str()) != Some(filename) {
            return Err(ConvertError::Internal(format!(
                "output name '{filename}' is not a plain file name"
            )));
        }
        let path = task.directory.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ConvertError::storage(&path, e))?;
        Ok(OutputFile {
            filename: filename.to_string(),
            size_bytes: bytes.len() as u64,
        })
    }

    /// Zip the given outputs (in order) into `{root}/{task_id}.zip`.
    ///
    /// The archive is written under a temporary name and renamed into place,
    /// so [`retrieve`](Self::retrieve) never sees a half-written file.
    pub async fn package(
        &self,
        task: &TaskHandle,
        outputs: &[OutputFile],
    ) -> Result<PathBuf, ConvertError> {
        let directory = task.directory.clone();
        let archive = task.archive.clone();
        let names: Vec<String> = outputs.iter().map(|o| o.filename.clone()).collect();

        let written = tokio::task::spawn_blocking(move || {
            write_archive_blocking(&directory, &archive, &names).map(|()| archive)
        })
        .await
        .map_err(|e| ConvertError::Internal(format!("Packaging task panicked: {}", e)))??;

        info!(
            "Packaged {} file(s) into {}",
            outputs.len(),
            written.display()
        );
        Ok(written)
    }

    /// Path of a task's finished archive.
    pub async fn retrieve(&self, task_id: &str) -> Result<PathBuf, ConvertError> {
        let not_found = || ConvertError::NotFound {
            task_id: task_id.to_string(),
        };
        let id = Uuid::parse_str(task_id).map_err(|_| not_found())?;
        let (_, archive) = self.paths(&id);
        match tokio::fs::metadata(&archive).await {
            Ok(m) if m.is_file() => Ok(archive),
            Ok(_) => Err(not_found()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(ConvertError::storage(&archive, e)),
        }
    }

    /// Bytes of a task's finished archive.
    pub async fn read_archive(&self, task_id: &str) -> Result<Vec<u8>, ConvertError> {
        let path = self.retrieve(task_id).await?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            // Purged between retrieve and read.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ConvertError::NotFound {
                task_id: task_id.to_string(),
            }),
            Err(e) => Err(ConvertError::storage(&path, e)),
        }
    }

    /// Whether a task exists and whether its archive is ready.
    pub async fn status(&self, task_id: &str) -> TaskStatus {
        let mut status = TaskStatus {
            task_id: task_id.to_string(),
            exists: false,
            zip_ready: false,
            zip_size: None,
        };
        let Ok(id) = Uuid::parse_str(task_id) else {
            return status;
        };
        let (directory, archive) = self.paths(&id);

        if let Ok(m) = tokio::fs::metadata(&archive).await {
            status.exists = true;
            status.zip_ready = true;
            status.zip_size = Some(m.len());
        }
        if tokio::fs::metadata(&directory).await.is_ok() {
            status.exists = true;
        }
        status
    }

    /// Remove a task's directory and archive. Purging a task that is already
    /// gone, or never existed, succeeds.
    pub async fn purge(&self, task_id: &str) -> Result<(), ConvertError> {
        let Ok(id) = Uuid::parse_str(task_id) else {
            return Ok(());
        };
        let (directory, archive) = self.paths(&id);
        let tmp = archive.with_extension("zip.tmp");

        ignore_missing(tokio::fs::remove_dir_all(&directory).await)
            .map_err(|e| ConvertError::storage(&directory, e))?;
        ignore_missing(tokio::fs::remove_file(&archive).await)
            .map_err(|e| ConvertError::storage(&archive, e))?;
        ignore_missing(tokio::fs::remove_file(&tmp).await)
            .map_err(|e| ConvertError::storage(&tmp, e))?;

        debug!("Purged task {}", id);
        Ok(())
    }

    /// Purge every task whose directory or archive is older than `max_age`.
    ///
    /// Returns the number of tasks removed. Entries that are not task paths
    /// are left alone.
    pub async fn purge_expired(&self, max_age: Duration) -> Result<usize, ConvertError> {
        let now = SystemTime::now();
        let mut expired = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ConvertError::storage(&self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ConvertError::storage(&self.root, e))?
        {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(task_id_of) else {
                continue;
            };
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Cannot stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age && !expired.contains(&id) {
                expired.push(id);
            }
        }

        for id in &expired {
            self.purge(&id.to_string()).await?;
        }
        if !expired.is_empty() {
            info!("Retention sweep purged {} task(s)", expired.len());
        }
        Ok(expired.len())
    }
}

/// Task id encoded in a root entry name (`{id}`, `{id}.zip`, `{id}.zip.tmp`).
fn task_id_of(name: &str) -> Option<Uuid> {
    let stem = name
        .strip_suffix(".zip.tmp")
        .or_else(|| name.strip_suffix(".zip"))
        .unwrap_or(name);
    Uuid::parse_str(stem).ok()
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn write_archive_blocking(
    directory: &Path,
    archive: &Path,
    names: &[String],
) -> Result<(), ConvertError> {
    let tmp = archive.with_extension("zip.tmp");
    let packaging = |detail: zip::result::ZipError| ConvertError::Packaging {
        path: archive.to_path_buf(),
        detail: detail.to_string(),
    };

    let file = File::create(&tmp).map_err(|e| ConvertError::storage(&tmp, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for name in names {
        let src = directory.join(name);
        let data = std::fs::read(&src).map_err(|e| ConvertError::storage(&src, e))?;
        zip.start_file(name.as_str(), options).map_err(packaging)?;
        zip.write_all(&data)
            .map_err(|e| ConvertError::storage(&tmp, e))?;
    }

    let file = zip.finish().map_err(packaging)?;
    file.sync_all().map_err(|e| ConvertError::storage(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, archive).map_err(|e| ConvertError::storage(archive, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Read;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_allocates_distinct_directories() {
        let (_dir, store) = store();
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.directory().is_dir());
        assert!(b.directory().is_dir());
        assert_eq!(Uuid::parse_str(&a.id()).unwrap().get_version_num(), 4);
    }

    #[tokio::test]
    async fn package_then_retrieve() {
        let (_dir, store) = store();
        let task = store.create().await.unwrap();
        let a = store.write_output(&task, "a.jpg", b"aaaa").await.unwrap();
        let b = store.write_output(&task, "b.jpg", b"bb").await.unwrap();
        assert_eq!(b.size_bytes, 2);

        let path = store.package(&task, &[a, b]).await.unwrap();
        assert_eq!(store.retrieve(&task.id()).await.unwrap(), path);
        assert!(!path.with_extension("zip.tmp").exists());

        let bytes = store.read_archive(&task.id()).await.unwrap();
        let mut zip = zip::ZipArchive::new(io::Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name(), "a.jpg");
        let mut content = String::new();
        zip.by_name("b.jpg").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "bb");
    }

    #[tokio::test]
    async fn empty_package_is_a_valid_archive() {
        let (_dir, store) = store();
        let task = store.create().await.unwrap();
        store.package(&task, &[]).await.unwrap();
        let bytes = store.read_archive(&task.id()).await.unwrap();
        assert_eq!(zip::ZipArchive::new(io::Cursor::new(bytes)).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn write_output_rejects_paths() {
        let (_dir, store) = store();
        let task = store.create().await.unwrap();
        assert!(store.write_output(&task, "../escape.jpg", b"x").await.is_err());
        assert!(store.write_output(&task, "sub/x.jpg", b"x").await.is_err());
    }

    #[tokio::test]
    async fn retrieve_unknown_or_malformed_is_not_found() {
        let (_dir, store) = store();
        let err = store.retrieve(&Uuid::new_v4().to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.retrieve("../../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn archive_not_ready_until_packaged() {
        let (_dir, store) = store();
        let task = store.create().await.unwrap();
        let status = store.status(&task.id()).await;
        assert!(status.exists);
        assert!(!status.zip_ready);
        assert_eq!(
            store.retrieve(&task.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn purge_is_idempotent() {
        let (_dir, store) = store();
        let task = store.create().await.unwrap();
        let out = store.write_output(&task, "a.jpg", b"a").await.unwrap();
        store.package(&task, &[out]).await.unwrap();

        store.purge(&task.id()).await.unwrap();
        assert!(!task.directory().exists());
        assert!(!task.archive().exists());
        assert_eq!(
            store.retrieve(&task.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        store.purge(&task.id()).await.unwrap();
        store.purge("not-a-uuid").await.unwrap();

        let status = store.status(&task.id()).await;
        assert!(!status.exists && !status.zip_ready);
    }

    #[tokio::test]
    async fn purge_expired_only_touches_old_tasks() {
        let (_dir, store) = store();
        let task = store.create().await.unwrap();
        std::fs::write(store.root().join("README"), b"not a task").unwrap();

        assert_eq!(store.purge_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(task.directory().exists());

        assert_eq!(store.purge_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(!task.directory().exists());
        assert!(store.root().join("README").exists());
    }

    #[test]
    fn task_id_parsing_covers_all_entry_shapes() {
        let id = Uuid::new_v4();
        assert_eq!(task_id_of(&id.to_string()), Some(id));
        assert_eq!(task_id_of(&format!("{id}.zip")), Some(id));
        assert_eq!(task_id_of(&format!("{id}.zip.tmp")), Some(id));
        assert_eq!(task_id_of("README"), None);
    }

    #[test]
    fn status_of_malformed_id_is_absent() {
        let (_dir, store) = store();
        let status = tokio_test::block_on(store.status("nope"));
        assert!(!status.exists);
        assert_eq!(status.zip_size, None);
    }
}
