use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ida_freeze_config::{NodeType, StorageConfig, PROJECT_USER_PREFIX, STAGING_FOLDER_SUFFIX};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use super::{Area, FileDigest, FileEntry, FileError, FileLister, FileStorage};

/// Project folders on a locally mounted volume.
///
/// Layout: `<data_root>/PSO_<project>/files/<project>+` holds staging,
/// `<data_root>/PSO_<project>/files/<project>` holds frozen files and
/// `<replication_root>/projects/<project>` mirrors the frozen tree.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    data_root: PathBuf,
    replication: Option<(PathBuf, String)>,
}

impl LocalFileSystem {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            replication: None,
        }
    }

    pub fn with_replication(mut self, root: impl Into<PathBuf>, backend: impl Into<String>) -> Self {
        self.replication = Some((root.into(), backend.into()));
        self
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        let fs = Self::new(&config.data_root);
        if config.replication_enabled {
            fs.with_replication(&config.replication_root, &config.replication_backend)
        } else {
            fs
        }
    }

    fn area_root(&self, project: &str, area: Area) -> PathBuf {
        let folder = match area {
            Area::Staging => format!("{project}{STAGING_FOLDER_SUFFIX}"),
            Area::Frozen => project.to_string(),
        };
        self.data_root
            .join(format!("{PROJECT_USER_PREFIX}{project}"))
            .join("files")
            .join(folder)
    }

    fn area_path(&self, project: &str, area: Area, pathname: &str) -> PathBuf {
        join_pathname(self.area_root(project, area), pathname)
    }

    fn replica_path(&self, project: &str, pathname: &str) -> Option<PathBuf> {
        self.replication
            .as_ref()
            .map(|(root, _)| join_pathname(root.join("projects").join(project), pathname))
    }

    async fn move_file(from: PathBuf, to: PathBuf) -> Result<(), FileError> {
        if !exists(&from).await? {
            // A previous attempt already moved it.
            if exists(&to).await? {
                return Ok(());
            }
            return Err(FileError::NotFound(from.display().to_string()));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(&from, e))?;
        debug!(from = %from.display(), to = %to.display(), "Moved file");
        Ok(())
    }
}

fn join_pathname(root: PathBuf, pathname: &str) -> PathBuf {
    let relative = pathname.trim_start_matches('/');
    if relative.is_empty() {
        root
    } else {
        root.join(relative)
    }
}

fn io_error(path: &Path, err: io::Error) -> FileError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        io::ErrorKind::NotFound => FileError::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => FileError::Permanent(message),
        _ => FileError::Transient(message),
    }
}

async fn exists(path: &Path) -> Result<bool, FileError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| io_error(path, e))
}

#[cfg(unix)]
fn node_of(_path: &Path, metadata: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino() as i64
}

#[cfg(not(unix))]
fn node_of(path: &Path, _metadata: &fs::Metadata) -> i64 {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 1) as i64
}

fn modified_of(metadata: &fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

fn walk_files(root: &Path, scope: &Path) -> Result<Vec<FileEntry>, FileError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(scope).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(scope).to_path_buf();
            match e.into_io_error() {
                Some(err) => io_error(&path, err),
                None => FileError::Permanent(format!("{}: filesystem loop", path.display())),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| {
            FileError::Transient(format!("{}: {e}", path.display()))
        })?;
        let relative = path.strip_prefix(root).map_err(|_| {
            FileError::Permanent(format!("{} is outside {}", path.display(), root.display()))
        })?;
        let mut pathname = String::new();
        for part in relative.components() {
            let part = part.as_os_str().to_str().ok_or_else(|| {
                FileError::Permanent(format!(
                    "Pathname is not valid UTF-8: {}",
                    path.display()
                ))
            })?;
            pathname.push('/');
            pathname.push_str(part);
        }
        entries.push(FileEntry {
            node: node_of(path, &metadata),
            pathname,
            size: metadata.len(),
            modified: modified_of(&metadata),
            checksum: None,
        });
    }
    entries.sort_by(|a, b| a.pathname.cmp(&b.pathname));
    Ok(entries)
}

fn hash_file(path: &Path) -> Result<FileDigest, FileError> {
    let mut file = fs::File::open(path).map_err(|e| io_error(path, e))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(|e| io_error(path, e))?;
    Ok(FileDigest {
        size,
        checksum: hex::encode(hasher.finalize()),
    })
}

fn prune_empty(area_root: &Path, scope: &Path) {
    for entry in WalkDir::new(scope)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() && entry.path() != area_root {
            // Fails on non-empty folders, which is what we want.
            let _ = fs::remove_dir(entry.path());
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, FileError>
where
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FileError::Transient(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl FileLister for LocalFileSystem {
    async fn list_files(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<Vec<FileEntry>, FileError> {
        let root = self.area_root(project, area);
        let scope = self.area_path(project, area, pathname);
        if !exists(&scope).await? {
            return Ok(Vec::new());
        }
        blocking(move || walk_files(&root, &scope)).await
    }

    async fn stat(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<Option<(i64, NodeType)>, FileError> {
        let path = self.area_path(project, area, pathname);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                let nodetype = if metadata.is_dir() {
                    NodeType::Folder
                } else {
                    NodeType::File
                };
                Ok(Some((node_of(&path, &metadata), nodetype)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[async_trait]
impl FileStorage for LocalFileSystem {
    async fn digest(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<FileDigest, FileError> {
        let path = self.area_path(project, area, pathname);
        blocking(move || hash_file(&path)).await
    }

    async fn freeze(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        Self::move_file(
            self.area_path(project, Area::Staging, pathname),
            self.area_path(project, Area::Frozen, pathname),
        )
        .await
    }

    async fn replicate(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        let Some(target) = self.replica_path(project, pathname) else {
            return Ok(());
        };
        let source = self.area_path(project, Area::Frozen, pathname);
        let size = tokio::fs::metadata(&source)
            .await
            .map_err(|e| io_error(&source, e))?
            .len();
        if let Ok(existing) = tokio::fs::metadata(&target).await {
            if existing.len() == size {
                return Ok(());
            }
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        let mut partial_name = target.file_name().unwrap_or_default().to_os_string();
        partial_name.push(".partial");
        let partial = target.with_file_name(partial_name);
        tokio::fs::copy(&source, &partial)
            .await
            .map_err(|e| io_error(&source, e))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| io_error(&target, e))?;
        debug!(project, pathname, "Replicated file");
        Ok(())
    }

    async fn unfreeze(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        Self::move_file(
            self.area_path(project, Area::Frozen, pathname),
            self.area_path(project, Area::Staging, pathname),
        )
        .await
    }

    async fn delete(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        let path = self.area_path(project, Area::Frozen, pathname);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn remove_replica(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        let Some(path) = self.replica_path(project, pathname) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn prune(&self, project: &str, area: Area, pathname: &str) -> Result<(), FileError> {
        let root = self.area_root(project, area);
        let scope = self.area_path(project, area, pathname);
        if !exists(&scope).await? {
            return Ok(());
        }
        blocking(move || {
            prune_empty(&root, &scope);
            Ok(())
        })
        .await
    }

    fn replication_backend(&self) -> Option<String> {
        self.replication.as_ref().map(|(_, backend)| backend.clone())
    }
}
