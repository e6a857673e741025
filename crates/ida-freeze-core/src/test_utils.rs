//! Test fixtures: an in-memory file system with fault injection and an
//! engine wired to in-memory DuckDB.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ida_freeze_config::{now_utc, NodeType, Persistence};
use sha2::{Digest, Sha256};

use crate::engine::{ActionEngine, EngineSettings, RetryPolicy, Stores};
use crate::files::{Area, FileDigest, FileEntry, FileError, FileLister, FileStorage};
use crate::suspension::{StaticSuspension, SuspensionSwitch};

type FileKey = (String, String);

#[derive(Debug, Clone)]
struct MemFile {
    node: i64,
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    next_node: i64,
    staging: BTreeMap<FileKey, MemFile>,
    frozen: BTreeMap<FileKey, MemFile>,
    folders: BTreeSet<(String, Area, String)>,
    folder_nodes: HashMap<(String, Area, String), i64>,
    replicas: BTreeSet<FileKey>,
    transient: HashMap<FileKey, u32>,
    permanent: HashMap<FileKey, String>,
    listed_checksums: HashMap<FileKey, String>,
    listed_sizes: HashMap<FileKey, u64>,
    delays: HashMap<FileKey, Duration>,
    suspend_on_access: HashMap<FileKey, Arc<StaticSuspension>>,
    calls: HashMap<&'static str, usize>,
}

impl MemoryState {
    fn area(&mut self, area: Area) -> &mut BTreeMap<FileKey, MemFile> {
        match area {
            Area::Staging => &mut self.staging,
            Area::Frozen => &mut self.frozen,
        }
    }

    fn next_node(&mut self) -> i64 {
        self.next_node += 1;
        self.next_node
    }

    fn inject(&mut self, op: &'static str, key: &FileKey) -> Result<(), FileError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(gate) = self.suspend_on_access.remove(key) {
            let _ = gate.set_project_suspended(&key.0, true);
        }
        if let Some(error) = self.permanent.get(key) {
            return Err(FileError::Permanent(error.clone()));
        }
        if let Some(remaining) = self.transient.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FileError::Transient(format!("{} busy", key.1)));
            }
        }
        Ok(())
    }
}

fn in_scope(scope: &str, pathname: &str) -> bool {
    scope == "/" || pathname == scope || pathname.starts_with(&format!("{scope}/"))
}

fn key(project: &str, pathname: &str) -> FileKey {
    (project.to_string(), pathname.to_string())
}

/// In-memory staging, frozen and replica trees.
///
/// Fault injection is keyed by project and pathname and applies to every
/// storage operation on that file.
#[derive(Default)]
pub struct MemoryFileSystem {
    state: Mutex<MemoryState>,
    replication: Option<String>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            replication: Some("memory".to_string()),
        }
    }

    pub fn without_replication() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Put a file into staging, replacing any previous one. Returns its node.
    pub fn add_staged(&self, project: &str, pathname: &str, content: &[u8]) -> i64 {
        let mut state = self.state();
        let node = state.next_node();
        state.staging.insert(
            key(project, pathname),
            MemFile {
                node,
                content: content.to_vec(),
                modified: now_utc(),
            },
        );
        node
    }

    pub fn add_folder(&self, project: &str, area: Area, pathname: &str) {
        self.state()
            .folders
            .insert((project.to_string(), area, pathname.to_string()));
    }

    pub fn fail_transiently(&self, project: &str, pathname: &str, times: u32) {
        self.state().transient.insert(key(project, pathname), times);
    }

    pub fn fail_permanently(&self, project: &str, pathname: &str, error: &str) {
        self.state()
            .permanent
            .insert(key(project, pathname), error.to_string());
    }

    /// Make listings report a checksum the stored content does not have.
    pub fn corrupt_checksum(&self, project: &str, pathname: &str) {
        self.state()
            .listed_checksums
            .insert(key(project, pathname), format!("sha256:{}", "0".repeat(64)));
    }

    /// Make listings report `size` instead of the stored size.
    pub fn misreport_size(&self, project: &str, pathname: &str, size: u64) {
        self.state().listed_sizes.insert(key(project, pathname), size);
    }

    /// Delay every digest of the file.
    pub fn delay(&self, project: &str, pathname: &str, delay: Duration) {
        self.state().delays.insert(key(project, pathname), delay);
    }

    /// Suspend the project the first time the file is touched.
    pub fn suspend_on_access(&self, project: &str, pathname: &str, gate: Arc<StaticSuspension>) {
        self.state()
            .suspend_on_access
            .insert(key(project, pathname), gate);
    }

    pub fn clear_faults(&self, project: &str, pathname: &str) {
        let k = key(project, pathname);
        let mut state = self.state();
        state.transient.remove(&k);
        state.permanent.remove(&k);
        state.listed_checksums.remove(&k);
        state.listed_sizes.remove(&k);
        state.delays.remove(&k);
    }

    /// Number of calls of a storage operation, by name.
    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn is_staged(&self, project: &str, pathname: &str) -> bool {
        self.state().staging.contains_key(&key(project, pathname))
    }

    pub fn is_frozen(&self, project: &str, pathname: &str) -> bool {
        self.state().frozen.contains_key(&key(project, pathname))
    }

    pub fn is_replicated(&self, project: &str, pathname: &str) -> bool {
        self.state().replicas.contains(&key(project, pathname))
    }

    fn move_between(&self, project: &str, pathname: &str, from: Area, to: Area, op: &'static str) -> Result<(), FileError> {
        let k = key(project, pathname);
        let mut state = self.state();
        state.inject(op, &k)?;
        match state.area(from).remove(&k) {
            Some(file) => {
                state.area(to).insert(k, file);
                Ok(())
            }
            None if state.area(to).contains_key(&k) => Ok(()),
            None => Err(FileError::NotFound(pathname.to_string())),
        }
    }
}

#[async_trait]
impl FileLister for MemoryFileSystem {
    async fn list_files(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<Vec<FileEntry>, FileError> {
        let mut state = self.state();
        *state.calls.entry("list_files").or_default() += 1;
        let files: Vec<(FileKey, MemFile)> = state
            .area(area)
            .iter()
            .filter(|((p, path), _)| p == project && in_scope(pathname, path))
            .map(|(k, f)| (k.clone(), f.clone()))
            .collect();
        Ok(files
            .into_iter()
            .map(|(k, file)| FileEntry {
                node: file.node,
                size: state
                    .listed_sizes
                    .get(&k)
                    .copied()
                    .unwrap_or(file.content.len() as u64),
                modified: Some(file.modified),
                checksum: state.listed_checksums.get(&k).cloned(),
                pathname: k.1,
            })
            .collect())
    }

    async fn stat(
        &self,
        project: &str,
        area: Area,
        pathname: &str,
    ) -> Result<Option<(i64, NodeType)>, FileError> {
        let mut state = self.state();
        if let Some(file) = state.area(area).get(&key(project, pathname)) {
            return Ok(Some((file.node, NodeType::File)));
        }
        let folder = (project.to_string(), area, pathname.to_string());
        let has_children = state
            .area(area)
            .keys()
            .any(|(p, path)| p == project && path != pathname && in_scope(pathname, path));
        if !has_children && !state.folders.contains(&folder) {
            return Ok(None);
        }
        if let Some(node) = state.folder_nodes.get(&folder) {
            return Ok(Some((*node, NodeType::Folder)));
        }
        let node = state.next_node();
        state.folder_nodes.insert(folder, node);
        Ok(Some((node, NodeType::Folder)))
    }
}

#[async_trait]
impl FileStorage for MemoryFileSystem {
    async fn digest(&self, project: &str, area: Area, pathname: &str) -> Result<FileDigest, FileError> {
        let k = key(project, pathname);
        let delay = {
            let mut state = self.state();
            state.inject("digest", &k)?;
            state.delays.get(&k).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        let file = state
            .area(area)
            .get(&k)
            .ok_or_else(|| FileError::NotFound(pathname.to_string()))?;
        Ok(FileDigest {
            size: file.content.len() as u64,
            checksum: hex::encode(Sha256::digest(&file.content)),
        })
    }

    async fn freeze(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        self.move_between(project, pathname, Area::Staging, Area::Frozen, "freeze")
    }

    async fn replicate(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        if self.replication.is_none() {
            return Ok(());
        }
        let k = key(project, pathname);
        let mut state = self.state();
        state.inject("replicate", &k)?;
        if !state.frozen.contains_key(&k) {
            return Err(FileError::NotFound(pathname.to_string()));
        }
        state.replicas.insert(k);
        Ok(())
    }

    async fn unfreeze(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        self.move_between(project, pathname, Area::Frozen, Area::Staging, "unfreeze")
    }

    async fn delete(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        let k = key(project, pathname);
        let mut state = self.state();
        state.inject("delete", &k)?;
        state.frozen.remove(&k);
        Ok(())
    }

    async fn remove_replica(&self, project: &str, pathname: &str) -> Result<(), FileError> {
        let k = key(project, pathname);
        let mut state = self.state();
        state.inject("remove_replica", &k)?;
        state.replicas.remove(&k);
        Ok(())
    }

    async fn prune(&self, project: &str, area: Area, pathname: &str) -> Result<(), FileError> {
        let mut state = self.state();
        *state.calls.entry("prune").or_default() += 1;
        state
            .folders
            .retain(|(p, a, path)| !(p == project && *a == area && in_scope(pathname, path)));
        Ok(())
    }

    fn replication_backend(&self) -> Option<String> {
        self.replication.clone()
    }
}

/// An engine over in-memory DuckDB, [`MemoryFileSystem`] and [`StaticSuspension`].
pub struct TestHarness {
    pub engine: ActionEngine,
    pub fs: Arc<MemoryFileSystem>,
    pub suspension: Arc<StaticSuspension>,
    pub persistence: Persistence,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(Self::fast_settings())
    }

    /// Default settings with millisecond backoff.
    pub fn fast_settings() -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..EngineSettings::default()
        }
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(Arc::new(MemoryFileSystem::new()), settings)
    }

    pub fn build(fs: Arc<MemoryFileSystem>, settings: EngineSettings) -> Self {
        let persistence = Persistence::in_memory().expect("in-memory database");
        let suspension = Arc::new(StaticSuspension::new());
        let engine = ActionEngine::new(
            Stores::from_persistence(persistence.clone()),
            fs.clone(),
            fs.clone(),
            suspension.clone(),
            settings,
        )
        .with_worker_id("w1");
        Self {
            engine,
            fs,
            suspension,
            persistence,
        }
    }

    /// A second engine sharing this harness' stores, files and flags.
    pub fn engine_for_worker(&self, worker_id: &str, settings: EngineSettings) -> ActionEngine {
        ActionEngine::new(
            Stores::from_persistence(self.persistence.clone()),
            self.fs.clone(),
            self.fs.clone(),
            self.suspension.clone(),
            settings,
        )
        .with_worker_id(worker_id)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspension::SuspensionOracle;

    #[tokio::test]
    async fn test_listing_and_stat() {
        let fs = MemoryFileSystem::new();
        let a = fs.add_staged("p1", "/data/a", b"abc");
        fs.add_staged("p1", "/database", b"x");

        let files = fs.list_files("p1", Area::Staging, "/data").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].node, a);
        assert_eq!(files[0].size, 3);

        let root = fs.list_files("p1", Area::Staging, "/").await.unwrap();
        assert_eq!(root.len(), 2);

        assert!(matches!(
            fs.stat("p1", Area::Staging, "/data").await.unwrap(),
            Some((_, NodeType::Folder))
        ));
        assert_eq!(
            fs.stat("p1", Area::Staging, "/data/a").await.unwrap(),
            Some((a, NodeType::File))
        );
        assert_eq!(fs.stat("p1", Area::Frozen, "/data").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_faults() {
        let fs = MemoryFileSystem::new();
        fs.add_staged("p1", "/a", b"abc");
        fs.fail_transiently("p1", "/a", 1);
        assert!(matches!(
            fs.digest("p1", Area::Staging, "/a").await,
            Err(FileError::Transient(_))
        ));
        let digest = fs.digest("p1", Area::Staging, "/a").await.unwrap();
        assert_eq!(
            digest.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        fs.fail_permanently("p1", "/a", "broken");
        assert_eq!(
            fs.freeze("p1", "/a").await,
            Err(FileError::Permanent("broken".to_string()))
        );
        fs.clear_faults("p1", "/a");
        fs.freeze("p1", "/a").await.unwrap();
        fs.freeze("p1", "/a").await.unwrap();
        assert!(fs.is_frozen("p1", "/a"));
        assert!(!fs.is_staged("p1", "/a"));
        assert_eq!(fs.calls("digest"), 2);
    }

    #[tokio::test]
    async fn test_suspend_on_access_fires_once() {
        let fs = MemoryFileSystem::new();
        let gate = Arc::new(StaticSuspension::new());
        fs.add_staged("p1", "/a", b"a");
        fs.suspend_on_access("p1", "/a", gate.clone());
        fs.digest("p1", Area::Staging, "/a").await.unwrap();
        assert!(gate.project_suspended("p1"));

        gate.set_project_suspended("p1", false).unwrap();
        fs.digest("p1", Area::Staging, "/a").await.unwrap();
        assert!(!gate.project_suspended("p1"));
    }
}
