//! Data change log service.
//!
//! Validates and normalises change events before they are appended to the
//! [`DataChangeStore`], and answers the queries synchronization clients use to
//! compute what happened in a project since their last sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use ida_freeze_config::scope::parent;
use ida_freeze_config::{
    now_utc, parse_timestamp, ChangeKind, ChangeMode, DataChangeQuery, DataChangeRecord,
    DataChangeStore, StoreResult, PROJECT_USER_PREFIX, SERVICE_USER, STAGING_FOLDER_SUFFIX,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FreezeError, Result};

/// Highest sequence number currently in a project's journal.
fn head_sequence(store: &dyn DataChangeStore, project: &str) -> StoreResult<i64> {
    let query = DataChangeQuery::for_project(project).after(0).limit(1);
    Ok(store.query_changes(&query)?.first().map_or(0, |c| c.seq))
}

/// A change event as submitted by a client or emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataChange {
    pub project: String,
    pub user: String,
    pub change: ChangeKind,
    pub pathname: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub mode: Option<ChangeMode>,
    /// ISO 8601 UTC timestamp ending in `Z`; defaults to now.
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl NewDataChange {
    pub fn new(
        project: impl Into<String>,
        user: impl Into<String>,
        change: ChangeKind,
        pathname: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            user: user.into(),
            change,
            pathname: pathname.into(),
            target: None,
            mode: None,
            timestamp: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_mode(mut self, mode: ChangeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn at(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// Optional filters for "last change" and "recent changes" queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub user: Option<String>,
    pub change: Option<ChangeKind>,
    pub mode: Option<ChangeMode>,
}

impl ChangeFilter {
    fn apply(&self, mut query: DataChangeQuery) -> DataChangeQuery {
        if let Some(user) = &self.user {
            query = query.with_user(user.clone());
        }
        if let Some(change) = self.change {
            query = query.with_change(change);
        }
        if let Some(mode) = self.mode {
            query = query.with_mode(mode);
        }
        query
    }

    /// True if the synthetic migration `init` record satisfies this filter.
    fn admits_migration_record(&self) -> bool {
        self.user.as_deref().map_or(true, |u| u == SERVICE_USER)
            && self.change.map_or(true, |c| c == ChangeKind::Init)
            && self.mode.map_or(true, |m| m == ChangeMode::System)
    }
}

/// Administrators, service identities and anonymous system jobs are all
/// recorded as the service user.
pub fn recorded_user(user: &str) -> String {
    let user = user.trim();
    if user.is_empty() || user == "admin" || user == "--" || user.starts_with(PROJECT_USER_PREFIX)
    {
        SERVICE_USER.to_string()
    } else {
        user.to_string()
    }
}

fn within_project_roots(project: &str, pathname: &str) -> bool {
    pathname.starts_with(&format!("/{project}/"))
        || pathname.starts_with(&format!("/{project}{STAGING_FOLDER_SUFFIX}/"))
}

fn parse_change_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if !value.ends_with('Z') {
        return Err(FreezeError::InvalidRequest(format!(
            "Specified timestamp {value} is not an ISO UTC timestamp"
        )));
    }
    parse_timestamp(value).map_err(|e| {
        FreezeError::InvalidRequest(format!("Specified timestamp {value} is invalid: {e}"))
    })
}

#[derive(Clone)]
pub struct DataChangeLog {
    store: Arc<dyn DataChangeStore>,
}

impl DataChangeLog {
    pub fn new(store: Arc<dyn DataChangeStore>) -> Self {
        Self { store }
    }

    /// Validate, normalise and append a change.
    pub fn record(&self, change: NewDataChange) -> Result<DataChangeRecord> {
        let NewDataChange {
            project,
            user,
            mut change,
            pathname,
            target,
            mode,
            timestamp,
        } = change;

        if project.trim().is_empty() {
            return Err(FreezeError::InvalidRequest("Missing project".to_string()));
        }
        if pathname.trim().is_empty() {
            return Err(FreezeError::InvalidRequest("Missing pathname".to_string()));
        }
        match (&target, change.requires_target()) {
            (None, true) => {
                return Err(FreezeError::InvalidRequest(format!(
                    "Missing target pathname for {change} change"
                )))
            }
            (Some(_), false) => {
                return Err(FreezeError::InvalidRequest(format!(
                    "Target pathname not allowed for {change} change"
                )))
            }
            _ => {}
        }
        if change != ChangeKind::Init {
            if !within_project_roots(&project, &pathname) {
                return Err(FreezeError::InvalidRequest(format!(
                    "Pathname {pathname} is not within project {project}"
                )));
            }
            if let Some(target) = &target {
                if !within_project_roots(&project, target) {
                    return Err(FreezeError::InvalidRequest(format!(
                        "Target pathname {target} is not within project {project}"
                    )));
                }
            }
        }
        if change == ChangeKind::Rename {
            if let Some(target) = &target {
                if parent(&pathname) != parent(target) {
                    change = ChangeKind::Move;
                }
            }
        }

        let timestamp = match timestamp.as_deref() {
            Some(value) => parse_change_timestamp(value)?,
            None => now_utc(),
        };

        let record = DataChangeRecord {
            seq: 0,
            timestamp,
            project,
            user: recorded_user(&user),
            change,
            pathname,
            target,
            mode: mode.unwrap_or_default(),
        };
        let record = self.store.append_change(&record)?;
        debug!(
            project = %record.project,
            user = %record.user,
            change = %record.change,
            pathname = %record.pathname,
            mode = %record.mode,
            "recordDataChange"
        );
        Ok(record)
    }

    /// Most recent matching change, or the migration record if none exists.
    pub fn last_change(&self, project: &str, filter: &ChangeFilter) -> Result<DataChangeRecord> {
        let query = filter.apply(DataChangeQuery::for_project(project)).limit(1);
        let found = self.store.query_changes(&query)?.into_iter().next();
        Ok(found.unwrap_or_else(|| DataChangeRecord::migration_init(project)))
    }

    /// The `limit` most recent matching changes, most recent first.
    pub fn changes(
        &self,
        project: &str,
        filter: &ChangeFilter,
        limit: Option<usize>,
    ) -> Result<Vec<DataChangeRecord>> {
        let mut query = filter.apply(DataChangeQuery::for_project(project));
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let changes = self.store.query_changes(&query)?;
        if changes.is_empty() && filter.admits_migration_record() {
            return Ok(vec![DataChangeRecord::migration_init(project)]);
        }
        Ok(changes)
    }

    /// Changes strictly after `since`, oldest first.
    pub fn since(
        &self,
        project: &str,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<DataChangeRecord>> {
        let mut query = DataChangeQuery::for_project(project).since(since).ascending();
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        Ok(self.store.query_changes(&query)?)
    }

    /// When the project was added: its oldest `init` change, else the migration.
    pub fn init_details(&self, project: &str) -> Result<DataChangeRecord> {
        let query = DataChangeQuery::for_project(project)
            .with_change(ChangeKind::Init)
            .ascending()
            .limit(1);
        let found = self.store.query_changes(&query)?.into_iter().next();
        Ok(found.unwrap_or_else(|| DataChangeRecord::migration_init(project)))
    }

    /// Last `add` of a project relative pathname in the staging area.
    pub fn last_add(&self, project: &str, pathname: &str) -> Result<Option<DataChangeRecord>> {
        let staging = format!("/{project}{STAGING_FOLDER_SUFFIX}{pathname}");
        let query = DataChangeQuery::for_project(project)
            .with_change(ChangeKind::Add)
            .with_pathname(staging)
            .limit(1);
        Ok(self.store.query_changes(&query)?.into_iter().next())
    }

    /// Yield the changes after `since`, then every change appended from
    /// then on in append order, forever.
    ///
    /// After the first poll the cursor is the journal sequence, so changes
    /// appended later are delivered whatever their timestamp.
    pub fn watch(
        &self,
        project: String,
        since: DateTime<Utc>,
        poll: Duration,
    ) -> impl Stream<Item = DataChangeRecord> + Send + 'static {
        let store = self.store.clone();
        async_stream::stream! {
            let mut cursor: Option<i64> = None;
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let polled = match cursor {
                    Some(seq) => store
                        .query_changes(&DataChangeQuery::for_project(project.clone()).after(seq).ascending())
                        .map(|changes| (seq, changes)),
                    None => head_sequence(store.as_ref(), &project).and_then(|head| {
                        store
                            .query_changes(&DataChangeQuery::for_project(project.clone()).since(since).ascending())
                            .map(|changes| (head, changes))
                    }),
                };
                match polled {
                    Ok((mut next, changes)) => {
                        for change in changes {
                            next = next.max(change.seq);
                            yield change;
                        }
                        cursor = Some(next);
                    }
                    Err(e) => {
                        warn!(project = %project, "Data change poll failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use ida_freeze_config::{format_timestamp, Persistence};

    fn log() -> DataChangeLog {
        DataChangeLog::new(Arc::new(Persistence::in_memory().unwrap()))
    }

    #[test]
    fn test_record_normalises_user_and_mode() {
        let log = log();
        let record = log
            .record(NewDataChange::new("p1", "PSO_p1", ChangeKind::Add, "/p1+/a.txt"))
            .unwrap();
        assert_eq!(record.user, SERVICE_USER);
        assert_eq!(record.mode, ChangeMode::Api);

        let record = log
            .record(
                NewDataChange::new("p1", "alice", ChangeKind::Modify, "/p1+/a.txt")
                    .with_mode(ChangeMode::Gui),
            )
            .unwrap();
        assert_eq!(record.user, "alice");
        assert_eq!(record.mode, ChangeMode::Gui);
        assert_eq!(recorded_user("--"), SERVICE_USER);
        assert_eq!(recorded_user("admin"), SERVICE_USER);
    }

    #[test]
    fn test_rename_across_folders_becomes_move() {
        let log = log();
        let same = log
            .record(
                NewDataChange::new("p1", "alice", ChangeKind::Rename, "/p1+/d/a")
                    .with_target("/p1+/d/b"),
            )
            .unwrap();
        assert_eq!(same.change, ChangeKind::Rename);

        let moved = log
            .record(
                NewDataChange::new("p1", "alice", ChangeKind::Rename, "/p1+/d/a")
                    .with_target("/p1+/e/a"),
            )
            .unwrap();
        assert_eq!(moved.change, ChangeKind::Move);
    }

    #[test]
    fn test_record_validation() {
        let log = log();
        let missing_target = log.record(NewDataChange::new("p1", "a", ChangeKind::Copy, "/p1+/a"));
        assert!(matches!(missing_target, Err(FreezeError::InvalidRequest(_))));

        let stray_target = log.record(
            NewDataChange::new("p1", "a", ChangeKind::Add, "/p1+/a").with_target("/p1+/b"),
        );
        assert!(matches!(stray_target, Err(FreezeError::InvalidRequest(_))));

        let outside = log.record(NewDataChange::new("p1", "a", ChangeKind::Add, "/p2+/a"));
        assert!(matches!(outside, Err(FreezeError::InvalidRequest(_))));

        let prefix_only = log.record(NewDataChange::new("p1", "a", ChangeKind::Add, "/p1x/a"));
        assert!(matches!(prefix_only, Err(FreezeError::InvalidRequest(_))));

        let local_time = log.record(
            NewDataChange::new("p1", "a", ChangeKind::Add, "/p1+/a").at("2024-01-01T10:00:00+02:00"),
        );
        assert!(matches!(local_time, Err(FreezeError::InvalidRequest(_))));

        let init = log
            .record(NewDataChange::new("p1", "admin", ChangeKind::Init, "/").at("2024-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(format_timestamp(&init.timestamp), "2024-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_migration_record_fallbacks() {
        let log = log();
        let last = log.last_change("p1", &ChangeFilter::default()).unwrap();
        assert_eq!(last.change, ChangeKind::Init);
        assert_eq!(last.mode, ChangeMode::System);

        let init = log.init_details("p1").unwrap();
        assert_eq!(init, DataChangeRecord::migration_init("p1"));

        let none = log
            .changes(
                "p1",
                &ChangeFilter {
                    user: Some("alice".into()),
                    ..ChangeFilter::default()
                },
                None,
            )
            .unwrap();
        assert!(none.is_empty());

        let fallback = log.changes("p1", &ChangeFilter::default(), Some(5)).unwrap();
        assert_eq!(fallback, vec![DataChangeRecord::migration_init("p1")]);
    }

    #[test]
    fn test_queries() {
        let log = log();
        log.record(NewDataChange::new("p1", "alice", ChangeKind::Add, "/p1+/a").at("2024-01-01T00:00:01Z"))
            .unwrap();
        log.record(NewDataChange::new("p1", "bob", ChangeKind::Add, "/p1+/b").at("2024-01-01T00:00:02Z"))
            .unwrap();
        log.record(
            NewDataChange::new("p1", "alice", ChangeKind::Delete, "/p1+/a").at("2024-01-01T00:00:03Z"),
        )
        .unwrap();

        let last = log.last_change("p1", &ChangeFilter::default()).unwrap();
        assert_eq!(last.change, ChangeKind::Delete);

        let last_by_bob = log
            .last_change(
                "p1",
                &ChangeFilter {
                    user: Some("bob".into()),
                    ..ChangeFilter::default()
                },
            )
            .unwrap();
        assert_eq!(last_by_bob.pathname, "/p1+/b");

        let recent = log.changes("p1", &ChangeFilter::default(), Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].change, ChangeKind::Delete);

        let since = log
            .since("p1", parse_timestamp("2024-01-01T00:00:01Z").unwrap(), None)
            .unwrap();
        let paths: Vec<_> = since.iter().map(|c| c.pathname.as_str()).collect();
        assert_eq!(paths, vec!["/p1+/b", "/p1+/a"]);

        let add = log.last_add("p1", "/a").unwrap().unwrap();
        assert_eq!(add.user, "alice");
        assert!(log.last_add("p1", "/c").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_yields_new_changes() {
        let log = log();
        let start = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        log.record(NewDataChange::new("p1", "alice", ChangeKind::Add, "/p1+/a").at("2024-01-01T00:00:01Z"))
            .unwrap();

        let stream = log.watch("p1".to_string(), start, Duration::from_millis(10));
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        assert_eq!(first.pathname, "/p1+/a");

        log.record(NewDataChange::new("p1", "alice", ChangeKind::Add, "/p1+/b").at("2024-01-01T00:00:02Z"))
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.pathname, "/p1+/b");
    }

    #[tokio::test]
    async fn test_watch_delivers_changes_with_equal_or_earlier_timestamps() {
        let log = log();
        let start = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        log.record(NewDataChange::new("p1", "alice", ChangeKind::Add, "/p1+/a").at("2024-01-01T00:00:05Z"))
            .unwrap();

        let stream = log.watch("p1".to_string(), start, Duration::from_millis(10));
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        assert_eq!(first.pathname, "/p1+/a");

        log.record(NewDataChange::new("p1", "bob", ChangeKind::Add, "/p1+/b").at("2024-01-01T00:00:05Z"))
            .unwrap();
        log.record(NewDataChange::new("p1", "bob", ChangeKind::Add, "/p1+/c").at("2024-01-01T00:00:02Z"))
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let change = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(change.pathname);
        }
        assert_eq!(seen, vec!["/p1+/b", "/p1+/c"]);
    }
}
