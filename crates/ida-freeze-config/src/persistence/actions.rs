use chrono::{DateTime, Utc};
use duckdb::{params, params_from_iter, Connection, Row};

use super::files::{find_by_action_node_in, insert_file_in, update_file_in};
use super::{opt_ts, parse_opt_ts, ts, Persistence};
use crate::scope::scopes_intersect;
use crate::store::{ActionStore, FileCommit, FileWrite, StoreError, StoreResult};
use crate::types::{parse_timestamp, ActionRecord, ActionStatus, Lease};

const ACTION_COLUMNS: &str = r#"pid, action, project, "user", pathname, node, nodetype, filecount,
    initiated, storage, pids, checksums, metadata, replication, progress, completed, failed,
    cleared, error, retry, retrying, cancel_requested, lease, heartbeat, version"#;

/// Raw column values of an action row.
struct ActionRow {
    pid: String,
    action: String,
    project: String,
    user: String,
    pathname: String,
    node: i64,
    nodetype: Option<String>,
    filecount: Option<i64>,
    initiated: String,
    storage: Option<String>,
    pids: String,
    checksums: String,
    metadata: String,
    replication: String,
    progress: String,
    completed: Option<String>,
    failed: Option<String>,
    cleared: Option<String>,
    error: Option<String>,
    retry: Option<String>,
    retrying: Option<String>,
    cancel_requested: Option<String>,
    lease: Option<String>,
    heartbeat: Option<String>,
    version: i64,
}

impl ActionRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            pid: row.get(0)?,
            action: row.get(1)?,
            project: row.get(2)?,
            user: row.get(3)?,
            pathname: row.get(4)?,
            node: row.get(5)?,
            nodetype: row.get(6)?,
            filecount: row.get(7)?,
            initiated: row.get(8)?,
            storage: row.get(9)?,
            pids: row.get(10)?,
            checksums: row.get(11)?,
            metadata: row.get(12)?,
            replication: row.get(13)?,
            progress: row.get(14)?,
            completed: row.get(15)?,
            failed: row.get(16)?,
            cleared: row.get(17)?,
            error: row.get(18)?,
            retry: row.get(19)?,
            retrying: row.get(20)?,
            cancel_requested: row.get(21)?,
            lease: row.get(22)?,
            heartbeat: row.get(23)?,
            version: row.get(24)?,
        })
    }

    fn into_record(self) -> StoreResult<ActionRecord> {
        let lease: Option<Lease> = match self.lease {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };

        Ok(ActionRecord {
            pid: self.pid,
            action: self.action.parse()?,
            project: self.project,
            user: self.user,
            pathname: self.pathname,
            node: self.node,
            nodetype: self.nodetype.map(|t| t.parse()).transpose()?,
            filecount: self.filecount.map(|c| c.max(0) as u64),
            initiated: parse_timestamp(&self.initiated)?,
            storage: self.storage,
            pids: serde_json::from_str(&self.pids)?,
            checksums: serde_json::from_str(&self.checksums)?,
            metadata: serde_json::from_str(&self.metadata)?,
            replication: serde_json::from_str(&self.replication)?,
            progress: serde_json::from_str(&self.progress)?,
            completed: parse_opt_ts(self.completed)?,
            failed: parse_opt_ts(self.failed)?,
            cleared: parse_opt_ts(self.cleared)?,
            error: self.error,
            retry: self.retry,
            retrying: self.retrying,
            cancel_requested: parse_opt_ts(self.cancel_requested)?,
            lease,
            heartbeat: parse_opt_ts(self.heartbeat)?,
            version: self.version,
        })
    }
}

fn status_condition(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Pending => "completed IS NULL AND failed IS NULL AND cleared IS NULL",
        ActionStatus::Completed => "completed IS NOT NULL AND cleared IS NULL",
        ActionStatus::Failed => "failed IS NOT NULL AND cleared IS NULL",
        ActionStatus::Cleared => "cleared IS NOT NULL",
        ActionStatus::Incomplete => "completed IS NULL AND cleared IS NULL",
        ActionStatus::Initiating => "filecount IS NULL AND cleared IS NULL",
    }
}

fn status_order(status: Option<ActionStatus>) -> &'static str {
    match status {
        Some(ActionStatus::Completed) => "completed DESC, initiated DESC",
        Some(ActionStatus::Failed) => "failed DESC, initiated DESC",
        Some(ActionStatus::Cleared) => "cleared DESC, initiated DESC",
        _ => "initiated DESC",
    }
}

/// WHERE clause and parameters for a status and project filter.
fn filter_clause(status: Option<ActionStatus>, projects: &[String]) -> (String, Vec<String>) {
    let mut conditions = vec!["1 = 1".to_string()];
    if let Some(status) = status {
        conditions.push(format!("({})", status_condition(status)));
    }
    if !projects.is_empty() {
        let placeholders = vec!["?"; projects.len()].join(", ");
        conditions.push(format!("project IN ({placeholders})"));
    }
    (conditions.join(" AND "), projects.to_vec())
}

fn select_actions(
    conn: &Connection,
    where_clause: &str,
    order: &str,
    values: &[String],
) -> StoreResult<Vec<ActionRecord>> {
    let sql = format!("SELECT {ACTION_COLUMNS} FROM ida_action WHERE {where_clause} ORDER BY {order}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), ActionRow::from_row)?;

    let mut actions = Vec::new();
    for row in rows {
        actions.push(row?.into_record()?);
    }
    Ok(actions)
}

fn get_action_in(conn: &Connection, pid: &str) -> StoreResult<Option<ActionRecord>> {
    let mut actions = select_actions(conn, "pid = ?", "initiated DESC", &[pid.to_string()])?;
    Ok(actions.pop())
}

fn insert_action_in(conn: &Connection, action: &ActionRecord) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO ida_action ({ACTION_COLUMNS}) VALUES \
         (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            action.pid,
            action.action.as_str(),
            action.project,
            action.user,
            action.pathname,
            action.node,
            action.nodetype.map(|t| t.as_str()),
            action.filecount.map(|c| c as i64),
            ts(&action.initiated),
            action.storage,
            serde_json::to_string(&action.pids)?,
            serde_json::to_string(&action.checksums)?,
            serde_json::to_string(&action.metadata)?,
            serde_json::to_string(&action.replication)?,
            serde_json::to_string(&action.progress)?,
            opt_ts(&action.completed),
            opt_ts(&action.failed),
            opt_ts(&action.cleared),
            action.error,
            action.retry,
            action.retrying,
            opt_ts(&action.cancel_requested),
            action.lease.as_ref().map(serde_json::to_string).transpose()?,
            opt_ts(&action.heartbeat),
            action.version,
        ],
    )?;
    Ok(())
}

/// Reject updates that would break the lifecycle timestamp invariants.
fn check_transition(stored: &ActionRecord, next: &ActionRecord) -> StoreResult<()> {
    let pid = &stored.pid;
    if next.completed.is_some() && next.failed.is_some() {
        return Err(StoreError::InvalidState(format!(
            "action {pid} cannot be both completed and failed"
        )));
    }
    for (name, before, after) in [
        ("completed", stored.completed, next.completed),
        ("failed", stored.failed, next.failed),
        ("cleared", stored.cleared, next.cleared),
    ] {
        if before.is_some() && before != after {
            return Err(StoreError::InvalidState(format!(
                "{name} timestamp of action {pid} is already set"
            )));
        }
        if let Some(after) = after {
            if after < stored.initiated {
                return Err(StoreError::InvalidState(format!(
                    "{name} timestamp of action {pid} precedes its initiation"
                )));
            }
        }
    }
    if next.cleared.is_some() && !next.is_terminal() {
        return Err(StoreError::InvalidState(format!(
            "action {pid} must be completed or failed before it is cleared"
        )));
    }
    Ok(())
}

/// Versioned update of every mutable column.
fn update_action_in(conn: &Connection, action: &ActionRecord) -> StoreResult<ActionRecord> {
    let stored = get_action_in(conn, &action.pid)?
        .ok_or_else(|| StoreError::NotFound(format!("action {}", action.pid)))?;
    if stored.version != action.version {
        return Err(StoreError::VersionConflict(action.pid.clone()));
    }
    check_transition(&stored, action)?;

    let mut next = action.clone();
    next.version = action.version + 1;

    let changed = conn.execute(
        "UPDATE ida_action SET node = ?, nodetype = ?, filecount = ?, storage = ?, pids = ?, \
         checksums = ?, metadata = ?, replication = ?, progress = ?, completed = ?, failed = ?, \
         cleared = ?, error = ?, retry = ?, retrying = ?, cancel_requested = ?, lease = ?, \
         heartbeat = ?, version = ? WHERE pid = ? AND version = ?",
        params![
            next.node,
            next.nodetype.map(|t| t.as_str()),
            next.filecount.map(|c| c as i64),
            next.storage,
            serde_json::to_string(&next.pids)?,
            serde_json::to_string(&next.checksums)?,
            serde_json::to_string(&next.metadata)?,
            serde_json::to_string(&next.replication)?,
            serde_json::to_string(&next.progress)?,
            opt_ts(&next.completed),
            opt_ts(&next.failed),
            opt_ts(&next.cleared),
            next.error,
            next.retry,
            next.retrying,
            opt_ts(&next.cancel_requested),
            next.lease.as_ref().map(serde_json::to_string).transpose()?,
            opt_ts(&next.heartbeat),
            next.version,
            next.pid,
            action.version,
        ],
    )?;

    if changed == 0 {
        return Err(StoreError::VersionConflict(action.pid.clone()));
    }
    Ok(next)
}

/// First unresolved action of `project`, other than `exclude`, intersecting `pathname`.
fn conflicting_in(
    conn: &Connection,
    project: &str,
    pathname: &str,
    exclude: Option<&str>,
) -> StoreResult<Vec<ActionRecord>> {
    let where_clause = format!(
        "project = ? AND ({})",
        status_condition(ActionStatus::Incomplete)
    );
    let candidates = select_actions(conn, &where_clause, "initiated ASC", &[project.to_string()])?;
    Ok(candidates
        .into_iter()
        .filter(|a| Some(a.pid.as_str()) != exclude)
        .filter(|a| scopes_intersect(&a.pathname, pathname))
        .collect())
}

fn ensure_no_conflict(
    conn: &Connection,
    action: &ActionRecord,
    exclude: Option<&str>,
) -> StoreResult<()> {
    if let Some(existing) = conflicting_in(conn, &action.project, &action.pathname, exclude)?
        .into_iter()
        .next()
    {
        return Err(StoreError::ScopeConflict {
            project: action.project.clone(),
            scope: action.pathname.clone(),
            pid: existing.pid,
        });
    }
    if get_action_in(conn, &action.pid)?.is_some() {
        return Err(StoreError::InvalidState(format!(
            "action {} already exists",
            action.pid
        )));
    }
    Ok(())
}

impl ActionStore for Persistence {
    fn insert_exclusive(&self, action: &ActionRecord) -> StoreResult<ActionRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_no_conflict(&tx, action, None)?;
        insert_action_in(&tx, action)?;
        tx.commit()?;

        tracing::debug!(pid = %action.pid, project = %action.project, "Inserted action");
        Ok(action.clone())
    }

    fn get_action(&self, pid: &str) -> StoreResult<Option<ActionRecord>> {
        let conn = self.conn()?;
        get_action_in(&conn, pid)
    }

    fn update_action(&self, action: &ActionRecord) -> StoreResult<ActionRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = update_action_in(&tx, action)?;
        tx.commit()?;
        Ok(updated)
    }

    fn delete_action(&self, pid: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM ida_action WHERE pid = ? AND filecount IS NULL",
            params![pid],
        )?;
        if deleted == 0 {
            return Err(StoreError::InvalidState(format!(
                "action {pid} does not exist or was already enumerated"
            )));
        }
        Ok(())
    }

    fn find_actions(
        &self,
        status: Option<ActionStatus>,
        projects: &[String],
    ) -> StoreResult<Vec<ActionRecord>> {
        let (where_clause, values) = filter_clause(status, projects);
        let conn = self.conn()?;
        select_actions(&conn, &where_clause, status_order(status), &values)
    }

    fn count_actions(&self, status: Option<ActionStatus>, projects: &[String]) -> StoreResult<u64> {
        let (where_clause, values) = filter_clause(status, projects);
        let sql = format!("SELECT COUNT(*) FROM ida_action WHERE {where_clause}");
        let conn = self.conn()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn find_conflicting(&self, project: &str, pathname: &str) -> StoreResult<Vec<ActionRecord>> {
        let conn = self.conn()?;
        conflicting_in(&conn, project, pathname, None)
    }

    fn find_stale(&self, before: DateTime<Utc>) -> StoreResult<Vec<ActionRecord>> {
        let where_clause = format!(
            "({}) AND COALESCE(heartbeat, initiated) < ?",
            status_condition(ActionStatus::Pending)
        );
        let conn = self.conn()?;
        select_actions(&conn, &where_clause, "initiated ASC", &[ts(&before)])
    }

    fn begin_retry(
        &self,
        failed: &ActionRecord,
        retry: &ActionRecord,
    ) -> StoreResult<(ActionRecord, ActionRecord)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored = get_action_in(&tx, &failed.pid)?
            .ok_or_else(|| StoreError::NotFound(format!("action {}", failed.pid)))?;
        if stored.failed.is_none() || stored.cleared.is_some() {
            return Err(StoreError::InvalidState(format!(
                "only failed, uncleared actions may be retried: {}",
                failed.pid
            )));
        }
        if stored.version != failed.version {
            return Err(StoreError::VersionConflict(failed.pid.clone()));
        }

        ensure_no_conflict(&tx, retry, Some(&failed.pid))?;
        insert_action_in(&tx, retry)?;

        let mut handed_over = stored;
        handed_over.retry = Some(retry.pid.clone());
        handed_over.cleared = Some(retry.initiated);
        handed_over.lease = None;
        let handed_over = update_action_in(&tx, &handed_over)?;

        let moved = tx.execute(
            "UPDATE ida_frozen_file SET action = ? WHERE action = ?",
            params![retry.pid, failed.pid],
        )?;
        tx.commit()?;

        tracing::debug!(
            failed = %failed.pid,
            retry = %retry.pid,
            files = moved,
            "Handed failed action over to retry"
        );
        Ok((handed_over, retry.clone()))
    }

    fn commit_file(&self, commit: &FileCommit) -> StoreResult<ActionRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut action = get_action_in(&tx, &commit.action)?
            .ok_or_else(|| StoreError::NotFound(format!("action {}", commit.action)))?;
        if !action.is_in_flight() {
            return Err(StoreError::InvalidState(format!(
                "action {} is no longer in flight",
                action.pid
            )));
        }
        match &action.lease {
            Some(lease) if lease.owner == commit.owner => {}
            other => {
                return Err(StoreError::LeaseConflict {
                    pid: action.pid.clone(),
                    owner: other
                        .as_ref()
                        .map(|l| l.owner.clone())
                        .unwrap_or_else(|| "nobody".to_string()),
                });
            }
        }

        let node = commit.write.node();
        let existing = match &commit.write {
            FileWrite::Failed(_) => None,
            _ => find_by_action_node_in(&tx, &action.pid, node)?,
        };

        let already_recorded = match &commit.write {
            FileWrite::Frozen(record) => existing.as_ref().is_some_and(|e| {
                e.frozen.is_some() && (e.replicated.is_some() || record.replicated.is_none())
            }),
            FileWrite::Removed { .. } => existing.as_ref().is_some_and(|e| e.removed.is_some()),
            FileWrite::Failed(_) => action.progress.has_failure(node),
        };

        if !already_recorded {
            match &commit.write {
                FileWrite::Frozen(record) => match &existing {
                    Some(e) => {
                        let mut record = record.clone();
                        record.id = e.id;
                        update_file_in(&tx, &record)?;
                    }
                    None => {
                        insert_file_in(&tx, record)?;
                    }
                },
                FileWrite::Removed { original, clone } => {
                    if let Some(id) = original {
                        tx.execute(
                            "UPDATE ida_frozen_file SET removed = ? \
                             WHERE id = ? AND removed IS NULL",
                            params![opt_ts(&clone.removed), id],
                        )?;
                    }
                    match &existing {
                        Some(e) => {
                            let mut clone = clone.clone();
                            clone.id = e.id;
                            update_file_in(&tx, &clone)?;
                        }
                        None => {
                            insert_file_in(&tx, clone)?;
                        }
                    }
                }
                FileWrite::Failed(failure) => {
                    action.progress.failures.push(failure.clone());
                }
            }

            action.progress.processed += 1;
            if commit.write.is_success() {
                action.progress.succeeded += 1;
            }
        }

        action.heartbeat = Some(commit.at);
        if let Some(lease) = action.lease.as_mut() {
            lease.expires = commit.lease_expires;
        }
        let action = update_action_in(&tx, &action)?;
        tx.commit()?;
        Ok(action)
    }
}
