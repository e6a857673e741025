use chrono::{DateTime, Utc};
use duckdb::{params, params_from_iter, Connection, Row, ToSql};

use super::{next_id, opt_ts, parse_opt_ts, ts, Persistence};
use crate::scope::is_root;
use crate::store::{FrozenFileStore, StoreError, StoreResult};
use crate::types::FrozenFileRecord;

const FILE_COLUMNS: &str = "id, node, action, project, pathname, pid, size, checksum, modified, \
                            frozen, replicated, removed, cleared";

const CURRENTLY_FROZEN: &str = "frozen IS NOT NULL AND removed IS NULL AND cleared IS NULL";

struct FileRow {
    id: i64,
    node: i64,
    action: String,
    project: String,
    pathname: String,
    pid: String,
    size: i64,
    checksum: Option<String>,
    modified: Option<String>,
    frozen: Option<String>,
    replicated: Option<String>,
    removed: Option<String>,
    cleared: Option<String>,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            node: row.get(1)?,
            action: row.get(2)?,
            project: row.get(3)?,
            pathname: row.get(4)?,
            pid: row.get(5)?,
            size: row.get(6)?,
            checksum: row.get(7)?,
            modified: row.get(8)?,
            frozen: row.get(9)?,
            replicated: row.get(10)?,
            removed: row.get(11)?,
            cleared: row.get(12)?,
        })
    }

    fn into_record(self) -> StoreResult<FrozenFileRecord> {
        Ok(FrozenFileRecord {
            id: self.id,
            node: self.node,
            action: self.action,
            project: self.project,
            pathname: self.pathname,
            pid: self.pid,
            size: self.size.max(0) as u64,
            checksum: self.checksum,
            modified: parse_opt_ts(self.modified)?,
            frozen: parse_opt_ts(self.frozen)?,
            replicated: parse_opt_ts(self.replicated)?,
            removed: parse_opt_ts(self.removed)?,
            cleared: parse_opt_ts(self.cleared)?,
        })
    }
}

fn select_files(
    conn: &Connection,
    where_clause: &str,
    suffix: &str,
    values: &[&dyn ToSql],
) -> StoreResult<Vec<FrozenFileRecord>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM ida_frozen_file WHERE {where_clause} {suffix}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), FileRow::from_row)?;

    let mut files = Vec::new();
    for row in rows {
        files.push(row?.into_record()?);
    }
    Ok(files)
}

/// The record an action holds for a node; the newest one if several exist.
pub(super) fn find_by_action_node_in(
    conn: &Connection,
    action: &str,
    node: i64,
) -> StoreResult<Option<FrozenFileRecord>> {
    let mut files = select_files(
        conn,
        "action = ? AND node = ?",
        "ORDER BY id DESC LIMIT 1",
        &[&action, &node],
    )?;
    Ok(files.pop())
}

pub(super) fn insert_file_in(
    conn: &Connection,
    file: &FrozenFileRecord,
) -> StoreResult<FrozenFileRecord> {
    let mut stored = file.clone();
    stored.id = next_id(conn, "ida_frozen_file_id_seq")?;

    let sql = format!(
        "INSERT INTO ida_frozen_file ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            stored.id,
            stored.node,
            stored.action,
            stored.project,
            stored.pathname,
            stored.pid,
            stored.size as i64,
            stored.checksum,
            opt_ts(&stored.modified),
            opt_ts(&stored.frozen),
            opt_ts(&stored.replicated),
            opt_ts(&stored.removed),
            opt_ts(&stored.cleared),
        ],
    )?;
    Ok(stored)
}

pub(super) fn update_file_in(conn: &Connection, file: &FrozenFileRecord) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE ida_frozen_file SET node = ?, action = ?, project = ?, pathname = ?, pid = ?, \
         size = ?, checksum = ?, modified = ?, frozen = ?, replicated = ?, removed = ?, \
         cleared = ? WHERE id = ?",
        params![
            file.node,
            file.action,
            file.project,
            file.pathname,
            file.pid,
            file.size as i64,
            file.checksum,
            opt_ts(&file.modified),
            opt_ts(&file.frozen),
            opt_ts(&file.replicated),
            opt_ts(&file.removed),
            opt_ts(&file.cleared),
            file.id,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("frozen file {}", file.id)));
    }
    Ok(())
}

impl FrozenFileStore for Persistence {
    fn insert_file(&self, file: &FrozenFileRecord) -> StoreResult<FrozenFileRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = insert_file_in(&tx, file)?;
        tx.commit()?;
        Ok(stored)
    }

    fn update_file(&self, file: &FrozenFileRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        update_file_in(&conn, file)
    }

    fn find_file_by_pid(&self, pid: &str) -> StoreResult<Option<FrozenFileRecord>> {
        let conn = self.conn()?;
        let mut files = select_files(&conn, "pid = ?", "ORDER BY id DESC LIMIT 1", &[&pid])?;
        Ok(files.pop())
    }

    fn find_by_action_node(
        &self,
        action: &str,
        node: i64,
    ) -> StoreResult<Option<FrozenFileRecord>> {
        let conn = self.conn()?;
        find_by_action_node_in(&conn, action, node)
    }

    fn find_current_by_node(&self, node: i64) -> StoreResult<Option<FrozenFileRecord>> {
        let conn = self.conn()?;
        let where_clause = format!("node = ? AND {CURRENTLY_FROZEN}");
        let mut files = select_files(
            &conn,
            &where_clause,
            "ORDER BY frozen DESC, id DESC LIMIT 1",
            &[&node],
        )?;
        Ok(files.pop())
    }

    fn find_action_files(&self, action: &str) -> StoreResult<Vec<FrozenFileRecord>> {
        let conn = self.conn()?;
        select_files(&conn, "action = ?", "ORDER BY pathname ASC, id ASC", &[&action])
    }

    fn find_frozen(
        &self,
        project: &str,
        scope: Option<&str>,
    ) -> StoreResult<Vec<FrozenFileRecord>> {
        let conn = self.conn()?;
        match scope.filter(|s| !is_root(s)) {
            Some(scope) => {
                let where_clause = format!(
                    "project = ? AND {CURRENTLY_FROZEN} AND (pathname = ? OR starts_with(pathname, ?))"
                );
                select_files(
                    &conn,
                    &where_clause,
                    "ORDER BY pathname ASC",
                    &[&project, &scope, &format!("{scope}/")],
                )
            }
            None => {
                let where_clause = format!("project = ? AND {CURRENTLY_FROZEN}");
                select_files(&conn, &where_clause, "ORDER BY pathname ASC", &[&project])
            }
        }
    }

    fn frozen_pids(&self, project: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .find_frozen(project, None)?
            .into_iter()
            .map(|f| f.pid)
            .collect())
    }

    fn clear_expired(
        &self,
        removed_before: DateTime<Utc>,
        orphaned_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "UPDATE ida_frozen_file SET cleared = ? \
             WHERE cleared IS NULL AND removed IS NOT NULL AND removed < ?",
            params![ts(&at), ts(&removed_before)],
        )?;
        let orphaned = tx.execute(
            "UPDATE ida_frozen_file SET cleared = ? \
             WHERE cleared IS NULL AND removed IS NULL AND frozen IS NOT NULL AND frozen < ? \
             AND action NOT IN (SELECT pid FROM ida_action)",
            params![ts(&at), ts(&orphaned_before)],
        )?;
        tx.commit()?;

        if removed + orphaned > 0 {
            tracing::info!(removed, orphaned, "Cleared expired frozen file records");
        }
        Ok((removed + orphaned) as u64)
    }
}
