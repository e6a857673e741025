use duckdb::{params, params_from_iter, Row};

use super::{next_id, ts, Persistence};
use crate::store::{DataChangeQuery, DataChangeStore, StoreResult};
use crate::types::{parse_timestamp, DataChangeRecord};

const CHANGE_COLUMNS: &str = r#""timestamp", project, "user", change, pathname, target, mode"#;

struct ChangeRow {
    id: i64,
    timestamp: String,
    project: String,
    user: String,
    change: String,
    pathname: String,
    target: Option<String>,
    mode: String,
}

impl ChangeRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            project: row.get(2)?,
            user: row.get(3)?,
            change: row.get(4)?,
            pathname: row.get(5)?,
            target: row.get(6)?,
            mode: row.get(7)?,
        })
    }

    fn into_record(self) -> StoreResult<DataChangeRecord> {
        Ok(DataChangeRecord {
            seq: self.id,
            timestamp: parse_timestamp(&self.timestamp)?,
            project: self.project,
            user: self.user,
            change: self.change.parse()?,
            pathname: self.pathname,
            target: self.target,
            mode: self.mode.parse()?,
        })
    }
}

impl DataChangeStore for Persistence {
    fn append_change(&self, change: &DataChangeRecord) -> StoreResult<DataChangeRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = next_id(&tx, "ida_data_change_id_seq")?;
        tx.execute(
            &format!("INSERT INTO ida_data_change (id, {CHANGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                id,
                ts(&change.timestamp),
                change.project,
                change.user,
                change.change.as_str(),
                change.pathname,
                change.target,
                change.mode.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(DataChangeRecord {
            seq: id,
            ..change.clone()
        })
    }

    fn query_changes(&self, query: &DataChangeQuery) -> StoreResult<Vec<DataChangeRecord>> {
        let mut conditions = vec!["project = ?".to_string()];
        let mut values: Vec<String> = vec![query.project.clone()];

        if let Some(user) = &query.user {
            conditions.push(r#""user" = ?"#.to_string());
            values.push(user.clone());
        }
        if let Some(change) = query.change {
            conditions.push("change = ?".to_string());
            values.push(change.as_str().to_string());
        }
        if let Some(mode) = query.mode {
            conditions.push("mode = ?".to_string());
            values.push(mode.as_str().to_string());
        }
        if let Some(pathname) = &query.pathname {
            conditions.push("pathname = ?".to_string());
            values.push(pathname.clone());
        }
        if let Some(since) = &query.since {
            conditions.push(r#""timestamp" > ?"#.to_string());
            values.push(ts(since));
        }
        if let Some(after) = query.after {
            conditions.push(format!("id > {after}"));
        }

        let direction = if query.ascending { "ASC" } else { "DESC" };
        let order = match query.after {
            Some(_) => format!("id {direction}"),
            None => format!(r#""timestamp" {direction}, id {direction}"#),
        };
        let mut sql = format!(
            "SELECT id, {CHANGE_COLUMNS} FROM ida_data_change WHERE {} ORDER BY {order}",
            conditions.join(" AND ")
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), ChangeRow::from_row)?;

        let mut changes = Vec::new();
        for row in rows {
            changes.push(row?.into_record()?);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_utc, ChangeKind, ChangeMode};
    use chrono::Duration;

    fn change(project: &str, kind: ChangeKind, pathname: &str, offset_secs: i64) -> DataChangeRecord {
        DataChangeRecord {
            seq: 0,
            timestamp: now_utc() - Duration::hours(1) + Duration::seconds(offset_secs),
            project: project.to_string(),
            user: "alice".to_string(),
            change: kind,
            pathname: pathname.to_string(),
            target: None,
            mode: ChangeMode::Api,
        }
    }

    #[test]
    fn test_query_most_recent_first() {
        let store = Persistence::in_memory().unwrap();
        store.append_change(&change("p1", ChangeKind::Add, "/p1+/a", 1)).unwrap();
        store.append_change(&change("p1", ChangeKind::Modify, "/p1+/a", 2)).unwrap();
        store.append_change(&change("p2", ChangeKind::Add, "/p2+/b", 3)).unwrap();

        let changes = store
            .query_changes(&DataChangeQuery::for_project("p1"))
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change, ChangeKind::Modify);

        let last = store
            .query_changes(&DataChangeQuery::for_project("p1").limit(1))
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].change, ChangeKind::Modify);
    }

    #[test]
    fn test_query_since_is_chronological_and_exclusive() {
        let store = Persistence::in_memory().unwrap();
        let first = change("p1", ChangeKind::Add, "/p1+/a", 1);
        store.append_change(&first).unwrap();
        store.append_change(&change("p1", ChangeKind::Add, "/p1+/b", 2)).unwrap();
        store.append_change(&change("p1", ChangeKind::Delete, "/p1+/a", 3)).unwrap();

        let since = store
            .query_changes(&DataChangeQuery::for_project("p1").since(first.timestamp).ascending())
            .unwrap();
        let paths: Vec<_> = since.iter().map(|c| (c.change, c.pathname.as_str())).collect();
        assert_eq!(
            paths,
            vec![(ChangeKind::Add, "/p1+/b"), (ChangeKind::Delete, "/p1+/a")]
        );
    }

    #[test]
    fn test_query_after_sequence_ignores_timestamps() {
        let store = Persistence::in_memory().unwrap();
        let first = store.append_change(&change("p1", ChangeKind::Add, "/p1+/a", 5)).unwrap();
        store.append_change(&change("p2", ChangeKind::Add, "/p2+/x", 6)).unwrap();
        // Appended later with an earlier and an equal timestamp.
        store.append_change(&change("p1", ChangeKind::Add, "/p1+/b", 1)).unwrap();
        let mut same = change("p1", ChangeKind::Add, "/p1+/c", 0);
        same.timestamp = first.timestamp;
        store.append_change(&same).unwrap();

        let after = store
            .query_changes(&DataChangeQuery::for_project("p1").after(first.seq).ascending())
            .unwrap();
        let paths: Vec<_> = after.iter().map(|c| c.pathname.as_str()).collect();
        assert_eq!(paths, vec!["/p1+/b", "/p1+/c"]);
        assert!(after[0].seq > first.seq && after[1].seq > after[0].seq);

        let head = store
            .query_changes(&DataChangeQuery::for_project("p1").after(0).limit(1))
            .unwrap();
        assert_eq!(head[0].pathname, "/p1+/c");
    }

    #[test]
    fn test_query_filters() {
        let store = Persistence::in_memory().unwrap();
        let mut by_bob = change("p1", ChangeKind::Rename, "/p1+/a", 1);
        by_bob.user = "bob".into();
        by_bob.target = Some("/p1+/b".into());
        by_bob.mode = ChangeMode::Gui;
        let by_bob = store.append_change(&by_bob).unwrap();
        store.append_change(&change("p1", ChangeKind::Add, "/p1+/c", 2)).unwrap();

        let found = store
            .query_changes(
                &DataChangeQuery::for_project("p1")
                    .with_user("bob")
                    .with_change(ChangeKind::Rename)
                    .with_mode(ChangeMode::Gui),
            )
            .unwrap();
        assert_eq!(found, vec![by_bob]);

        let none = store
            .query_changes(&DataChangeQuery::for_project("p1").with_mode(ChangeMode::Cli))
            .unwrap();
        assert!(none.is_empty());

        let by_path = store
            .query_changes(&DataChangeQuery::for_project("p1").with_pathname("/p1+/c"))
            .unwrap();
        assert_eq!(by_path.len(), 1);
    }
}
