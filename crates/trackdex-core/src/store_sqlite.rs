//! SQLite-backed [`RecordStore`] adapter.
//!
//! The relational schema here is an implementation detail of this adapter,
//! not a contract: the engine only sees the [`RecordStore`] trait. The
//! adapter exists so a deployment has a concrete, durable store to walk, and
//! so integration tests can exercise paging against real SQL ordering.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::record::{ChangeGroup, ChangeItem, Comment, Record, RecordId};
use crate::store::{RecordFilter, RecordStore, StoreError};

/// Durable record store on a single SQLite database.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (and migrate) a store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                 id            INTEGER PRIMARY KEY,
                 key           TEXT NOT NULL UNIQUE,
                 project       TEXT NOT NULL,
                 summary       TEXT NOT NULL,
                 description   TEXT,
                 status        TEXT NOT NULL,
                 resolution    TEXT,
                 assignee      TEXT,
                 reporter      TEXT,
                 labels        TEXT NOT NULL DEFAULT '[]',
                 created_at_ms INTEGER NOT NULL DEFAULT 0,
                 updated_at_ms INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS comments (
                 id            INTEGER PRIMARY KEY,
                 record_id     INTEGER NOT NULL,
                 record_key    TEXT NOT NULL,
                 author        TEXT,
                 body          TEXT,
                 created_at_ms INTEGER NOT NULL DEFAULT 0,
                 updated_at_ms INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_comments_record ON comments (record_id);
             CREATE TABLE IF NOT EXISTS change_groups (
                 id            INTEGER NOT NULL,
                 record_id     INTEGER NOT NULL,
                 record_key    TEXT NOT NULL,
                 author        TEXT,
                 created_at_ms INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (record_id, id)
             );
             CREATE TABLE IF NOT EXISTS change_items (
                 record_id  INTEGER NOT NULL,
                 group_id   INTEGER NOT NULL,
                 field      TEXT NOT NULL,
                 from_value TEXT,
                 to_value   TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_change_items_group
                 ON change_items (record_id, group_id);",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a record row.
    pub fn put_record(&self, record: &Record) -> Result<(), StoreError> {
        let labels = serde_json::to_string(&record.labels)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO records
                 (id, key, project, summary, description, status, resolution,
                  assignee, reporter, labels, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id,
                    record.key,
                    record.project,
                    record.summary,
                    record.description,
                    record.status,
                    record.resolution,
                    record.assignee,
                    record.reporter,
                    labels,
                    record.created_at_ms,
                    record.updated_at_ms,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Delete a record and its children.
    pub fn remove_record(&self, id: RecordId) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM records WHERE id = ?1", params![id])
            .map_err(sql_err)?;
        conn.execute("DELETE FROM comments WHERE record_id = ?1", params![id])
            .map_err(sql_err)?;
        conn.execute("DELETE FROM change_groups WHERE record_id = ?1", params![id])
            .map_err(sql_err)?;
        conn.execute("DELETE FROM change_items WHERE record_id = ?1", params![id])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn put_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO comments
                 (id, record_id, record_key, author, body, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    comment.id,
                    comment.record_id,
                    comment.record_key,
                    comment.author,
                    comment.body,
                    comment.created_at_ms,
                    comment.updated_at_ms,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn put_change_group(&self, group: &ChangeGroup) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO change_groups
             (id, record_id, record_key, author, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.id,
                group.record_id,
                group.record_key,
                group.author,
                group.created_at_ms,
            ],
        )
        .map_err(sql_err)?;
        conn.execute(
            "DELETE FROM change_items WHERE record_id = ?1 AND group_id = ?2",
            params![group.record_id, group.id],
        )
        .map_err(sql_err)?;
        for item in &group.items {
            conn.execute(
                "INSERT INTO change_items (record_id, group_id, field, from_value, to_value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group.record_id,
                    group.id,
                    item.field,
                    item.from_value,
                    item.to_value,
                ],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }
}

fn sql_err(err: rusqlite::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let labels_json: String = row.get("labels")?;
    Ok(Record {
        id: row.get("id")?,
        key: row.get("key")?,
        project: row.get("project")?,
        summary: row.get("summary")?,
        description: row.get("description")?,
        status: row.get("status")?,
        resolution: row.get("resolution")?,
        assignee: row.get("assignee")?,
        reporter: row.get("reporter")?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        created_at_ms: row.get("created_at_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
    })
}

impl RecordStore for SqliteRecordStore {
    fn max_record_id(&self) -> Result<Option<RecordId>, StoreError> {
        self.conn
            .lock()
            .query_row("SELECT MAX(id) FROM records", [], |row| {
                row.get::<_, Option<u64>>(0)
            })
            .map_err(sql_err)
    }

    fn records_page(
        &self,
        upper: RecordId,
        limit: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock();
        let mut sql = String::from("SELECT * FROM records WHERE id <= ?1");
        if filter.project.is_some() {
            sql.push_str(" AND project = ?3");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?2");
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = if let Some(project) = filter.project.as_deref() {
            stmt.query_map(params![upper, limit as i64, project], row_to_record)
        } else {
            stmt.query_map(params![upper, limit as i64], row_to_record)
        }
        .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn record(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT * FROM records WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(sql_err)
    }

    fn comments(&self, id: RecordId) -> Result<Vec<Comment>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, record_id, record_key, author, body, created_at_ms, updated_at_ms
                 FROM comments WHERE record_id = ?1 ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Comment {
                    id: row.get(0)?,
                    record_id: row.get(1)?,
                    record_key: row.get(2)?,
                    author: row.get(3)?,
                    body: row.get(4)?,
                    created_at_ms: row.get(5)?,
                    updated_at_ms: row.get(6)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn change_history(&self, id: RecordId) -> Result<Vec<ChangeGroup>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, record_id, record_key, author, created_at_ms
                 FROM change_groups WHERE record_id = ?1 ORDER BY id",
            )
            .map_err(sql_err)?;
        let groups = stmt
            .query_map(params![id], |row| {
                Ok(ChangeGroup {
                    id: row.get(0)?,
                    record_id: row.get(1)?,
                    record_key: row.get(2)?,
                    author: row.get(3)?,
                    created_at_ms: row.get(4)?,
                    items: Vec::new(),
                })
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut out = Vec::with_capacity(groups.len());
        let mut item_stmt = conn
            .prepare(
                "SELECT field, from_value, to_value FROM change_items
                 WHERE record_id = ?1 AND group_id = ?2",
            )
            .map_err(sql_err)?;
        for mut group in groups {
            let items = item_stmt
                .query_map(params![group.record_id, group.id], |row| {
                    Ok(ChangeItem {
                        field: row.get(0)?,
                        from_value: row.get(1)?,
                        to_value: row.get(2)?,
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            group.items = items;
            out.push(group);
        }
        Ok(out)
    }

    fn approximate_record_count(&self) -> Result<Option<u64>, StoreError> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map(Some)
            .map_err(sql_err)
    }

    fn approximate_comment_count(&self) -> Result<Option<u64>, StoreError> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM comments", [], |row| row.get(0))
            .map(Some)
            .map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RecordId, project: &str) -> Record {
        let mut r = Record::new(id, format!("{project}-{id}"));
        r.summary = format!("record {id}");
        r.updated_at_ms = 1_000 + id;
        r
    }

    #[test]
    fn roundtrip_record_with_labels() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let mut r = record(4, "OPS");
        r.labels = vec!["regression".to_string(), "p1".to_string()];
        store.put_record(&r).unwrap();
        let back = store.record(4).unwrap().unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn page_matches_memory_store_ordering() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        for id in [1u64, 2, 5, 9, 10] {
            store.put_record(&record(id, "OPS")).unwrap();
        }
        let page = store.records_page(9, 3, &RecordFilter::any()).unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![9, 5, 2]);
    }

    #[test]
    fn project_filter_applies_in_sql() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.put_record(&record(1, "OPS")).unwrap();
        store.put_record(&record(2, "WEB")).unwrap();
        let page = store
            .records_page(10, 10, &RecordFilter::project("WEB"))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].project, "WEB");
    }

    #[test]
    fn change_history_rebuilds_groups_with_items() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.put_record(&record(3, "OPS")).unwrap();
        store
            .put_change_group(&ChangeGroup {
                id: 100,
                record_id: 3,
                record_key: "OPS-3".to_string(),
                author: Some("ana".to_string()),
                created_at_ms: 50,
                items: vec![ChangeItem {
                    field: "status".to_string(),
                    from_value: Some("open".to_string()),
                    to_value: Some("closed".to_string()),
                }],
            })
            .unwrap();
        let history = store.change_history(3).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].items.len(), 1);
        assert_eq!(history[0].items[0].field, "status");
    }

    #[test]
    fn remove_record_drops_children() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.put_record(&record(6, "OPS")).unwrap();
        store
            .put_comment(&Comment {
                id: 1,
                record_id: 6,
                record_key: "OPS-6".to_string(),
                author: None,
                body: Some("note".to_string()),
                created_at_ms: 0,
                updated_at_ms: 0,
            })
            .unwrap();
        store.remove_record(6).unwrap();
        assert!(store.record(6).unwrap().is_none());
        assert!(store.comments(6).unwrap().is_empty());
        assert_eq!(store.max_record_id().unwrap(), None);
    }
}
