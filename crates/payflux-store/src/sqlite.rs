use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use payflux_core::error::{FlowError, Result};
use payflux_core::flow::{FlowFilter, FlowRecord, FlowSummary};
use payflux_core::traits::FlowStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS flows (
    flow_id TEXT PRIMARY KEY,
    flow_type TEXT NOT NULL,
    status TEXT NOT NULL,
    user_id TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    pause_reason TEXT,
    created_at TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flows_status ON flows(status, created_at);
CREATE INDEX IF NOT EXISTS idx_flows_user ON flows(user_id, created_at);";

/// SQLite-backed flow store. The serialized record is the source of
/// truth; the indexed columns exist only to serve list queries.
pub struct SqliteFlowStore {
    conn: Mutex<Connection>,
}

impl SqliteFlowStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Store(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(|e| FlowError::Store(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowError::Store(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Store(e.to_string()))?;

        debug!(path = %path.display(), "SQLite flow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Store(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Store(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn save_sync(&self, flow: &FlowRecord) -> Result<()> {
        let record = serde_json::to_string(flow)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Store(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO flows
                (flow_id, flow_type, status, user_id, correlation_id, pause_reason, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                flow.flow_id,
                flow.flow_type,
                flow.status.as_str(),
                flow.user_id,
                flow.correlation_id,
                flow.pause_reason,
                flow.created_at.to_rfc3339(),
                record,
            ],
        )
        .map_err(|e| FlowError::Store(e.to_string()))?;
        Ok(())
    }

    fn load_sync(&self, flow_id: &str) -> Result<Option<FlowRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Store(e.to_string()))?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM flows WHERE flow_id = ?1",
                params![flow_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FlowError::Store(e.to_string()))?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_sync(&self, filter: &FlowFilter) -> Result<Vec<FlowSummary>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Store(e.to_string()))?;

        // Narrow with indexed columns, then finish filtering on the
        // deserialized record.
        let mut sql = String::from("SELECT record FROM flows WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(Box::new(user_id.clone()));
        }
        if let Some(flow_type) = &filter.flow_type {
            sql.push_str(" AND flow_type = ?");
            args.push(Box::new(flow_type.clone()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| FlowError::Store(e.to_string()))?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| FlowError::Store(e.to_string()))?;

        let mut summaries = Vec::new();
        for row in rows {
            let json = row.map_err(|e| FlowError::Store(e.to_string()))?;
            let flow: FlowRecord = serde_json::from_str(&json)?;
            if filter.matches(&flow) {
                summaries.push(flow.summary());
            }
        }
        Ok(summaries)
    }

    fn delete_sync(&self, flow_id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Store(e.to_string()))?;
        let changed = conn
            .execute("DELETE FROM flows WHERE flow_id = ?1", params![flow_id])
            .map_err(|e| FlowError::Store(e.to_string()))?;
        Ok(changed > 0)
    }
}

impl FlowStore for SqliteFlowStore {
    fn save(&self, flow: &FlowRecord) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();
        Box::pin(async move { self.save_sync(&flow) })
    }

    fn load(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowRecord>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move { self.load_sync(&flow_id) })
    }

    fn list(&self, filter: &FlowFilter) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        let filter = filter.clone();
        Box::pin(async move { self.list_sync(&filter) })
    }

    fn delete(&self, flow_id: &str) -> BoxFuture<'_, Result<bool>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move { self.delete_sync(&flow_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payflux_core::flow::FlowStatus;
    use payflux_core::step::Step;

    fn flow(user: &str) -> FlowRecord {
        FlowRecord::new("payment", user, "corr-1", vec![Step::new("a")])
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let mut f = flow("user-1");
        f.data
            .insert("charge".into(), serde_json::json!({"amount": 100.0}));
        store.save(&f).await.unwrap();

        let loaded = store.load(&f.flow_id).await.unwrap().unwrap();
        assert_eq!(loaded.flow_id, f.flow_id);
        assert_eq!(loaded.status, FlowStatus::Queued);
        assert_eq!(loaded.data["charge"]["amount"], 100.0);
        assert_eq!(loaded.events.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let store = SqliteFlowStore::in_memory().unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let mut f = flow("user-1");
        store.save(&f).await.unwrap();

        f.transition_to(FlowStatus::Running).unwrap();
        store.save(&f).await.unwrap();

        let loaded = store.load(&f.flow_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, FlowStatus::Running);

        let all = store.list(&FlowFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_user() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let f1 = flow("alice");
        let mut f2 = flow("bob");
        f2.transition_to(FlowStatus::Running).unwrap();
        store.save(&f1).await.unwrap();
        store.save(&f2).await.unwrap();

        let running = store
            .list(&FlowFilter::by_status(FlowStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].user_id, "bob");

        let alice = store
            .list(&FlowFilter {
                user_id: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].flow_id, f1.flow_id);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let f = flow("user-1");
        store.save(&f).await.unwrap();
        assert!(store.delete(&f.flow_id).await.unwrap());
        assert!(!store.delete(&f.flow_id).await.unwrap());
        assert!(store.load(&f.flow_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.db");
        let f = flow("user-1");
        {
            let store = SqliteFlowStore::open(&path).unwrap();
            store.save(&f).await.unwrap();
        }
        let store = SqliteFlowStore::open(&path).unwrap();
        let loaded = store.load(&f.flow_id).await.unwrap().unwrap();
        assert_eq!(loaded.flow_id, f.flow_id);
    }
}
