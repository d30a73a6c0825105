//! SqliteClaimStore - ファイル 1 つを共有する複数プロセス向けのストア
//!
//! # 設計原則
//! - claim は CTE + `UPDATE ... RETURNING` の 1 ステートメント
//!   （top-N の選択と状態更新の間に他プロセスが割り込めない）
//! - 書き込みは `BEGIN IMMEDIATE` で先に write lock を取り、待ちは busy_timeout に任せる
//! - WAL モードなので読み取り（status / count）は書き込みを止めない
//! - rusqlite は同期 API なので `spawn_blocking` に逃がす
//!
//! # カラム表現
//! - `id`: ULID 文字列（辞書順 = 生成順）
//! - `retry_at` / `created_at` / `modified_at`: UNIX epoch ミリ秒（INTEGER）
//! - `payload`: JSON テキスト

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use tracing::{debug, warn};

use super::{ClaimOrder, ClaimRequest, QueueCounts, QueueQuery};
use crate::domain::{ItemType, StoreError, WorkItem, WorkItemId};
use crate::ports::ClaimStore;

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work_items (
    id          TEXT PRIMARY KEY,
    item_type   TEXT NOT NULL,
    state       TEXT NOT NULL,
    retry_at    INTEGER,
    payload     TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    modified_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS work_items_type_state ON work_items (item_type, state);
CREATE INDEX IF NOT EXISTS work_items_retry_at ON work_items (retry_at);
";

const COLUMNS: &str = "id, item_type, state, retry_at, payload, created_at, modified_at";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// 1 行をそのまま受け取る中間表現（パース失敗を Corrupt として返すため）
struct RawRow {
    id: String,
    item_type: String,
    state: String,
    retry_at: Option<i64>,
    payload: String,
    created_at: i64,
    modified_at: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_type: row.get(1)?,
            state: row.get(2)?,
            retry_at: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            modified_at: row.get(6)?,
        })
    }

    fn into_item(self) -> Result<WorkItem, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let ulid = self
            .id
            .parse::<ulid::Ulid>()
            .map_err(|e| corrupt(format!("bad id: {e}")))?;
        let payload =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(format!("bad payload: {e}")))?;
        let retry_at = match self.retry_at {
            Some(ms) => Some(from_millis(ms).ok_or_else(|| corrupt("bad retry_at".into()))?),
            None => None,
        };
        let created_at = from_millis(self.created_at).ok_or_else(|| corrupt("bad created_at".into()))?;
        let modified_at =
            from_millis(self.modified_at).ok_or_else(|| corrupt("bad modified_at".into()))?;

        Ok(WorkItem {
            id: WorkItemId::from_ulid(ulid),
            item_type: ItemType::new(self.item_type),
            state: self.state,
            retry_at,
            payload,
            created_at,
            modified_at,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn limit_value(limit: usize) -> Value {
    Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

/// `pending_q OR stalled_q` を SQL にしたもの（束縛値は `params` に積む）
fn predicate_sql(query: &QueueQuery, now: DateTime<Utc>, params: &mut Vec<Value>) -> String {
    let excluded: Vec<&String> = query
        .final_states
        .iter()
        .chain(std::iter::once(&query.active_state))
        .collect();
    let placeholders = vec!["?"; excluded.len()].join(", ");

    params.push(Value::Text(query.item_type.as_str().to_string()));
    params.extend(excluded.into_iter().map(|s| Value::Text(s.clone())));
    params.push(Value::Text(query.active_state.clone()));
    params.push(Value::Integer(to_millis(now)));

    format!(
        "item_type = ? AND (state NOT IN ({placeholders}) \
         OR (state = ? AND (retry_at IS NULL OR retry_at <= ?)))"
    )
}

fn order_sql(order: ClaimOrder) -> &'static str {
    match order {
        ClaimOrder::SoonestRetry => "retry_at ASC, created_at ASC, id ASC",
        ClaimOrder::OldestFirst => "created_at ASC, id ASC",
        ClaimOrder::NewestFirst => "created_at DESC, id DESC",
        ClaimOrder::Random => "RANDOM()",
    }
}

fn open_connection(path: Option<&Path>) -> Result<Connection, StoreError> {
    let conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if path.is_some() {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "sqlite journal mode");
    }
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// SQLite-backed [`ClaimStore`].
///
/// Each instance owns one connection. Open one instance per process (or per
/// actor task); they coordinate only through the database file.
#[derive(Clone)]
pub struct SqliteClaimStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteClaimStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(Some(&path))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Private in-memory database (only visible through this instance and its clones).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = open_connection(None)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        let item = item.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO work_items (id, item_type, state, retry_at, payload, created_at, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.id.as_ulid().to_string(),
                    item.item_type.as_str(),
                    item.state,
                    item.retry_at.map(to_millis),
                    item.payload.to_string(),
                    to_millis(item.created_at),
                    to_millis(item.modified_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM work_items WHERE id = ?1"),
                    params![id.as_ulid().to_string()],
                    RawRow::from_row,
                )
                .optional()?;
            raw.map(RawRow::into_item).transpose()
        })
        .await
    }

    async fn candidates(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut values = Vec::new();
            let predicate = predicate_sql(&query, now, &mut values);
            values.push(limit_value(limit));
            let sql = format!(
                "SELECT {COLUMNS} FROM work_items WHERE {predicate} ORDER BY {} LIMIT ?",
                order_sql(query.order)
            );
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map(params_from_iter(values.iter()), RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(RawRow::into_item).collect()
        })
        .await
    }

    async fn count_ready(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut values = Vec::new();
            let predicate = predicate_sql(&query, now, &mut values);
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM work_items WHERE {predicate}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn claim_one(
        &self,
        query: &QueueQuery,
        claim: &ClaimRequest,
    ) -> Result<Option<WorkItem>, StoreError> {
        let query = query.clone();
        let claim = *claim;
        self.with_conn(move |conn| {
            // bound in textual order: CTE predicate, LIMIT, SET, guard predicate
            let mut values = Vec::new();
            let top_predicate = predicate_sql(&query, claim.now, &mut values);
            values.push(limit_value(query.top_n));
            values.push(Value::Text(query.active_state.clone()));
            values.push(Value::Integer(to_millis(claim.lease_until)));
            values.push(Value::Integer(to_millis(claim.now)));
            let guard_predicate = predicate_sql(&query, claim.now, &mut values);

            // top-N selection, random pick and state change in one statement
            let sql = format!(
                "WITH top AS (
                    SELECT id FROM work_items WHERE {top_predicate}
                    ORDER BY {order} LIMIT ?
                 )
                 UPDATE work_items
                 SET state = ?, retry_at = ?, modified_at = ?
                 WHERE id = (SELECT id FROM top ORDER BY RANDOM() LIMIT 1)
                   AND {guard_predicate}
                 RETURNING {COLUMNS}",
                order = order_sql(query.order),
            );
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw = tx
                .query_row(&sql, params_from_iter(values.iter()), RawRow::from_row)
                .optional()?;
            tx.commit()?;
            raw.map(RawRow::into_item).transpose()
        })
        .await
    }

    async fn claim_by_id(
        &self,
        id: WorkItemId,
        query: &QueueQuery,
        claim: &ClaimRequest,
    ) -> Result<Option<WorkItem>, StoreError> {
        let query = query.clone();
        let claim = *claim;
        self.with_conn(move |conn| {
            let mut values = vec![
                Value::Text(query.active_state.clone()),
                Value::Integer(to_millis(claim.lease_until)),
                Value::Integer(to_millis(claim.now)),
                Value::Text(id.as_ulid().to_string()),
            ];
            let predicate = predicate_sql(&query, claim.now, &mut values);
            let sql = format!(
                "UPDATE work_items SET state = ?, retry_at = ?, modified_at = ?
                 WHERE id = ? AND {predicate}
                 RETURNING {COLUMNS}"
            );

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw = tx
                .query_row(&sql, params_from_iter(values.iter()), RawRow::from_row)
                .optional()?;
            tx.commit()?;
            raw.map(RawRow::into_item).transpose()
        })
        .await
    }

    async fn commit(
        &self,
        item: &WorkItem,
        active_state: &str,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let item = item.clone();
        let active_state = active_state.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // `IS` compares NULL lease to NULL column as equal
            let changed = tx.execute(
                "UPDATE work_items
                 SET state = ?1, retry_at = ?2, payload = ?3, modified_at = ?4
                 WHERE id = ?5 AND state = ?6 AND retry_at IS ?7",
                params![
                    item.state,
                    item.retry_at.map(to_millis),
                    item.payload.to_string(),
                    to_millis(item.modified_at),
                    item.id.as_ulid().to_string(),
                    active_state,
                    lease.map(to_millis),
                ],
            )?;
            tx.commit()?;
            Ok(changed == 1)
        })
        .await
    }

    async fn find_orphans(
        &self,
        known_types: &[ItemType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let known: Vec<String> = known_types.iter().map(|t| t.as_str().to_string()).collect();
        self.with_conn(move |conn| {
            let mut values: Vec<Value> = vec![Value::Integer(to_millis(now))];
            let type_filter = if known.is_empty() {
                String::new()
            } else {
                values.extend(known.iter().cloned().map(Value::Text));
                format!(" AND item_type NOT IN ({})", vec!["?"; known.len()].join(", "))
            };
            values.push(limit_value(limit));
            let sql = format!(
                "SELECT {COLUMNS} FROM work_items
                 WHERE retry_at IS NOT NULL AND retry_at <= ?{type_filter}
                 ORDER BY retry_at ASC, id ASC LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map(params_from_iter(values.iter()), RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(RawRow::into_item).collect()
        })
        .await
    }

    async fn has_future_leases(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let found: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM work_items WHERE retry_at > ?1)",
                params![to_millis(now)],
                |row| row.get(0),
            )?;
            Ok(found)
        })
        .await
    }

    async fn counts(
        &self,
        query: &QueueQuery,
        now: DateTime<Utc>,
    ) -> Result<QueueCounts, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT state, (retry_at IS NULL OR retry_at <= ?1) AS reached, COUNT(*)
                 FROM work_items WHERE item_type = ?2
                 GROUP BY state, reached",
            )?;
            let groups = stmt
                .query_map(params![to_millis(now), query.item_type.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = QueueCounts::default();
            for (state, reached, n) in groups {
                let n = usize::try_from(n).unwrap_or(0);
                if query.final_states.contains(&state) {
                    counts.finished += n;
                } else if state == query.active_state {
                    if reached {
                        counts.stalled += n;
                    } else {
                        counts.active += n;
                    }
                } else {
                    counts.pending += n;
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn reset_connection(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        self.with_conn(move |conn| {
            if !conn.is_autocommit() {
                warn!("rolling back half-open transaction");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %e, "rollback failed");
                }
            }
            // in-memory databases would lose their data on reopen
            if let Some(path) = path.as_deref() {
                *conn = open_connection(Some(path))?;
                debug!(path = %path.display(), "sqlite connection reopened");
            }
            Ok(())
        })
        .await
    }
}
