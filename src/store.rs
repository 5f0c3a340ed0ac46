//! Conversation and audit store.
//!
//! The pipeline only talks to [`ConversationStore`]. [`SqliteConversationStore`]
//! is the bundled implementation: one connection behind a mutex, every call
//! moved onto the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::gateway::Role;
use crate::research::{ScopeKind, SearchMode};

// =============================================================================
// Types
// =============================================================================

/// What a persisted turn represents beyond its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Text,
    /// Synthetic notice that a request was stopped before any output.
    Cancelled,
    /// Partial answer persisted after a stop or a mid-stream failure.
    Truncated,
}

impl TurnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Cancelled => "cancelled",
            Self::Truncated => "truncated",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "cancelled" => Self::Cancelled,
            "truncated" => Self::Truncated,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Monotonic within a session, starting at 1.
    pub order: i64,
    pub reply_to: Option<String>,
    pub kind: TurnKind,
    pub cancelled: bool,
    pub cancellation_reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewTurn {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub reply_to: Option<String>,
    pub kind: TurnKind,
}

impl NewTurn {
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role: Role::User,
            content: content.into(),
            reply_to: None,
            kind: TurnKind::Text,
        }
    }

    pub fn assistant_reply(
        session_id: impl Into<String>,
        reply_to: impl Into<String>,
        content: impl Into<String>,
        kind: TurnKind,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role: Role::Assistant,
            content: content.into(),
            reply_to: Some(reply_to.into()),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchRequest {
    pub id: String,
    pub session_id: String,
    pub turn_id: String,
    pub enhanced_query: String,
    pub mode: SearchMode,
    /// JSON array of the source descriptors offered for this request.
    pub catalog_snapshot: String,
    pub catalog_hash: String,
    pub status: RequestStatus,
    /// Seconds from request creation to terminal status.
    pub processing_time: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewResearchRequest {
    pub session_id: String,
    pub turn_id: String,
    pub enhanced_query: String,
    pub mode: SearchMode,
    pub catalog_snapshot: String,
    pub catalog_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
    Timeout,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "success" => Self::Success,
            "timeout" => Self::Timeout,
            _ => Self::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Audit row for one dispatched search task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryLog {
    pub id: String,
    pub request_id: String,
    /// Position of the task in the dispatched batch.
    pub task_index: i64,
    pub query_text: String,
    pub scope_kind: ScopeKind,
    pub source_subset: Vec<String>,
    pub result_text: Option<String>,
    pub citations: Vec<String>,
    pub status: QueryStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewQueryLog {
    pub request_id: String,
    pub task_index: i64,
    pub query_text: String,
    pub scope_kind: ScopeKind,
    pub source_subset: Vec<String>,
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store closed")]
    Closed,
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a turn at the next `order` of its session.
    async fn append_turn(&self, turn: NewTurn) -> Result<Turn, StoreError>;

    async fn get_turn(&self, turn_id: &str) -> Result<Turn, StoreError>;

    /// Flip the cancellation flag. Returns `false` if it was already set; the
    /// first reason wins.
    async fn mark_cancelled(&self, turn_id: &str, reason: &str) -> Result<bool, StoreError>;

    async fn is_cancelled(&self, turn_id: &str) -> Result<bool, StoreError>;

    async fn find_cancellation_notice(&self, turn_id: &str) -> Result<Option<Turn>, StoreError>;

    /// Last `limit` turns of a session with `order <= up_to_order`, in
    /// chronological order, cancellation notices excluded.
    async fn recent_turns(
        &self,
        session_id: &str,
        up_to_order: i64,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError>;

    async fn turns_for_session(&self, session_id: &str) -> Result<Vec<Turn>, StoreError>;

    /// Cancel every not-yet-cancelled user turn of a session. Returns how many
    /// flags were flipped.
    async fn cancel_session(&self, session_id: &str, reason: &str) -> Result<usize, StoreError>;

    async fn create_research_request(
        &self,
        req: NewResearchRequest,
    ) -> Result<ResearchRequest, StoreError>;

    /// Move a pending request to a terminal status. Returns `false` when the
    /// request was already terminal.
    async fn update_research_request_status(
        &self,
        request_id: &str,
        status: RequestStatus,
        processing_time: Option<f64>,
    ) -> Result<bool, StoreError>;

    async fn get_research_request(&self, request_id: &str) -> Result<ResearchRequest, StoreError>;

    async fn research_request_for_turn(
        &self,
        turn_id: &str,
    ) -> Result<Option<ResearchRequest>, StoreError>;

    async fn research_requests_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ResearchRequest>, StoreError>;

    async fn append_query_log(&self, log: NewQueryLog) -> Result<QueryLog, StoreError>;

    /// Record a task's terminal outcome. Only a pending row moves; returns
    /// `false` when the row was already terminal.
    async fn update_query_log_result(
        &self,
        log_id: &str,
        status: QueryStatus,
        result_text: &str,
        citations: &[String],
    ) -> Result<bool, StoreError>;

    async fn query_logs_for_request(&self, request_id: &str) -> Result<Vec<QueryLog>, StoreError>;
}

// =============================================================================
// SQLite
// =============================================================================

const TURN_COLUMNS: &str = "id, session_id, role, content, turn_order, reply_to, kind, \
     cancelled, cancellation_reason, created_at";

const REQUEST_COLUMNS: &str = "id, session_id, turn_id, enhanced_query, mode, catalog_snapshot, \
     catalog_hash, status, processing_time, created_at, updated_at";

const QUERY_LOG_COLUMNS: &str = "id, request_id, task_index, query_text, scope_kind, \
     source_subset, result_text, citations, status, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
    /// One blocking thread waits on the mutex at a time.
    sem: Arc<Semaphore>,
}

impl SqliteConversationStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".compliance_research.sqlite")
    }

    /// Recovers from mutex poisoning; the connection itself is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn run<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS turns (\
               id TEXT PRIMARY KEY,\
               session_id TEXT NOT NULL,\
               role TEXT NOT NULL,\
               content TEXT NOT NULL,\
               turn_order INTEGER NOT NULL,\
               reply_to TEXT REFERENCES turns(id),\
               kind TEXT NOT NULL DEFAULT 'text',\
               cancelled INTEGER NOT NULL DEFAULT 0,\
               cancellation_reason TEXT,\
               created_at INTEGER NOT NULL,\
               UNIQUE(session_id, turn_order)\
             );\
             CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_one_notice \
               ON turns(reply_to) WHERE kind = 'cancelled';\
             CREATE TABLE IF NOT EXISTS research_requests (\
               id TEXT PRIMARY KEY,\
               session_id TEXT NOT NULL,\
               turn_id TEXT NOT NULL UNIQUE REFERENCES turns(id),\
               enhanced_query TEXT NOT NULL,\
               mode TEXT NOT NULL,\
               catalog_snapshot TEXT NOT NULL DEFAULT '[]',\
               catalog_hash TEXT NOT NULL DEFAULT '',\
               status TEXT NOT NULL DEFAULT 'pending',\
               processing_time REAL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS query_logs (\
               id TEXT PRIMARY KEY,\
               request_id TEXT NOT NULL REFERENCES research_requests(id) ON DELETE CASCADE,\
               task_index INTEGER NOT NULL,\
               query_text TEXT NOT NULL,\
               scope_kind TEXT NOT NULL,\
               source_subset TEXT NOT NULL DEFAULT '[]',\
               result_text TEXT,\
               citations TEXT NOT NULL DEFAULT '[]',\
               status TEXT NOT NULL DEFAULT 'pending',\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, turn_order);\
             CREATE INDEX IF NOT EXISTS idx_requests_session ON research_requests(session_id);\
             CREATE INDEX IF NOT EXISTS idx_query_logs_request ON query_logs(request_id, task_index);",
        )?;
        Ok(())
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn not_found(what: String) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what),
        other => StoreError::Sqlite(other),
    }
}

fn load_turn(conn: &Connection, turn_id: &str) -> Result<Turn, StoreError> {
    conn.query_row(
        &format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"),
        params![turn_id],
        row_to_turn,
    )
    .map_err(not_found(format!("turn {turn_id}")))
}

fn load_request(conn: &Connection, request_id: &str) -> Result<ResearchRequest, StoreError> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM research_requests WHERE id = ?1"),
        params![request_id],
        row_to_request,
    )
    .map_err(not_found(format!("research request {request_id}")))
}

fn collect_turns(conn: &Connection, sql: &str, session_id: &str) -> Result<Vec<Turn>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![session_id], row_to_turn)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn append_turn(&self, turn: NewTurn) -> Result<Turn, StoreError> {
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = now_epoch();
            let inserted = conn.execute(
                "INSERT INTO turns (id, session_id, role, content, turn_order, reply_to, kind, created_at) \
                 SELECT ?1, ?2, ?3, ?4, COALESCE(MAX(turn_order), 0) + 1, ?5, ?6, ?7 \
                 FROM turns WHERE session_id = ?2",
                params![
                    id,
                    turn.session_id,
                    turn.role.as_str(),
                    turn.content,
                    turn.reply_to,
                    turn.kind.as_str(),
                    now,
                ],
            );
            match inserted {
                Ok(_) => load_turn(conn, &id),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                    "turn for session {} rejected: {e}",
                    turn.session_id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_turn(&self, turn_id: &str) -> Result<Turn, StoreError> {
        let turn_id = turn_id.to_string();
        self.run(move |conn| load_turn(conn, &turn_id)).await
    }

    async fn mark_cancelled(&self, turn_id: &str, reason: &str) -> Result<bool, StoreError> {
        let turn_id = turn_id.to_string();
        let reason = reason.to_string();
        self.run(move |conn| {
            let rows = conn.execute(
                "UPDATE turns SET cancelled = 1, cancellation_reason = ?1 \
                 WHERE id = ?2 AND cancelled = 0",
                params![reason, turn_id],
            )?;
            if rows == 0 {
                // Distinguish "already cancelled" from "no such turn".
                load_turn(conn, &turn_id)?;
                return Ok(false);
            }
            Ok(true)
        })
        .await
    }

    async fn is_cancelled(&self, turn_id: &str) -> Result<bool, StoreError> {
        let turn_id = turn_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT cancelled FROM turns WHERE id = ?1",
                params![turn_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v != 0)
            .map_err(not_found(format!("turn {turn_id}")))
        })
        .await
    }

    async fn find_cancellation_notice(&self, turn_id: &str) -> Result<Option<Turn>, StoreError> {
        let turn_id = turn_id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {TURN_COLUMNS} FROM turns \
                         WHERE reply_to = ?1 AND kind = 'cancelled' LIMIT 1"
                    ),
                    params![turn_id],
                    row_to_turn,
                )
                .optional()?)
        })
        .await
    }

    async fn recent_turns(
        &self,
        session_id: &str,
        up_to_order: i64,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM turns \
                 WHERE session_id = ?1 AND turn_order <= ?2 AND kind != 'cancelled' \
                 ORDER BY turn_order DESC LIMIT ?3"
            ))?;
            let rows =
                stmt.query_map(params![session_id, up_to_order, limit as i64], row_to_turn)?;
            let mut turns = rows.collect::<Result<Vec<_>, _>>()?;
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    async fn turns_for_session(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            collect_turns(
                conn,
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 ORDER BY turn_order"
                ),
                &session_id,
            )
        })
        .await
    }

    async fn cancel_session(&self, session_id: &str, reason: &str) -> Result<usize, StoreError> {
        let session_id = session_id.to_string();
        let reason = reason.to_string();
        self.run(move |conn| {
            Ok(conn.execute(
                "UPDATE turns SET cancelled = 1, cancellation_reason = ?1 \
                 WHERE session_id = ?2 AND role = 'user' AND cancelled = 0",
                params![reason, session_id],
            )?)
        })
        .await
    }

    async fn create_research_request(
        &self,
        req: NewResearchRequest,
    ) -> Result<ResearchRequest, StoreError> {
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = now_epoch();
            let inserted = conn.execute(
                "INSERT INTO research_requests (id, session_id, turn_id, enhanced_query, mode, \
                 catalog_snapshot, catalog_hash, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    req.session_id,
                    req.turn_id,
                    req.enhanced_query,
                    req.mode.as_str(),
                    req.catalog_snapshot,
                    req.catalog_hash,
                    RequestStatus::Pending.as_str(),
                    now,
                ],
            );
            match inserted {
                Ok(_) => load_request(conn, &id),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                    "research request for turn {} already exists",
                    req.turn_id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update_research_request_status(
        &self,
        request_id: &str,
        status: RequestStatus,
        processing_time: Option<f64>,
    ) -> Result<bool, StoreError> {
        if status == RequestStatus::Pending {
            return Err(StoreError::InvalidTransition(format!(
                "research request {request_id} cannot return to pending"
            )));
        }
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let rows = conn.execute(
                "UPDATE research_requests SET status = ?1, processing_time = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), processing_time, now_epoch(), request_id],
            )?;
            if rows == 0 {
                load_request(conn, &request_id)?;
                return Ok(false);
            }
            Ok(true)
        })
        .await
    }

    async fn get_research_request(&self, request_id: &str) -> Result<ResearchRequest, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| load_request(conn, &request_id)).await
    }

    async fn research_request_for_turn(
        &self,
        turn_id: &str,
    ) -> Result<Option<ResearchRequest>, StoreError> {
        let turn_id = turn_id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {REQUEST_COLUMNS} FROM research_requests WHERE turn_id = ?1"),
                    params![turn_id],
                    row_to_request,
                )
                .optional()?)
        })
        .await
    }

    async fn research_requests_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ResearchRequest>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM research_requests \
                 WHERE session_id = ?1 ORDER BY created_at, rowid"
            ))?;
            let rows = stmt.query_map(params![session_id], row_to_request)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn append_query_log(&self, log: NewQueryLog) -> Result<QueryLog, StoreError> {
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = now_epoch();
            let subset = serde_json::to_string(&log.source_subset)?;
            conn.execute(
                "INSERT INTO query_logs (id, request_id, task_index, query_text, scope_kind, \
                 source_subset, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    log.request_id,
                    log.task_index,
                    log.query_text,
                    log.scope_kind.as_str(),
                    subset,
                    QueryStatus::Pending.as_str(),
                    now,
                ],
            )?;
            conn.query_row(
                &format!("SELECT {QUERY_LOG_COLUMNS} FROM query_logs WHERE id = ?1"),
                params![id],
                row_to_query_log,
            )
            .map_err(not_found(format!("query log {id}")))
        })
        .await
    }

    async fn update_query_log_result(
        &self,
        log_id: &str,
        status: QueryStatus,
        result_text: &str,
        citations: &[String],
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "query log {log_id} cannot return to pending"
            )));
        }
        let log_id = log_id.to_string();
        let result_text = result_text.to_string();
        let citations = serde_json::to_string(citations)?;
        self.run(move |conn| {
            let rows = conn.execute(
                "UPDATE query_logs SET status = ?1, result_text = ?2, citations = ?3, updated_at = ?4 \
                 WHERE id = ?5 AND status = 'pending'",
                params![status.as_str(), result_text, citations, now_epoch(), log_id],
            )?;
            if rows == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM query_logs WHERE id = ?1",
                        params![log_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return match exists {
                    Some(_) => Ok(false),
                    None => Err(StoreError::NotFound(format!("query log {log_id}"))),
                };
            }
            Ok(true)
        })
        .await
    }

    async fn query_logs_for_request(&self, request_id: &str) -> Result<Vec<QueryLog>, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUERY_LOG_COLUMNS} FROM query_logs \
                 WHERE request_id = ?1 ORDER BY task_index"
            ))?;
            let rows = stmt.query_map(params![request_id], row_to_query_log)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value {value:?}").into(),
    )
}

fn json_list(idx: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let role: String = row.get(2)?;
    Ok(Turn {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::from_str(&role).ok_or_else(|| bad_column(2, &role))?,
        content: row.get(3)?,
        order: row.get(4)?,
        reply_to: row.get(5)?,
        kind: TurnKind::from_str(&row.get::<_, String>(6)?),
        cancelled: row.get::<_, i64>(7)? != 0,
        cancellation_reason: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResearchRequest> {
    let mode: String = row.get(4)?;
    Ok(ResearchRequest {
        id: row.get(0)?,
        session_id: row.get(1)?,
        turn_id: row.get(2)?,
        enhanced_query: row.get(3)?,
        mode: SearchMode::from_str(&mode).ok_or_else(|| bad_column(4, &mode))?,
        catalog_snapshot: row.get(5)?,
        catalog_hash: row.get(6)?,
        status: RequestStatus::from_str(&row.get::<_, String>(7)?),
        processing_time: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_query_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryLog> {
    let scope: String = row.get(4)?;
    Ok(QueryLog {
        id: row.get(0)?,
        request_id: row.get(1)?,
        task_index: row.get(2)?,
        query_text: row.get(3)?,
        scope_kind: ScopeKind::from_str(&scope).ok_or_else(|| bad_column(4, &scope))?,
        source_subset: json_list(5, &row.get::<_, String>(5)?)?,
        result_text: row.get(6)?,
        citations: json_list(7, &row.get::<_, String>(7)?)?,
        status: QueryStatus::from_str(&row.get::<_, String>(8)?),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// =============================================================================
// Tests
// =============================================================================
