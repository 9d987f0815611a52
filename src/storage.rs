use std::{
    fmt, fs,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, OptionalExtension as _, Row, params};
use serde::{Deserialize, Serialize};

use crate::{
    capture::{CapturedRequest, CapturedResponse},
    config::Config,
};

const SCHEMA_VERSION: i32 = 1;

pub type InteractionId = i64;

/// One captured exchange as persisted. Never modified after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: InteractionId,
    pub request: CapturedRequest,
    pub response: CapturedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(InteractionId),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "interaction {id} was not found"),
            Self::Unavailable(message) => write!(f, "interaction store unavailable: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unavailable(format!("{err:#}"))
    }
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable keyed storage of captured interactions. Implementations accept
/// concurrent inserts and assign strictly increasing ids.
pub trait InteractionStore: Send + Sync + fmt::Debug {
    fn insert(
        &self,
        request: CapturedRequest,
        response: CapturedResponse,
    ) -> StoreFuture<'_, InteractionId>;

    fn get(&self, id: InteractionId) -> StoreFuture<'_, Interaction>;

    /// All interactions in id order.
    fn list(&self) -> StoreFuture<'_, Vec<Interaction>>;
}

/// Opens the SQLite store when `[storage] path` is configured, otherwise an
/// in-memory store that lives as long as the process.
pub fn open_store(config: &Config) -> anyhow::Result<Arc<dyn InteractionStore>> {
    match config.storage_path() {
        Some(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        None => Ok(Arc::new(MemoryStore::default())),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let mut conn = open_connection(&db_path)?;
        migrate(&mut conn)?;
        Ok(Self { db_path })
    }
}

impl InteractionStore for SqliteStore {
    fn insert(
        &self,
        request: CapturedRequest,
        response: CapturedResponse,
    ) -> StoreFuture<'_, InteractionId> {
        let db_path = self.db_path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                insert_interaction_blocking(&db_path, &request, &response)
            })
            .await
            .context("join insert_interaction task")?
            .map_err(StoreError::from)
        })
    }

    fn get(&self, id: InteractionId) -> StoreFuture<'_, Interaction> {
        let db_path = self.db_path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || get_interaction_blocking(&db_path, id))
                .await
                .context("join get_interaction task")??
                .ok_or(StoreError::NotFound(id))
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<Interaction>> {
        let db_path = self.db_path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || list_interactions_blocking(&db_path))
                .await
                .context("join list_interactions task")?
                .map_err(StoreError::from)
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    interactions: Mutex<Vec<Interaction>>,
}

impl MemoryStore {
    fn interactions(&self) -> std::sync::MutexGuard<'_, Vec<Interaction>> {
        self.interactions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InteractionStore for MemoryStore {
    fn insert(
        &self,
        request: CapturedRequest,
        response: CapturedResponse,
    ) -> StoreFuture<'_, InteractionId> {
        Box::pin(async move {
            let mut interactions = self.interactions();
            let id = interactions.last().map_or(1, |last| last.id + 1);
            interactions.push(Interaction {
                id,
                request,
                response,
            });
            Ok(id)
        })
    }

    fn get(&self, id: InteractionId) -> StoreFuture<'_, Interaction> {
        Box::pin(async move {
            self.interactions()
                .iter()
                .find(|interaction| interaction.id == id)
                .cloned()
                .ok_or(StoreError::NotFound(id))
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<Interaction>> {
        Box::pin(async move { Ok(self.interactions().clone()) })
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS interactions (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  request_method TEXT NOT NULL,
                  request_path TEXT NOT NULL,
                  request_json TEXT NOT NULL,
                  response_code INTEGER NOT NULL,
                  response_json TEXT NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported interactions schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn now_unix_ms() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")?;
    Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

fn insert_interaction_blocking(
    path: &Path,
    request: &CapturedRequest,
    response: &CapturedResponse,
) -> anyhow::Result<InteractionId> {
    let conn = open_connection(path)?;
    let request_json = serde_json::to_string(request).context("serialize captured request")?;
    let response_json = serde_json::to_string(response).context("serialize captured response")?;

    conn.execute(
        r#"
        INSERT INTO interactions (
          request_method,
          request_path,
          request_json,
          response_code,
          response_json,
          created_at_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            request.method,
            request.path,
            request_json,
            i64::from(response.code),
            response_json,
            now_unix_ms()?,
        ],
    )
    .context("insert interaction")?;

    Ok(conn.last_insert_rowid())
}

fn get_interaction_blocking(
    path: &Path,
    id: InteractionId,
) -> anyhow::Result<Option<Interaction>> {
    let conn = open_connection(path)?;
    conn.query_row(
        "SELECT id, request_json, response_json FROM interactions WHERE id = ?1",
        params![id],
        |row| Ok(row_to_parts(row)),
    )
    .optional()
    .with_context(|| format!("query interaction {id}"))?
    .transpose()?
    .map(StoredRow::into_interaction)
    .transpose()
}

fn list_interactions_blocking(path: &Path) -> anyhow::Result<Vec<Interaction>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT id, request_json, response_json FROM interactions ORDER BY id ASC")
        .context("prepare list interactions")?;

    let mut rows = stmt.query([]).context("query list interactions")?;
    let mut interactions = Vec::new();
    while let Some(row) = rows.next().context("iterate list interactions")? {
        interactions.push(row_to_parts(row)?.into_interaction()?);
    }
    Ok(interactions)
}

struct StoredRow {
    id: InteractionId,
    request_json: String,
    response_json: String,
}

impl StoredRow {
    fn into_interaction(self) -> anyhow::Result<Interaction> {
        let request = serde_json::from_str(&self.request_json)
            .with_context(|| format!("deserialize request of interaction {}", self.id))?;
        let response = serde_json::from_str(&self.response_json)
            .with_context(|| format!("deserialize response of interaction {}", self.id))?;
        Ok(Interaction {
            id: self.id,
            request,
            response,
        })
    }
}

fn row_to_parts(row: &Row<'_>) -> anyhow::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0).context("read interaction id")?,
        request_json: row.get(1).context("read request_json")?,
        response_json: row.get(2).context("read response_json")?,
    })
}
