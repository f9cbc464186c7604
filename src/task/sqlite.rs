//! SQLite-backed task store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    now_string, select_next_todo, DeployOutcome, DeployRecord, NewTask, Task, TaskError, TaskId,
    TaskRepository, TaskStatus, TaskUpdate, UnresolvedConflict,
};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    verification_command TEXT NOT NULL,
    estimated_test_cases INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'TODO',
    branch TEXT,
    parent_id TEXT,
    dependencies TEXT NOT NULL DEFAULT '[]',
    error TEXT,
    test_path TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, seq);

CREATE TABLE IF NOT EXISTS deploy_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    outcome TEXT NOT NULL,
    commit_hash TEXT,
    error TEXT,
    attempted TEXT NOT NULL DEFAULT '[]',
    merged TEXT NOT NULL DEFAULT '[]',
    conflicts TEXT NOT NULL DEFAULT '[]',
    resolved_files TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);
"#;

const TASK_COLUMNS: &str = "id, description, verification_command, estimated_test_cases, status, \
     branch, parent_id, dependencies, error, test_path, created_at, updated_at";

fn storage(e: impl std::fmt::Display) -> TaskError {
    TaskError::Storage(e.to_string())
}

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    max_test_cases: u32,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn open(db_path: PathBuf, max_test_cases: u32) -> Result<Self, TaskError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskError::Storage(format!("Failed to create store dir: {}", e)))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| TaskError::Storage(format!("Failed to open SQLite database: {}", e)))?;
            Self::init(&conn)?;
            Ok::<_, TaskError>(conn)
        })
        .await
        .map_err(storage)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_test_cases,
        })
    }

    /// Private database that vanishes on drop.
    pub fn in_memory(max_test_cases: u32) -> Result<Self, TaskError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_test_cases,
        })
    }

    fn init(conn: &Connection) -> Result<(), TaskError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| TaskError::Storage(format!("Failed to run schema: {}", e)))?;
        Self::run_migrations(conn)
    }

    /// CREATE TABLE IF NOT EXISTS doesn't add columns to existing tables.
    fn run_migrations(conn: &Connection) -> Result<(), TaskError> {
        let has_test_path: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = 'test_path'")
            .map_err(storage)?
            .exists([])
            .map_err(storage)?;

        if !has_test_path {
            tracing::info!("Running migration: adding 'test_path' column to tasks table");
            conn.execute("ALTER TABLE tasks ADD COLUMN test_path TEXT", [])
                .map_err(|e| TaskError::Storage(format!("Failed to add test_path column: {}", e)))?;
        }

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, TaskError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(storage)?
    }
}

/// A stored text column that does not parse into its type.
fn decode<T, E>(column: usize, value: Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    value.map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let parent_id: Option<String> = row.get(6)?;
    let dependencies: String = row.get(7)?;

    Ok(Task {
        id: decode(0, id.parse::<TaskId>())?,
        description: row.get(1)?,
        verification_command: row.get(2)?,
        estimated_test_cases: row.get::<_, i64>(3)?.max(0) as u32,
        status: decode(4, status.parse::<TaskStatus>())?,
        branch: row.get(5)?,
        parent_id: parent_id
            .map(|p| decode(6, p.parse::<TaskId>()))
            .transpose()?,
        dependencies: decode(7, serde_json::from_str(&dependencies))?,
        error: row.get(8)?,
        test_path: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn load_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, TaskError> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        params![id.to_string()],
        row_to_task,
    )
    .optional()
    .map_err(storage)
}

fn load_tasks(conn: &Connection, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError> {
    let (sql, args) = match status {
        Some(status) => (
            format!("SELECT {} FROM tasks WHERE status = ?1 ORDER BY seq", TASK_COLUMNS),
            vec![status.as_str().to_string()],
        ),
        None => (format!("SELECT {} FROM tasks ORDER BY seq", TASK_COLUMNS), vec![]),
    };
    let mut stmt = conn.prepare(&sql).map_err(storage)?;
    let tasks = stmt
        .query_map(rusqlite::params_from_iter(args), row_to_task)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(tasks)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, TaskError> {
    serde_json::to_string(value).map_err(storage)
}

#[async_trait]
impl TaskRepository for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    fn max_test_cases(&self) -> u32 {
        self.max_test_cases
    }

    async fn create(&self, task: NewTask) -> Result<Task, TaskError> {
        task.validate(self.max_test_cases)?;
        let task = Task::from_new(task, now_string());
        let dependencies = to_json(&task.dependencies)?;
        let row = task.clone();

        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    TASK_COLUMNS
                ),
                params![
                    row.id.to_string(),
                    row.description,
                    row.verification_command,
                    i64::from(row.estimated_test_cases),
                    row.status.as_str(),
                    row.branch,
                    row.parent_id.map(|p| p.to_string()),
                    dependencies,
                    row.error,
                    row.test_path,
                    row.created_at,
                    row.updated_at,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await?;

        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        self.with_conn(move |conn| load_task(conn, id)).await
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError> {
        self.with_conn(move |conn| {
            let mut task = load_task(conn, id)?.ok_or(TaskError::NotFound(id))?;
            task.apply(update, now_string())?;
            conn.execute(
                "UPDATE tasks SET status = ?2, branch = ?3, error = ?4, test_path = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    task.status.as_str(),
                    task.branch,
                    task.error,
                    task.test_path,
                    task.updated_at,
                ],
            )
            .map_err(storage)?;
            Ok(task)
        })
        .await
    }

    async fn next_todo(&self) -> Result<Option<Task>, TaskError> {
        self.with_conn(|conn| {
            let tasks = load_tasks(conn, None)?;
            Ok(select_next_todo(&tasks).cloned())
        })
        .await
    }

    async fn all_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskError> {
        self.with_conn(move |conn| load_tasks(conn, Some(status))).await
    }

    async fn all(&self) -> Result<Vec<Task>, TaskError> {
        self.with_conn(|conn| load_tasks(conn, None)).await
    }

    async fn append_deploy_record(&self, record: DeployRecord) -> Result<(), TaskError> {
        let attempted = to_json(&record.attempted)?;
        let merged = to_json(&record.merged)?;
        let conflicts = to_json(&record.conflicts)?;
        let resolved_files = to_json(&record.resolved_files)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO deploy_records
                     (id, outcome, commit_hash, error, attempted, merged, conflicts, resolved_files, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.outcome.as_str(),
                    record.commit_hash,
                    record.error,
                    attempted,
                    merged,
                    conflicts,
                    resolved_files,
                    record.created_at,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn deploy_records(&self) -> Result<Vec<DeployRecord>, TaskError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, outcome, commit_hash, error, attempted, merged, conflicts,
                            resolved_files, created_at
                     FROM deploy_records ORDER BY seq",
                )
                .map_err(storage)?;

            let records = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let outcome: String = row.get(1)?;
                    let attempted: String = row.get(4)?;
                    let merged: String = row.get(5)?;
                    let conflicts: String = row.get(6)?;
                    let resolved_files: String = row.get(7)?;

                    Ok(DeployRecord {
                        id: decode(0, Uuid::parse_str(&id))?,
                        attempted: serde_json::from_str(&attempted).unwrap_or_default(),
                        merged: serde_json::from_str(&merged).unwrap_or_default(),
                        conflicts: serde_json::from_str::<Vec<UnresolvedConflict>>(&conflicts)
                            .unwrap_or_default(),
                        resolved_files: serde_json::from_str(&resolved_files).unwrap_or_default(),
                        outcome: DeployOutcome::parse(&outcome).unwrap_or(DeployOutcome::Failed),
                        commit_hash: row.get(2)?,
                        error: row.get(3)?,
                        created_at: row.get(8)?,
                    })
                })
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;

            Ok(records)
        })
        .await
    }
}
