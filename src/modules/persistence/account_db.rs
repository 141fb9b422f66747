use crate::error::StoreError;
use crate::models::{Account, AccountPatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Predicate over account records. Unset fields do not filter; time bounds
/// are strict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountQuery {
    pub automation_enabled: Option<bool>,
    pub notification_sent: Option<bool>,
    pub last_run_after: Option<i64>,
    pub last_run_before: Option<i64>,
}

impl AccountQuery {
    /// Automated accounts whose next run starts within `lead_secs` and who
    /// have not been reminded yet.
    pub fn pre_notify(now: i64, run_interval_secs: i64, lead_secs: i64) -> Self {
        Self {
            automation_enabled: Some(true),
            notification_sent: Some(false),
            last_run_after: Some(now - run_interval_secs),
            last_run_before: Some(now - run_interval_secs + lead_secs),
        }
    }

    /// Automated accounts whose last run is older than the run interval.
    pub fn due(now: i64, run_interval_secs: i64) -> Self {
        Self {
            automation_enabled: Some(true),
            notification_sent: None,
            last_run_after: None,
            last_run_before: Some(now - run_interval_secs),
        }
    }

    pub fn matches(&self, account: &Account) -> bool {
        self.automation_enabled
            .map_or(true, |v| account.auto_assemble_enabled == v)
            && self
                .notification_sent
                .map_or(true, |v| account.notification_sent == v)
            && self.last_run_after.map_or(true, |t| account.last_run_at > t)
            && self.last_run_before.map_or(true, |t| account.last_run_at < t)
    }
}

/// Storage surface the services need: point lookup, point update and
/// select-by-predicate.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Account>, StoreError>;

    async fn insert(&self, account: &Account) -> Result<(), StoreError>;

    /// Applies `patch` and returns the updated record.
    async fn update(&self, id: i64, patch: &AccountPatch) -> Result<Account, StoreError>;

    async fn select(&self, query: &AccountQuery) -> Result<Vec<Account>, StoreError>;

    async fn require(&self, id: i64) -> Result<Account, StoreError> {
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    /// Returns the stored account, creating it on first contact.
    async fn ensure(&self, id: i64, display_name: &str) -> Result<Account, StoreError> {
        if let Some(account) = self.get(id).await? {
            return Ok(account);
        }
        let account = Account::new(id, display_name.to_string());
        self.insert(&account).await?;
        tracing::info!("New account registered: {}", id);
        Ok(account)
    }
}

const ACCOUNT_COLUMNS: &str = "id, display_name, language, steam_name, refresh_token, uid, \
     public_uid, auth_token, auth_token_created_at, auto_assemble_enabled, last_run_at, \
     notification_sent, created_at";

/// SQLite-backed store. Every statement runs on the blocking pool.
pub struct SqliteAccountStore {
    conn: Arc<Mutex<Connection>>,
}

pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("mimbus.db")
}

impl SqliteAccountStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, job: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            job(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn init_db(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            display_name TEXT NOT NULL,
            language TEXT,
            steam_name TEXT,
            refresh_token TEXT,
            uid INTEGER,
            public_uid TEXT,
            auth_token TEXT,
            auth_token_created_at INTEGER,
            auto_assemble_enabled BOOLEAN NOT NULL DEFAULT 0,
            last_run_at INTEGER NOT NULL DEFAULT 0,
            notification_sent BOOLEAN NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_automation ON accounts(auto_assemble_enabled, last_run_at)",
        [],
    )?;
    Ok(())
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        display_name: row.get(1)?,
        language: row.get(2)?,
        steam_name: row.get(3)?,
        refresh_token: row.get(4)?,
        uid: row.get(5)?,
        public_uid: row.get(6)?,
        auth_token: row.get(7)?,
        auth_token_created_at: row.get(8)?,
        auto_assemble_enabled: row.get(9)?,
        last_run_at: row.get(10)?,
        notification_sent: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn load(conn: &Connection, id: i64) -> Result<Option<Account>, StoreError> {
    let sql = format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], row_to_account)
        .optional()?)
}

fn insert_row(conn: &Connection, account: &Account) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO accounts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        ACCOUNT_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            account.id,
            account.display_name,
            account.language,
            account.steam_name,
            account.refresh_token,
            account.uid,
            account.public_uid,
            account.auth_token,
            account.auth_token_created_at,
            account.auto_assemble_enabled,
            account.last_run_at,
            account.notification_sent,
            account.created_at,
        ],
    )?;
    Ok(())
}

fn update_row(conn: &mut Connection, id: i64, patch: &AccountPatch) -> Result<Account, StoreError> {
    let tx = conn.transaction()?;
    let mut account = load(&tx, id)?.ok_or(StoreError::NotFound(id))?;
    if patch.is_empty() {
        return Ok(account);
    }
    patch.apply(&mut account);
    tx.execute(
        "UPDATE accounts SET
            display_name = ?2,
            language = ?3,
            steam_name = ?4,
            refresh_token = ?5,
            uid = ?6,
            public_uid = ?7,
            auth_token = ?8,
            auth_token_created_at = ?9,
            auto_assemble_enabled = ?10,
            last_run_at = ?11,
            notification_sent = ?12
         WHERE id = ?1",
        params![
            account.id,
            account.display_name,
            account.language,
            account.steam_name,
            account.refresh_token,
            account.uid,
            account.public_uid,
            account.auth_token,
            account.auth_token_created_at,
            account.auto_assemble_enabled,
            account.last_run_at,
            account.notification_sent,
        ],
    )?;
    tx.commit()?;
    Ok(account)
}

fn select_rows(conn: &Connection, query: &AccountQuery) -> Result<Vec<Account>, StoreError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<i64> = Vec::new();
    if let Some(enabled) = query.automation_enabled {
        clauses.push("auto_assemble_enabled = ?");
        values.push(enabled as i64);
    }
    if let Some(sent) = query.notification_sent {
        clauses.push("notification_sent = ?");
        values.push(sent as i64);
    }
    if let Some(after) = query.last_run_after {
        clauses.push("last_run_at > ?");
        values.push(after);
    }
    if let Some(before) = query.last_run_before {
        clauses.push("last_run_at < ?");
        values.push(before);
    }

    let mut sql = format!("SELECT {} FROM accounts", ACCOUNT_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY last_run_at ASC, id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), row_to_account)?;
    let mut accounts = Vec::new();
    for row in rows {
        accounts.push(row?);
    }
    Ok(accounts)
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn get(&self, id: i64) -> Result<Option<Account>, StoreError> {
        self.run(move |conn| load(conn, id)).await
    }

    async fn insert(&self, account: &Account) -> Result<(), StoreError> {
        let account = account.clone();
        self.run(move |conn| insert_row(conn, &account)).await
    }

    async fn update(&self, id: i64, patch: &AccountPatch) -> Result<Account, StoreError> {
        let patch = patch.clone();
        self.run(move |conn| update_row(conn, id, &patch)).await
    }

    async fn select(&self, query: &AccountQuery) -> Result<Vec<Account>, StoreError> {
        let query = query.clone();
        self.run(move |conn| select_rows(conn, &query)).await
    }
}
