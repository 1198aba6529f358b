//! `SQLite` store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::Store;
use crate::display::EngineStatus;
use crate::model::{
    AccountId, AccountState, Capabilities, ConnectionState, FolderId, FolderState, FolderType,
    ImapConfig, KeepAlive, MessageId, NewMessage, NewOperation, Operation, OperationId,
    OperationKind, Quota, Security, ThreadInfo, ThreadMerge, normalize_subject,
};
use crate::{Error, Result};

const ACCOUNT_COLUMNS: &str = r"
    a.id, a.name, a.email,
    a.imap_host, a.imap_port, a.imap_security, a.imap_username, a.imap_password,
    a.synchronize, a.ondemand, a.poll_exempted, a.tbd,
    a.keep_alive_interval, a.keep_alive_ok, a.keep_alive_failed, a.keep_alive_succeeded,
    a.state, a.last_connected, a.backoff_until, a.cap_idle, a.cap_utf8,
    a.quota_usage, a.quota_limit, a.error, a.warning,
    (SELECT COUNT(*) FROM folders f
        WHERE f.account = a.id AND f.selectable = 1 AND f.synchronize = 1) AS folder_count,
    (SELECT COUNT(*) FROM operations o WHERE o.account = a.id) AS operation_count
";

const MESSAGE_COLUMNS: &str = r"
    id, account, folder, uid, msgid, refs, in_reply_to, hash, thread, sender, subject, received
";

/// Store backed by an `SQLite` database.
pub struct SqliteStore {
    pool: SqlitePool,
    accounts_tx: watch::Sender<u64>,
    operations_tx: watch::Sender<u64>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self::with_pool(pool);
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::with_pool(pool);
        store.initialize().await?;
        Ok(store)
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            accounts_tx: watch::channel(0).0,
            operations_tx: watch::channel(0).0,
        }
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                imap_host TEXT NOT NULL,
                imap_port INTEGER NOT NULL,
                imap_security TEXT NOT NULL,
                imap_username TEXT NOT NULL,
                imap_password TEXT NOT NULL,
                synchronize INTEGER NOT NULL DEFAULT 1,
                ondemand INTEGER NOT NULL DEFAULT 0,
                poll_exempted INTEGER NOT NULL DEFAULT 0,
                tbd INTEGER NOT NULL DEFAULT 0,
                keep_alive_interval INTEGER NOT NULL,
                keep_alive_ok INTEGER NOT NULL DEFAULT 0,
                keep_alive_failed INTEGER NOT NULL DEFAULT 0,
                keep_alive_succeeded INTEGER NOT NULL DEFAULT 0,
                state TEXT,
                last_connected TEXT,
                backoff_until TEXT,
                cap_idle INTEGER NOT NULL DEFAULT 0,
                cap_utf8 INTEGER NOT NULL DEFAULT 0,
                quota_usage INTEGER,
                quota_limit INTEGER,
                error TEXT,
                warning TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account INTEGER NOT NULL,
                name TEXT NOT NULL,
                folder_type TEXT NOT NULL,
                selectable INTEGER NOT NULL DEFAULT 1,
                synchronize INTEGER NOT NULL DEFAULT 1,
                poll INTEGER NOT NULL DEFAULT 0,
                poll_factor INTEGER NOT NULL DEFAULT 1,
                poll_count INTEGER NOT NULL DEFAULT 0,
                state TEXT,
                read_only INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                UNIQUE(account, name)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account INTEGER NOT NULL,
                folder INTEGER NOT NULL,
                kind TEXT NOT NULL,
                priority INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created TEXT NOT NULL,
                tries INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account INTEGER NOT NULL,
                folder INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                msgid TEXT NOT NULL,
                refs TEXT NOT NULL,
                in_reply_to TEXT,
                hash TEXT NOT NULL,
                thread TEXT NOT NULL,
                sender TEXT,
                subject TEXT,
                subject_key TEXT,
                received TEXT NOT NULL,
                UNIQUE(folder, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(account, thread)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_messages_msgid ON messages(account, msgid)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                running_accounts INTEGER NOT NULL,
                pending_operations INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn accounts_changed(&self) {
        self.accounts_tx.send_modify(|v| *v += 1);
    }

    fn operations_changed(&self) {
        self.operations_tx.send_modify(|v| *v += 1);
        self.accounts_changed();
    }

    async fn messages_where(&self, clause: &str, binds: &[Bind<'_>]) -> Result<Vec<ThreadInfo>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {clause} ORDER BY id");
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(*v),
                Bind::Text(v) => query.bind(*v),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_message).collect())
    }
}

enum Bind<'a> {
    Int(i64),
    Text(&'a str),
}

#[async_trait]
impl Store for SqliteStore {
    async fn accounts(&self) -> Result<Vec<AccountState>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a ORDER BY a.id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_account).collect())
    }

    async fn account(&self, id: AccountId) -> Result<Option<AccountState>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_account))
    }

    async fn add_account(&self, account: &AccountState) -> Result<AccountId> {
        let result = sqlx::query(
            r"
            INSERT INTO accounts (
                name, email,
                imap_host, imap_port, imap_security, imap_username, imap_password,
                synchronize, ondemand, poll_exempted,
                keep_alive_interval, keep_alive_ok, keep_alive_failed, keep_alive_succeeded
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.imap.host)
        .bind(i64::from(account.imap.port))
        .bind(account.imap.security.as_str())
        .bind(&account.imap.username)
        .bind(&account.imap.password)
        .bind(account.synchronize)
        .bind(account.ondemand)
        .bind(account.poll_exempted)
        .bind(i64::from(account.keep_alive.interval))
        .bind(account.keep_alive.ok)
        .bind(i64::from(account.keep_alive.failed))
        .bind(i64::from(account.keep_alive.succeeded))
        .execute(&self.pool)
        .await?;

        let id = AccountId::new(result.last_insert_rowid());
        debug!(account = %id, "Account added");
        self.accounts_changed();
        Ok(id)
    }

    async fn update_account(&self, account: &AccountState) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE accounts SET
                name = ?, email = ?,
                imap_host = ?, imap_port = ?, imap_security = ?,
                imap_username = ?, imap_password = ?,
                synchronize = ?, ondemand = ?, poll_exempted = ?,
                keep_alive_interval = ?, keep_alive_ok = ?,
                keep_alive_failed = ?, keep_alive_succeeded = ?
            WHERE id = ?
            ",
        )
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.imap.host)
        .bind(i64::from(account.imap.port))
        .bind(account.imap.security.as_str())
        .bind(&account.imap.username)
        .bind(&account.imap.password)
        .bind(account.synchronize)
        .bind(account.ondemand)
        .bind(account.poll_exempted)
        .bind(i64::from(account.keep_alive.interval))
        .bind(account.keep_alive.ok)
        .bind(i64::from(account.keep_alive.failed))
        .bind(i64::from(account.keep_alive.succeeded))
        .bind(account.id.0)
        .execute(&self.pool)
        .await?;

        account_updated(result.rows_affected(), account.id)?;
        self.accounts_changed();
        Ok(())
    }

    async fn mark_account_deleted(&self, id: AccountId) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET tbd = 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        account_updated(result.rows_affected(), id)?;
        self.accounts_changed();
        Ok(())
    }

    async fn delete_account(&self, id: AccountId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "operations", "folders"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE account = ?"))
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(account = %id, "Account deleted");
        self.operations_changed();
        Ok(())
    }

    async fn reset_account(&self, id: AccountId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result =
            sqlx::query("UPDATE accounts SET state = NULL, backoff_until = NULL WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        account_updated(result.rows_affected(), id)?;

        sqlx::query("UPDATE folders SET state = NULL, poll_count = 0 WHERE account = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE operations SET error = NULL WHERE account = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.accounts_changed();
        Ok(())
    }

    async fn set_account_state(
        &self,
        id: AccountId,
        state: Option<ConnectionState>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET state = ? WHERE id = ?")
            .bind(state.map(ConnectionState::as_str))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_connected(&self, id: AccountId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET last_connected = ? WHERE id = ?")
            .bind(format_time(at))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_backoff(
        &self,
        id: AccountId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET backoff_until = ? WHERE id = ?")
            .bind(until.map(format_time))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_error(&self, id: AccountId, error: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_warning(&self, id: AccountId, warning: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET warning = ? WHERE id = ?")
            .bind(warning)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_capabilities(
        &self,
        id: AccountId,
        capabilities: Capabilities,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET cap_idle = ?, cap_utf8 = ? WHERE id = ?")
            .bind(capabilities.idle)
            .bind(capabilities.utf8)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_keep_alive(&self, id: AccountId, keep_alive: KeepAlive) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE accounts SET
                keep_alive_interval = ?, keep_alive_ok = ?,
                keep_alive_failed = ?, keep_alive_succeeded = ?
            WHERE id = ?
            ",
        )
        .bind(i64::from(keep_alive.interval))
        .bind(keep_alive.ok)
        .bind(i64::from(keep_alive.failed))
        .bind(i64::from(keep_alive.succeeded))
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn set_account_quota(&self, id: AccountId, quota: Option<Quota>) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET quota_usage = ?, quota_limit = ? WHERE id = ?")
            .bind(quota.map(|q| clamp_i64(q.usage)))
            .bind(quota.map(|q| clamp_i64(q.limit)))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        account_updated(result.rows_affected(), id)
    }

    async fn folders(&self, account: AccountId) -> Result<Vec<FolderState>> {
        let rows = sqlx::query("SELECT * FROM folders WHERE account = ? ORDER BY id")
            .bind(account.0)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_folder).collect())
    }

    async fn folder(&self, id: FolderId) -> Result<Option<FolderState>> {
        let row = sqlx::query("SELECT * FROM folders WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_folder))
    }

    async fn add_folder(&self, folder: &FolderState) -> Result<FolderId> {
        let result = sqlx::query(
            r"
            INSERT INTO folders (
                account, name, folder_type, selectable, synchronize, poll, poll_factor
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(folder.account.0)
        .bind(&folder.name)
        .bind(folder.folder_type.as_str())
        .bind(folder.selectable)
        .bind(folder.synchronize)
        .bind(folder.poll)
        .bind(i64::from(folder.poll_factor))
        .execute(&self.pool)
        .await?;

        self.accounts_changed();
        Ok(FolderId::new(result.last_insert_rowid()))
    }

    async fn set_folder_state(&self, id: FolderId, state: Option<ConnectionState>) -> Result<()> {
        let result = sqlx::query("UPDATE folders SET state = ? WHERE id = ?")
            .bind(state.map(ConnectionState::as_str))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        folder_updated(result.rows_affected(), id)
    }

    async fn set_folder_states(
        &self,
        account: AccountId,
        state: Option<ConnectionState>,
    ) -> Result<()> {
        sqlx::query("UPDATE folders SET state = ? WHERE account = ?")
            .bind(state.map(ConnectionState::as_str))
            .bind(account.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_folder_read_only(&self, id: FolderId, read_only: bool) -> Result<()> {
        let result = sqlx::query("UPDATE folders SET read_only = ? WHERE id = ?")
            .bind(read_only)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        folder_updated(result.rows_affected(), id)
    }

    async fn set_folder_error(&self, id: FolderId, error: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE folders SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        folder_updated(result.rows_affected(), id)
    }

    async fn set_folder_poll(&self, id: FolderId, poll: bool) -> Result<()> {
        let result = sqlx::query("UPDATE folders SET poll = ? WHERE id = ?")
            .bind(poll)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        folder_updated(result.rows_affected(), id)
    }

    async fn set_folder_poll_count(&self, id: FolderId, count: u32) -> Result<()> {
        let result = sqlx::query("UPDATE folders SET poll_count = ? WHERE id = ?")
            .bind(i64::from(count))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        folder_updated(result.rows_affected(), id)
    }

    async fn set_folder_synchronize(&self, id: FolderId, synchronize: bool) -> Result<()> {
        let result = sqlx::query("UPDATE folders SET synchronize = ? WHERE id = ?")
            .bind(synchronize)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        folder_updated(result.rows_affected(), id)?;
        self.accounts_changed();
        Ok(())
    }

    async fn enqueue_operation(
        &self,
        operation: &NewOperation,
        force: bool,
    ) -> Result<Option<OperationId>> {
        let payload = serde_json::to_string(&operation.payload)?;

        let mut tx = self.pool.begin().await?;
        if !force {
            let existing = sqlx::query(
                "SELECT id FROM operations WHERE folder = ? AND kind = ? AND payload = ? LIMIT 1",
            )
            .bind(operation.folder.0)
            .bind(operation.kind.as_str())
            .bind(&payload)
            .fetch_optional(&mut *tx)
            .await?;
            if existing.is_some() {
                return Ok(None);
            }
        }

        let result = sqlx::query(
            r"
            INSERT INTO operations (account, folder, kind, priority, payload, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(operation.account.0)
        .bind(operation.folder.0)
        .bind(operation.kind.as_str())
        .bind(i64::from(operation.priority))
        .bind(&payload)
        .bind(format_time(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.operations_changed();
        Ok(Some(OperationId(result.last_insert_rowid())))
    }

    async fn pending_operations(&self, account: AccountId) -> Result<Vec<Operation>> {
        let rows = sqlx::query("SELECT * FROM operations WHERE account = ? ORDER BY id")
            .bind(account.0)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(row_to_operation).collect())
    }

    async fn operations(
        &self,
        folder: FolderId,
        kind: Option<OperationKind>,
    ) -> Result<Vec<Operation>> {
        let rows = sqlx::query(
            "SELECT * FROM operations WHERE folder = ? AND (? IS NULL OR kind = ?) ORDER BY id",
        )
        .bind(folder.0)
        .bind(kind.map(OperationKind::as_str))
        .bind(kind.map(OperationKind::as_str))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(row_to_operation).collect())
    }

    async fn account_operations(
        &self,
        account: AccountId,
        kind: OperationKind,
    ) -> Result<Vec<Operation>> {
        let rows = sqlx::query("SELECT * FROM operations WHERE account = ? AND kind = ? ORDER BY id")
            .bind(account.0)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(row_to_operation).collect())
    }

    async fn delete_operation(&self, id: OperationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.operations_changed();
        }
        Ok(removed)
    }

    async fn set_operation_error(&self, id: OperationId, error: &str) -> Result<()> {
        sqlx::query("UPDATE operations SET tries = tries + 1, error = ? WHERE id = ?")
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn watch_operations(&self) -> watch::Receiver<u64> {
        self.operations_tx.subscribe()
    }

    fn watch_accounts(&self) -> watch::Receiver<u64> {
        self.accounts_tx.subscribe()
    }

    async fn messages_by_msgid(
        &self,
        account: AccountId,
        msgids: &[String],
    ) -> Result<Vec<ThreadInfo>> {
        if msgids.is_empty() {
            return Ok(Vec::new());
        }
        let list = serde_json::to_string(msgids)?;
        self.messages_where(
            "account = ? AND msgid IN (SELECT value FROM json_each(?))",
            &[Bind::Int(account.0), Bind::Text(&list)],
        )
        .await
    }

    async fn messages_referencing(
        &self,
        account: AccountId,
        msgid: &str,
    ) -> Result<Vec<ThreadInfo>> {
        self.messages_where(
            r"account = ? AND (in_reply_to = ?
                OR EXISTS (SELECT 1 FROM json_each(messages.refs) WHERE value = ?))",
            &[Bind::Int(account.0), Bind::Text(msgid), Bind::Text(msgid)],
        )
        .await
    }

    async fn messages_by_subject(
        &self,
        account: AccountId,
        sender: &str,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ThreadInfo>> {
        let since = format_time(since);
        self.messages_where(
            "account = ? AND sender = ? AND subject_key = ? AND received >= ?",
            &[
                Bind::Int(account.0),
                Bind::Text(sender),
                Bind::Text(subject),
                Bind::Text(&since),
            ],
        )
        .await
    }

    async fn message(&self, folder: FolderId, uid: u32) -> Result<Option<ThreadInfo>> {
        let found = self
            .messages_where(
                "folder = ? AND uid = ?",
                &[Bind::Int(folder.0), Bind::Int(i64::from(uid))],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn message_uids(&self, folder: FolderId) -> Result<Vec<u32>> {
        let rows = sqlx::query("SELECT uid FROM messages WHERE folder = ? ORDER BY uid")
            .bind(folder.0)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| u32::try_from(row.get::<i64, _>("uid")).ok())
            .collect())
    }

    async fn store_message(
        &self,
        message: &NewMessage,
        merges: &[ThreadMerge],
    ) -> Result<MessageId> {
        let refs = serde_json::to_string(&message.references)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r"
            INSERT INTO messages (
                account, folder, uid, msgid, refs, in_reply_to, hash, thread,
                sender, subject, subject_key, received
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(folder, uid) DO UPDATE SET
                msgid = excluded.msgid, refs = excluded.refs,
                in_reply_to = excluded.in_reply_to, hash = excluded.hash,
                thread = excluded.thread, sender = excluded.sender,
                subject = excluded.subject, subject_key = excluded.subject_key,
                received = excluded.received
            RETURNING id
            ",
        )
        .bind(message.account.0)
        .bind(message.folder.0)
        .bind(i64::from(message.uid))
        .bind(&message.msgid)
        .bind(&refs)
        .bind(&message.in_reply_to)
        .bind(&message.hash)
        .bind(&message.thread)
        .bind(&message.sender)
        .bind(&message.subject)
        .bind(message.subject.as_deref().map(normalize_subject))
        .bind(format_time(message.received))
        .fetch_one(&mut *tx)
        .await?;
        let id = MessageId(row.get("id"));

        for merge in merges {
            let changed =
                rethread(&mut tx, message.account, &merge.from, &merge.to, merge.since).await?;
            debug!(from = %merge.from, to = %merge.to, changed, "Threads merged");
        }
        tx.commit().await?;

        Ok(id)
    }

    async fn update_message_thread(
        &self,
        account: AccountId,
        old: &str,
        new: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        rethread(&mut conn, account, old, new, since).await
    }

    async fn delete_message(&self, folder: FolderId, uid: u32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE folder = ? AND uid = ?")
            .bind(folder.0)
            .bind(i64::from(uid))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_status(&self, status: EngineStatus) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO status (id, running_accounts, pending_operations) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                running_accounts = excluded.running_accounts,
                pending_operations = excluded.pending_operations
            ",
        )
        .bind(i64::try_from(status.running_accounts).unwrap_or(i64::MAX))
        .bind(i64::from(status.pending_operations))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn status(&self) -> Result<EngineStatus> {
        let row = sqlx::query("SELECT running_accounts, pending_operations FROM status WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map_or_else(EngineStatus::default, |row| EngineStatus {
            running_accounts: usize::try_from(row.get::<i64, _>("running_accounts")).unwrap_or(0),
            pending_operations: to_u32(row.get("pending_operations")),
        }))
    }
}

async fn rethread(
    conn: &mut SqliteConnection,
    account: AccountId,
    old: &str,
    new: &str,
    since: Option<DateTime<Utc>>,
) -> Result<u64> {
    let since = since.map(format_time);
    let result = sqlx::query(
        r"
        UPDATE messages SET thread = ?
        WHERE account = ? AND thread = ? AND (? IS NULL OR received >= ?)
        ",
    )
    .bind(new)
    .bind(account.0)
    .bind(old)
    .bind(&since)
    .bind(&since)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

fn account_updated(rows: u64, id: AccountId) -> Result<()> {
    if rows == 0 {
        return Err(Error::AccountNotFound(id));
    }
    Ok(())
}

fn folder_updated(rows: u64, id: FolderId) -> Result<()> {
    if rows == 0 {
        return Err(Error::FolderNotFound(id.to_string()));
    }
    Ok(())
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_account(row: &SqliteRow) -> AccountState {
    let quota = match (
        row.get::<Option<i64>, _>("quota_usage"),
        row.get::<Option<i64>, _>("quota_limit"),
    ) {
        (Some(usage), Some(limit)) => Some(Quota {
            usage: u64::try_from(usage).unwrap_or(0),
            limit: u64::try_from(limit).unwrap_or(0),
        }),
        _ => None,
    };

    AccountState {
        id: AccountId::new(row.get("id")),
        name: row.get("name"),
        email: row.get("email"),
        imap: ImapConfig {
            host: row.get("imap_host"),
            port: u16::try_from(row.get::<i64, _>("imap_port")).unwrap_or(0),
            security: Security::parse(&row.get::<String, _>("imap_security")),
            username: row.get("imap_username"),
            password: row.get("imap_password"),
        },
        synchronize: row.get::<i64, _>("synchronize") != 0,
        ondemand: row.get::<i64, _>("ondemand") != 0,
        poll_exempted: row.get::<i64, _>("poll_exempted") != 0,
        tbd: row.get::<i64, _>("tbd") != 0,
        keep_alive: KeepAlive {
            interval: to_u32(row.get("keep_alive_interval")),
            ok: row.get::<i64, _>("keep_alive_ok") != 0,
            failed: to_u32(row.get("keep_alive_failed")),
            succeeded: to_u32(row.get("keep_alive_succeeded")),
        },
        state: row
            .get::<Option<String>, _>("state")
            .as_deref()
            .and_then(ConnectionState::parse),
        last_connected: parse_time(row.get("last_connected")),
        backoff_until: parse_time(row.get("backoff_until")),
        capabilities: Capabilities {
            idle: row.get::<i64, _>("cap_idle") != 0,
            utf8: row.get::<i64, _>("cap_utf8") != 0,
        },
        quota,
        error: row.get("error"),
        warning: row.get("warning"),
        folders: to_u32(row.get("folder_count")),
        operations: to_u32(row.get("operation_count")),
    }
}

fn row_to_folder(row: &SqliteRow) -> FolderState {
    FolderState {
        id: FolderId::new(row.get("id")),
        account: AccountId::new(row.get("account")),
        name: row.get("name"),
        folder_type: FolderType::parse(&row.get::<String, _>("folder_type")),
        selectable: row.get::<i64, _>("selectable") != 0,
        synchronize: row.get::<i64, _>("synchronize") != 0,
        poll: row.get::<i64, _>("poll") != 0,
        poll_factor: to_u32(row.get("poll_factor")),
        poll_count: to_u32(row.get("poll_count")),
        state: row
            .get::<Option<String>, _>("state")
            .as_deref()
            .and_then(ConnectionState::parse),
        read_only: row.get::<i64, _>("read_only") != 0,
        error: row.get("error"),
    }
}

fn row_to_operation(row: &SqliteRow) -> Option<Operation> {
    let id = OperationId(row.get("id"));
    let kind: String = row.get("kind");
    let Some(kind) = OperationKind::parse(&kind) else {
        warn!(operation = %id, kind, "Skipping operation of unknown kind");
        return None;
    };

    Some(Operation {
        id,
        account: AccountId::new(row.get("account")),
        folder: FolderId::new(row.get("folder")),
        kind,
        priority: u8::try_from(row.get::<i64, _>("priority")).unwrap_or(u8::MAX),
        payload: serde_json::from_str(&row.get::<String, _>("payload")).unwrap_or_default(),
        created: parse_time(row.get("created")).unwrap_or_default(),
        tries: to_u32(row.get("tries")),
        error: row.get("error"),
    })
}

fn row_to_message(row: &SqliteRow) -> ThreadInfo {
    ThreadInfo {
        id: MessageId(row.get("id")),
        account: AccountId::new(row.get("account")),
        folder: FolderId::new(row.get("folder")),
        uid: to_u32(row.get("uid")),
        msgid: row.get("msgid"),
        references: serde_json::from_str(&row.get::<String, _>("refs")).unwrap_or_default(),
        in_reply_to: row.get("in_reply_to"),
        hash: row.get("hash"),
        thread: row.get("thread"),
        sender: row.get("sender"),
        subject: row.get("subject"),
        received: parse_time(row.get("received")).unwrap_or_default(),
    }
}
