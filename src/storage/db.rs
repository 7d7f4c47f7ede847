use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::TaskError;
use crate::task::{TaskSpec, TaskState, WrappedTask};
use crate::types::{
    now_ts, BodyInfo, ConvId, ConversationInfo, HeaderInfo, MessageId, RawSyncState, TaskId,
};

use super::{Loaded, LockKey, Mutations, NewData, Selectors, TaskBookkeeping};

/// SQLite-backed store implementing the transaction collaborator contract:
/// plain reads, exclusive-until-commit mutate loads, and one atomic
/// `finish_mutate` per task invocation.
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
    /// Entity locks taken by `begin_mutate`, keyed to the owning task.
    /// Held until the owner's teardown; waiters park on `lock_notify`.
    locks: StdMutex<HashMap<LockKey, TaskId>>,
    lock_notify: Notify,
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("parsing sqlite path {}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("connecting to sqlite at {}", path.display()))?;

        let db = Database {
            pool,
            path: path.to_path_buf(),
            locks: StdMutex::new(HashMap::new()),
            lock_notify: Notify::new(),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_states (
                account_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                subject TEXT,
                participants TEXT NOT NULL,
                date_oldest_ts INTEGER NOT NULL,
                date_newest_ts INTEGER NOT NULL,
                message_count INTEGER NOT NULL,
                unread_count INTEGER NOT NULL,
                has_starred INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_account
                ON conversations(account_id, date_newest_ts DESC);

            CREATE TABLE IF NOT EXISTS headers (
                id TEXT PRIMARY KEY,
                conv_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                date_ts INTEGER NOT NULL,
                author TEXT,
                subject TEXT,
                flags TEXT NOT NULL,
                labels TEXT NOT NULL,
                FOREIGN KEY (conv_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_headers_conv ON headers(conv_id, date_ts);

            CREATE TABLE IF NOT EXISTS bodies (
                message_id TEXT PRIMARY KEY,
                body_structure TEXT,
                snippet TEXT,
                FOREIGN KEY (message_id) REFERENCES headers(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                spec TEXT NOT NULL,
                state TEXT,
                planned TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;
        Ok(())
    }

    // -- entity locks ------------------------------------------------------

    /// Block until every key is free (or already ours), then take them all.
    /// The release happens at the owner's teardown, never mid-task.
    pub(crate) async fn lock_entities(&self, owner: TaskId, keys: &[LockKey]) {
        loop {
            let notified = self.lock_notify.notified();
            {
                let mut locks = self.locks.lock().unwrap();
                let free = keys
                    .iter()
                    .all(|k| locks.get(k).map(|held| *held == owner).unwrap_or(true));
                if free {
                    for key in keys {
                        locks.insert(key.clone(), owner);
                    }
                    return;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn release_locks(&self, owner: TaskId) {
        let mut locks = self.locks.lock().unwrap();
        let before = locks.len();
        locks.retain(|_, held| *held != owner);
        if locks.len() != before {
            self.lock_notify.notify_waiters();
        }
    }

    // -- reads -------------------------------------------------------------

    pub async fn read(&self, selectors: &Selectors) -> Result<Loaded> {
        let mut loaded = Loaded::default();

        for account_id in &selectors.sync_states {
            let state = self.load_sync_state(account_id).await?;
            loaded.sync_states.insert(account_id.clone(), state);
        }
        for conv_id in &selectors.conversations {
            let conv = self.load_conversation(conv_id).await?;
            loaded.conversations.insert(conv_id.clone(), conv);
        }
        for conv_id in &selectors.headers_by_conversation {
            let headers = self.load_headers_for_conversation(conv_id).await?;
            loaded
                .headers_by_conversation
                .insert(conv_id.clone(), headers);
        }
        Ok(loaded)
    }

    /// Exclusive load: take the entity locks, then read current state.
    pub async fn begin_mutate(&self, owner: TaskId, selectors: &Selectors) -> Result<Loaded> {
        self.lock_entities(owner, &selectors.lock_keys()).await;
        self.read(selectors).await
    }

    async fn load_sync_state(&self, account_id: &str) -> Result<Option<RawSyncState>> {
        let row = sqlx::query("SELECT state FROM sync_states WHERE account_id = ?1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading sync state")?;
        match row {
            Some(row) => {
                let raw: String = row.get(0);
                let state = serde_json::from_str(&raw).context("decoding sync state")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub async fn load_conversation(&self, conv_id: &ConvId) -> Result<Option<ConversationInfo>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, subject, participants, date_oldest_ts, date_newest_ts,
                   message_count, unread_count, has_starred
            FROM conversations WHERE id = ?1
            "#,
        )
        .bind(conv_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading conversation")?;

        Ok(row.map(|row| {
            let participants_json: String = row.get(3);
            ConversationInfo {
                conv_id: row.get(0),
                account_id: row.get(1),
                subject: row.get(2),
                participants: serde_json::from_str(&participants_json).unwrap_or_default(),
                date_oldest_ts: row.get(4),
                date_newest_ts: row.get(5),
                message_count: row.get::<i64, _>(6) as u32,
                unread_count: row.get::<i64, _>(7) as u32,
                has_starred: row.get::<i64, _>(8) == 1,
            }
        }))
    }

    pub async fn load_headers_for_conversation(&self, conv_id: &ConvId) -> Result<Vec<HeaderInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conv_id, uid, date_ts, author, subject, flags, labels
            FROM headers WHERE conv_id = ?1
            ORDER BY date_ts ASC, uid ASC, id ASC
            "#,
        )
        .bind(conv_id)
        .fetch_all(&self.pool)
        .await
        .context("loading headers for conversation")?;

        Ok(rows.into_iter().map(header_from_row).collect())
    }

    pub async fn load_body(&self, message_id: &MessageId) -> Result<Option<BodyInfo>> {
        let row = sqlx::query("SELECT message_id, body_structure, snippet FROM bodies WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading body")?;
        Ok(row.map(|row| BodyInfo {
            message_id: row.get(0),
            body_structure_json: row.get(1),
            snippet: row.get(2),
        }))
    }

    /// Reachable header/body row counts for a conversation; used to verify
    /// delete-conversation leaves nothing orphaned.
    pub async fn conversation_row_counts(&self, conv_id: &ConvId) -> Result<(i64, i64)> {
        let headers = sqlx::query("SELECT COUNT(*) FROM headers WHERE conv_id = ?1")
            .bind(conv_id)
            .fetch_one(&self.pool)
            .await
            .context("counting headers")?
            .get::<i64, _>(0);
        let bodies = sqlx::query(
            r#"
            SELECT COUNT(*) FROM bodies
            WHERE message_id IN (SELECT id FROM headers WHERE conv_id = ?1)
            "#,
        )
        .bind(conv_id)
        .fetch_one(&self.pool)
        .await
        .context("counting bodies")?
        .get::<i64, _>(0);
        Ok((headers, bodies))
    }

    // -- atomic commit -----------------------------------------------------

    /// Commit one task's entire outcome: entity mutations, new records, and
    /// task-table bookkeeping, in a single transaction. An observer sees
    /// all of it or none of it. `new_data.tasks` is not written here — the
    /// manager wraps those specs into `bookkeeping.wrapped_tasks` rows.
    pub async fn finish_mutate(
        &self,
        mutations: &Mutations,
        new_data: &NewData,
        bookkeeping: &TaskBookkeeping,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning finish_mutate")?;
        let now = now_ts();

        for (account_id, state) in &mutations.sync_states {
            match state {
                Some(state) => upsert_sync_state(&mut tx, account_id, state, now).await?,
                None => {
                    sqlx::query("DELETE FROM sync_states WHERE account_id = ?1")
                        .bind(account_id)
                        .execute(&mut *tx)
                        .await
                        .context("deleting sync state")?;
                }
            }
        }

        for (conv_id, conv) in &mutations.conversations {
            match conv {
                Some(conv) => upsert_conversation(&mut tx, conv, now).await?,
                None => {
                    // Headers and bodies go with it via FK cascade.
                    sqlx::query("DELETE FROM conversations WHERE id = ?1")
                        .bind(conv_id)
                        .execute(&mut *tx)
                        .await
                        .context("deleting conversation")?;
                }
            }
        }
        for conv in &new_data.conversations {
            insert_conversation(&mut tx, conv, now).await?;
        }

        for (message_id, header) in &mutations.headers {
            match header {
                Some(header) => upsert_header(&mut tx, header).await?,
                None => {
                    sqlx::query("DELETE FROM headers WHERE id = ?1")
                        .bind(message_id)
                        .execute(&mut *tx)
                        .await
                        .context("deleting header")?;
                }
            }
        }
        for header in &new_data.headers {
            insert_header(&mut tx, header).await?;
        }
        for body in &new_data.bodies {
            insert_body(&mut tx, body).await?;
        }

        for task in &bookkeeping.wrapped_tasks {
            insert_task_row(&mut tx, task, now).await?;
        }
        if let Some((task_id, revised)) = &bookkeeping.revised_task {
            match revised {
                Some(task) => upsert_task_row(&mut tx, task, now).await?,
                None => {
                    sqlx::query("DELETE FROM tasks WHERE id = ?1")
                        .bind(task_id)
                        .execute(&mut *tx)
                        .await
                        .context("deleting finished task")?;
                }
            }
        }

        tx.commit().await.context("committing finish_mutate")?;
        debug!(
            mutated_convs = mutations.conversations.len(),
            mutated_headers = mutations.headers.len(),
            new_headers = new_data.headers.len(),
            byproducts = bookkeeping.wrapped_tasks.len(),
            "finish_mutate committed"
        );
        Ok(())
    }

    // -- task table --------------------------------------------------------

    /// Durable initial enqueue, outside any task commit.
    pub async fn insert_task(&self, task: &WrappedTask) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning task insert")?;
        insert_task_row(&mut tx, task, now_ts()).await?;
        tx.commit().await.context("committing task insert")
    }

    /// Load every persisted task, in id order; used to rebuild the arena
    /// after a restart.
    pub async fn load_tasks(&self) -> Result<Vec<WrappedTask>> {
        let rows = sqlx::query("SELECT id, spec, state, planned FROM tasks ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .context("loading tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            let id: TaskId = row.get(0);
            let spec_raw: String = row.get(1);
            let spec: TaskSpec = serde_json::from_str(&spec_raw)
                .map_err(|err| TaskError::PayloadDecode(format!("task {id} spec: {err}")))?;
            let state = match row.get::<Option<String>, _>(2).as_deref() {
                Some("planned") => TaskState::Planned,
                _ => TaskState::NeedsPlanning,
            };
            let planned = match row.get::<Option<String>, _>(3) {
                Some(raw) => Some(serde_json::from_str(&raw).map_err(|err| {
                    TaskError::PayloadDecode(format!("task {id} planned payload: {err}"))
                })?),
                None => None,
            };
            tasks.push(WrappedTask {
                id,
                spec,
                state,
                planned,
            });
        }
        Ok(tasks)
    }

    pub async fn max_task_id(&self) -> Result<TaskId> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .context("loading max task id")?;
        Ok(row.get(0))
    }
}

fn header_from_row(row: sqlx::sqlite::SqliteRow) -> HeaderInfo {
    let flags_json: String = row.get(6);
    let labels_json: String = row.get(7);
    HeaderInfo {
        id: row.get(0),
        conv_id: row.get(1),
        uid: row.get::<i64, _>(2) as u64,
        date_ts: row.get(3),
        author: row.get(4),
        subject: row.get(5),
        flags: serde_json::from_str(&flags_json).unwrap_or_default(),
        label_folder_ids: serde_json::from_str(&labels_json).unwrap_or_default(),
    }
}

async fn upsert_sync_state(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    state: &RawSyncState,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_states (account_id, state, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(account_id) DO UPDATE SET
            state = excluded.state,
            updated_at = excluded.updated_at;
        "#,
    )
    .bind(account_id)
    .bind(serde_json::to_string(state).context("encoding sync state")?)
    .bind(now)
    .execute(&mut **tx)
    .await
    .context("upserting sync state")?;
    Ok(())
}

async fn upsert_conversation(
    tx: &mut Transaction<'_, Sqlite>,
    conv: &ConversationInfo,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conversations
            (id, account_id, subject, participants, date_oldest_ts, date_newest_ts,
             message_count, unread_count, has_starred, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            subject = excluded.subject,
            participants = excluded.participants,
            date_oldest_ts = excluded.date_oldest_ts,
            date_newest_ts = excluded.date_newest_ts,
            message_count = excluded.message_count,
            unread_count = excluded.unread_count,
            has_starred = excluded.has_starred,
            updated_at = excluded.updated_at;
        "#,
    )
    .bind(&conv.conv_id)
    .bind(&conv.account_id)
    .bind(&conv.subject)
    .bind(serde_json::to_string(&conv.participants).unwrap_or_else(|_| "[]".into()))
    .bind(conv.date_oldest_ts)
    .bind(conv.date_newest_ts)
    .bind(conv.message_count as i64)
    .bind(conv.unread_count as i64)
    .bind(if conv.has_starred { 1 } else { 0 })
    .bind(now)
    .execute(&mut **tx)
    .await
    .context("upserting conversation")?;
    Ok(())
}

async fn insert_conversation(
    tx: &mut Transaction<'_, Sqlite>,
    conv: &ConversationInfo,
    now: i64,
) -> Result<()> {
    // New records are new by contract; a collision is a task bug and must
    // abort the whole commit.
    sqlx::query(
        r#"
        INSERT INTO conversations
            (id, account_id, subject, participants, date_oldest_ts, date_newest_ts,
             message_count, unread_count, has_starred, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);
        "#,
    )
    .bind(&conv.conv_id)
    .bind(&conv.account_id)
    .bind(&conv.subject)
    .bind(serde_json::to_string(&conv.participants).unwrap_or_else(|_| "[]".into()))
    .bind(conv.date_oldest_ts)
    .bind(conv.date_newest_ts)
    .bind(conv.message_count as i64)
    .bind(conv.unread_count as i64)
    .bind(if conv.has_starred { 1 } else { 0 })
    .bind(now)
    .execute(&mut **tx)
    .await
    .context("inserting conversation")?;
    Ok(())
}

async fn upsert_header(tx: &mut Transaction<'_, Sqlite>, header: &HeaderInfo) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO headers (id, conv_id, uid, date_ts, author, subject, flags, labels)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            flags = excluded.flags,
            labels = excluded.labels;
        "#,
    )
    .bind(&header.id)
    .bind(&header.conv_id)
    .bind(header.uid as i64)
    .bind(header.date_ts)
    .bind(&header.author)
    .bind(&header.subject)
    .bind(serde_json::to_string(&header.flags).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&header.label_folder_ids).unwrap_or_else(|_| "[]".into()))
    .execute(&mut **tx)
    .await
    .context("upserting header")?;
    Ok(())
}

async fn insert_header(tx: &mut Transaction<'_, Sqlite>, header: &HeaderInfo) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO headers (id, conv_id, uid, date_ts, author, subject, flags, labels)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);
        "#,
    )
    .bind(&header.id)
    .bind(&header.conv_id)
    .bind(header.uid as i64)
    .bind(header.date_ts)
    .bind(&header.author)
    .bind(&header.subject)
    .bind(serde_json::to_string(&header.flags).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&header.label_folder_ids).unwrap_or_else(|_| "[]".into()))
    .execute(&mut **tx)
    .await
    .context("inserting header")?;
    Ok(())
}

async fn insert_body(tx: &mut Transaction<'_, Sqlite>, body: &BodyInfo) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bodies (message_id, body_structure, snippet)
        VALUES (?1, ?2, ?3);
        "#,
    )
    .bind(&body.message_id)
    .bind(&body.body_structure_json)
    .bind(&body.snippet)
    .execute(&mut **tx)
    .await
    .context("inserting body")?;
    Ok(())
}

async fn insert_task_row(
    tx: &mut Transaction<'_, Sqlite>,
    task: &WrappedTask,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, spec, state, planned, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5);
        "#,
    )
    .bind(task.id)
    .bind(serde_json::to_string(&task.spec).context("encoding task spec")?)
    .bind(task_state_str(task.state))
    .bind(encode_planned(task)?)
    .bind(now)
    .execute(&mut **tx)
    .await
    .context("inserting task row")?;
    Ok(())
}

async fn upsert_task_row(
    tx: &mut Transaction<'_, Sqlite>,
    task: &WrappedTask,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, spec, state, planned, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            spec = excluded.spec,
            state = excluded.state,
            planned = excluded.planned;
        "#,
    )
    .bind(task.id)
    .bind(serde_json::to_string(&task.spec).context("encoding task spec")?)
    .bind(task_state_str(task.state))
    .bind(encode_planned(task)?)
    .bind(now)
    .execute(&mut **tx)
    .await
    .context("upserting task row")?;
    Ok(())
}

fn task_state_str(state: TaskState) -> Option<&'static str> {
    match state {
        TaskState::NeedsPlanning => None,
        TaskState::Planned => Some("planned"),
    }
}

fn encode_planned(task: &WrappedTask) -> Result<Option<String>> {
    task.planned
        .as_ref()
        .map(|p| serde_json::to_string(p).context("encoding planned payload"))
        .transpose()
}
