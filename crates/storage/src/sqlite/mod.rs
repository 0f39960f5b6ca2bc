use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::{OnceCell, RwLock};

mod schema;

pub use schema::OptionalColumn;

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, SerializeFieldSnafu, SqliteAddColumnSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ContentType, DEFAULT_MESSAGE_TYPE, InsertOutcome, MessageExtras, MessageRecord, MessageRole,
    MessageStatus, MessageUpdate,
};
use super::{BoxFuture, MessageStore};

const BASE_COLUMNS: &str =
    "id, conversation_id, role, content, timestamp, content_type, status, error, message_type";

/// SQLite-backed message store.
///
/// The pool is opened lazily behind a [`OnceCell`]: concurrent first callers await
/// the same initialization instead of racing to open twice. One pooled connection
/// serializes every statement.
#[derive(Debug)]
pub struct SqliteMessageStore {
    database_location: String,
    pool: OnceCell<SqlitePool>,
    known_columns: RwLock<HashSet<OptionalColumn>>,
}

impl SqliteMessageStore {
    /// Creates a store that connects on first use.
    pub fn new(database_location: impl Into<String>) -> Self {
        Self {
            database_location: database_location.into(),
            pool: OnceCell::new(),
            known_columns: RwLock::new(HashSet::new()),
        }
    }

    /// Creates a store and connects eagerly, surfacing open failures immediately.
    pub async fn open(database_location: impl Into<String>) -> StorageResult<Self> {
        let store = Self::new(database_location);
        store.pool().await?;
        Ok(store)
    }

    pub fn database_location(&self) -> &str {
        &self.database_location
    }

    pub async fn pool(&self) -> StorageResult<&SqlitePool> {
        self.pool
            .get_or_try_init(|| open_pool(&self.database_location))
            .await
    }

    pub async fn schema_version(&self) -> StorageResult<i64> {
        let pool = self.pool().await?;
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM app_meta WHERE key = ?")
            .bind(schema::SCHEMA_VERSION_KEY)
            .fetch_one(pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "schema-version-load",
            })?;

        raw.trim().parse::<i64>().map_err(|_| {
            InvariantViolationSnafu {
                stage: "schema-version-parse",
                details: format!("schema version marker '{raw}' is not an integer"),
            }
            .build()
        })
    }

    /// Adds `column` if it is missing. A concurrent "duplicate column" failure
    /// means another caller won the race and counts as success.
    pub async fn ensure_column(&self, column: OptionalColumn) -> StorageResult<()> {
        if self.known_columns.read().await.contains(&column) {
            return Ok(());
        }

        let pool = self.pool().await?;
        if !schema::column_exists(pool, column).await? {
            let statement = format!(
                "ALTER TABLE messages ADD COLUMN {} TEXT DEFAULT NULL",
                column.name()
            );
            match sqlx::query(&statement).execute(pool).await {
                Ok(_) => {
                    schema::bump_schema_version(pool).await?;
                    tracing::info!(column = column.name(), "added optional message column");
                }
                Err(source) if schema::is_duplicate_column(&source) => {
                    tracing::debug!(
                        column = column.name(),
                        "optional column appeared concurrently; treating as present"
                    );
                }
                Err(source) => {
                    return Err(source).context(SqliteAddColumnSnafu {
                        stage: "schema-add-column",
                        column: column.name(),
                    });
                }
            }
        }

        self.known_columns.write().await.insert(column);
        Ok(())
    }

    async fn ensure_columns(&self, values: &[(OptionalColumn, String)]) -> StorageResult<()> {
        for (column, _) in values {
            self.ensure_column(*column).await?;
        }
        Ok(())
    }

    async fn insert_record(&self, message: MessageRecord) -> StorageResult<InsertOutcome> {
        let optional_values = serialize_extras(&MessageUpdate::from_record(&message).extras)?;
        self.ensure_columns(&optional_values).await?;

        let pool = self.pool().await?;
        if message_exists(pool, &message.id).await? {
            tracing::debug!(message_id = %message.id, "message already stored; skipping insert");
            return Ok(InsertOutcome::Skipped);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("INSERT INTO messages (");
        builder.push(BASE_COLUMNS);
        for (column, _) in &optional_values {
            builder.push(", ").push(column.name());
        }
        builder.push(") VALUES (");

        let mut values = builder.separated(", ");
        values
            .push_bind(message.id.into_inner())
            .push_bind(message.conversation_id.into_inner())
            .push_bind(message.role.as_str())
            .push_bind(message.content)
            .push_bind(message.timestamp)
            .push_bind(message.content_type.as_str())
            .push_bind(message.status.as_str())
            .push_bind(message.error)
            .push_bind(message.message_type);
        for (_, value) in optional_values {
            values.push_bind(value);
        }
        values.push_unseparated(")");

        match builder.build().execute(pool).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            // Lost a race against another insert of the same id.
            Err(source) if schema::is_unique_violation(&source) => Ok(InsertOutcome::Skipped),
            Err(source) => Err(source).context(SqliteQuerySnafu {
                stage: "message-insert",
            }),
        }
    }

    async fn update_record(
        &self,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> StorageResult<bool> {
        let optional_values = serialize_extras(&update.extras)?;
        self.ensure_columns(&optional_values).await?;

        let pool = self.pool().await?;
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE messages SET content = ");
        builder.push_bind(update.content);
        builder
            .push(", content_type = ")
            .push_bind(update.content_type.as_str());
        builder.push(", status = ").push_bind(update.status.as_str());
        if let Some(error) = update.extras.error {
            builder.push(", error = ").push_bind(error);
        }
        for (column, value) in optional_values {
            builder.push(", ").push(column.name()).push(" = ").push_bind(value);
        }
        // Terminal rows are immutable; a late debounced write must not regress them.
        builder
            .push(" WHERE id = ")
            .push_bind(message_id.into_inner())
            .push(" AND status NOT IN ('sent', 'error')");

        let result = builder
            .build()
            .execute(pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update",
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_rows(
        &self,
        stage: &'static str,
        sql: &str,
        conversation_id: ConversationId,
        bounds: &[i64],
    ) -> StorageResult<Vec<MessageRecord>> {
        let pool = self.pool().await?;
        let mut query = sqlx::query(sql).bind(conversation_id.into_inner());
        for bound in bounds {
            query = query.bind(*bound);
        }

        let rows = query
            .fetch_all(pool)
            .await
            .context(SqliteQuerySnafu { stage })?;

        Ok(rows.iter().filter_map(decode_message_row).collect())
    }
}

impl MessageStore for SqliteMessageStore {
    fn insert_message(&self, message: MessageRecord) -> BoxFuture<'_, StorageResult<InsertOutcome>> {
        Box::pin(self.insert_record(message))
    }

    fn update_message(
        &self,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(self.update_record(message_id, update))
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
                .bind(message_id.into_inner())
                .fetch_optional(pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-get",
                })?;

            Ok(row.as_ref().and_then(decode_message_row))
        })
    }

    fn list_page(
        &self,
        conversation_id: ConversationId,
        offset: u64,
        limit: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let bounds = [
                u64_to_i64(limit, "message-list-page-limit")?,
                u64_to_i64(offset, "message-list-page-offset")?,
            ];
            self.fetch_rows(
                "message-list-page",
                "SELECT * FROM messages WHERE conversation_id = ? ORDER BY timestamp ASC, id ASC LIMIT ? OFFSET ?",
                conversation_id,
                &bounds,
            )
            .await
        })
    }

    fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let bounds = [u64_to_i64(limit, "message-list-recent-limit")?];
            self.fetch_rows(
                "message-list-recent",
                "SELECT * FROM (SELECT * FROM messages WHERE conversation_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?) ORDER BY timestamp ASC, id ASC",
                conversation_id,
                &bounds,
            )
            .await
        })
    }

    fn count_messages(&self, conversation_id: ConversationId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let count =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                    .bind(conversation_id.into_inner())
                    .fetch_one(pool)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-count",
                    })?;

            i64_to_u64(count, "message-count-value")
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let result = sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(message_id.into_inner())
                .execute(pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete",
                })?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let result = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.into_inner())
                .execute(pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete",
                })?;

            Ok(result.rows_affected())
        })
    }
}

async fn open_pool(database_location: &str) -> StorageResult<SqlitePool> {
    ensure_database_directory(database_location)?;

    let database_url = normalize_database_url(database_location);
    let connect_options = SqliteConnectOptions::from_str(&database_url)
        .context(SqliteConnectOptionsSnafu {
            stage: "sqlite-open-parse-url",
            database_url: database_url.clone(),
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5_000));

    // A single long-lived connection: statements serialize, and `:memory:`
    // databases survive because the connection is never recycled.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(connect_options)
        .await
        .context(SqliteConnectSnafu {
            stage: "sqlite-open-connect",
            database_url: database_url.clone(),
        })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&pool)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-open-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    schema::bootstrap_schema(&pool).await?;

    tracing::info!(database_url = %database_url, "opened sqlite message store");
    Ok(pool)
}

async fn message_exists(pool: &SqlitePool, message_id: &MessageId) -> StorageResult<bool> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM messages WHERE id = ? LIMIT 1")
        .bind(message_id.as_str())
        .fetch_optional(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-exists-query",
        })?;

    Ok(existing.is_some())
}

fn serialize_extras(extras: &MessageExtras) -> StorageResult<Vec<(OptionalColumn, String)>> {
    let mut values = Vec::new();

    if let Some(thinking) = &extras.thinking_content {
        values.push((OptionalColumn::ThinkingContent, thinking.clone()));
    }
    if let Some(usage) = &extras.token_usage {
        values.push((
            OptionalColumn::TokenUsage,
            serde_json::to_string(usage).context(SerializeFieldSnafu {
                stage: "serialize-token-usage",
                field: "token_usage",
            })?,
        ));
    }
    if let Some(calls) = &extras.tool_calls {
        values.push((
            OptionalColumn::ToolCalls,
            serde_json::to_string(calls).context(SerializeFieldSnafu {
                stage: "serialize-tool-calls",
                field: "tool_calls",
            })?,
        ));
    }
    if let Some(calls) = &extras.invalid_tool_calls {
        values.push((
            OptionalColumn::InvalidToolCalls,
            serde_json::to_string(calls).context(SerializeFieldSnafu {
                stage: "serialize-invalid-tool-calls",
                field: "invalid_tool_calls",
            })?,
        ));
    }
    if let Some(metadata) = &extras.metadata {
        values.push((
            OptionalColumn::Metadata,
            serde_json::to_string(metadata).context(SerializeFieldSnafu {
                stage: "serialize-metadata",
                field: "metadata",
            })?,
        ));
    }

    Ok(values)
}

/// Rebuilds a message from a `SELECT *` row. Rows missing an id, content or
/// timestamp, or carrying an unknown role, are dropped; optional columns that
/// fail to parse are omitted individually.
fn decode_message_row(row: &SqliteRow) -> Option<MessageRecord> {
    let Some(id) = text_column(row, "id").filter(|id| !id.is_empty()) else {
        tracing::warn!("dropping stored message without id");
        return None;
    };
    let Some(content) = text_column(row, "content") else {
        tracing::warn!(message_id = %id, "dropping stored message without content");
        return None;
    };
    let Some(timestamp) = row.try_get::<Option<i64>, _>("timestamp").ok().flatten() else {
        tracing::warn!(message_id = %id, "dropping stored message without timestamp");
        return None;
    };
    let raw_role = text_column(row, "role").unwrap_or_default();
    let Some(role) = MessageRole::parse(&raw_role) else {
        tracing::warn!(message_id = %id, role = %raw_role, "dropping stored message with unknown role");
        return None;
    };

    let status = text_column(row, "status")
        .and_then(|raw| MessageStatus::parse(&raw))
        .unwrap_or_else(|| {
            tracing::warn!(message_id = %id, "stored message has unknown status; reading as sent");
            MessageStatus::Sent
        });

    Some(MessageRecord {
        conversation_id: ConversationId::new(text_column(row, "conversation_id").unwrap_or_default()),
        role,
        content,
        content_type: text_column(row, "content_type")
            .and_then(|raw| ContentType::parse(&raw))
            .unwrap_or_default(),
        thinking_content: text_column(row, OptionalColumn::ThinkingContent.name()),
        status,
        token_usage: json_column(row, OptionalColumn::TokenUsage, &id),
        tool_calls: json_column(row, OptionalColumn::ToolCalls, &id),
        invalid_tool_calls: json_column(row, OptionalColumn::InvalidToolCalls, &id),
        error: text_column(row, "error"),
        metadata: json_column(row, OptionalColumn::Metadata, &id),
        message_type: text_column(row, "message_type")
            .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
        timestamp,
        id: MessageId::new(id),
    })
}

// Missing columns (not yet widened) read as absent.
fn text_column(row: &SqliteRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column).ok().flatten()
}

fn json_column<T: DeserializeOwned>(
    row: &SqliteRow,
    column: OptionalColumn,
    message_id: &str,
) -> Option<T> {
    let raw = text_column(row, column.name())?;
    if raw.trim().is_empty() {
        return None;
    }

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(
                message_id = %message_id,
                column = column.name(),
                error = %error,
                "dropping unparseable stored field"
            );
            None
        }
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
