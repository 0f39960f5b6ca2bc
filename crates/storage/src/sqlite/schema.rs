use snafu::ResultExt;
use sqlx::SqlitePool;

use crate::error::{SqliteBootstrapSnafu, SqliteQuerySnafu, StorageResult};

pub(crate) const SCHEMA_VERSION_KEY: &str = "schema_version";
const BASE_SCHEMA_VERSION: i64 = 1;

/// Columns that are absent from the base table and added on first real use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalColumn {
    ThinkingContent,
    TokenUsage,
    ToolCalls,
    InvalidToolCalls,
    Metadata,
}

impl OptionalColumn {
    pub const ALL: [OptionalColumn; 5] = [
        Self::ThinkingContent,
        Self::TokenUsage,
        Self::ToolCalls,
        Self::InvalidToolCalls,
        Self::Metadata,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ThinkingContent => "thinking_content",
            Self::TokenUsage => "token_usage",
            Self::ToolCalls => "tool_calls",
            Self::InvalidToolCalls => "invalid_tool_calls",
            Self::Metadata => "metadata",
        }
    }
}

// Minimal base schema; everything else widens additively at runtime.
const BOOTSTRAP_STATEMENTS: &[(&str, &str)] = &[
    (
        "bootstrap-create-messages",
        "CREATE TABLE IF NOT EXISTS messages (
            id              TEXT    PRIMARY KEY NOT NULL,
            conversation_id TEXT    NOT NULL,
            role            TEXT    NOT NULL,
            content         TEXT    NOT NULL DEFAULT '',
            timestamp       INTEGER NOT NULL,
            content_type    TEXT    NOT NULL DEFAULT 'plain',
            status          TEXT    NOT NULL DEFAULT 'sent',
            error           TEXT,
            message_type    TEXT    NOT NULL DEFAULT 'chat'
        )",
    ),
    (
        "bootstrap-index-conversation-timestamp",
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_timestamp
            ON messages (conversation_id, timestamp)",
    ),
    (
        "bootstrap-create-app-meta",
        "CREATE TABLE IF NOT EXISTS app_meta (
            key   TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        )",
    ),
];

pub(crate) async fn bootstrap_schema(pool: &SqlitePool) -> StorageResult<()> {
    for (stage, statement) in BOOTSTRAP_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context(SqliteBootstrapSnafu { stage: *stage })?;
    }

    sqlx::query("INSERT INTO app_meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
        .bind(SCHEMA_VERSION_KEY)
        .bind(BASE_SCHEMA_VERSION.to_string())
        .execute(pool)
        .await
        .context(SqliteBootstrapSnafu {
            stage: "bootstrap-seed-schema-version",
        })?;

    Ok(())
}

pub(crate) async fn column_exists(pool: &SqlitePool, column: OptionalColumn) -> StorageResult<bool> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM pragma_table_info('messages') WHERE name = ? LIMIT 1",
    )
    .bind(column.name())
    .fetch_optional(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "schema-probe-column",
    })?;

    Ok(found.is_some())
}

pub(crate) async fn bump_schema_version(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::query(
        "UPDATE app_meta SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE key = ?",
    )
    .bind(SCHEMA_VERSION_KEY)
    .execute(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "schema-bump-version",
    })?;

    Ok(())
}

pub(crate) fn is_duplicate_column(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(database) if database.message().contains("duplicate column name"))
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(database) if database.is_unique_violation())
}
