use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, monotonic_timestamp_millis};
pub use sqlite::{OptionalColumn, SqliteMessageStore};
pub use types::{
    ContentType, DEFAULT_MESSAGE_TYPE, InsertOutcome, MessageExtras, MessageRecord, MessageRole,
    MessageStatus, MessageUpdate, TokenUsage, ToolCallRecord,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable message storage. Implementations serialize statement execution
/// themselves, so callers may issue overlapping full-row writes for one id.
pub trait MessageStore: Send + Sync {
    /// Idempotent insert: an existing id yields [`InsertOutcome::Skipped`].
    fn insert_message(&self, message: MessageRecord) -> BoxFuture<'_, StorageResult<InsertOutcome>>;

    /// Writes content, status and content type plus whichever extras are `Some`.
    /// Returns `false` when no row matched `message_id`.
    fn update_message(
        &self,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> BoxFuture<'_, StorageResult<bool>>;

    fn get_message(&self, message_id: MessageId)
    -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;

    /// Ascending by timestamp, skipping the oldest `offset` rows.
    fn list_page(
        &self,
        conversation_id: ConversationId,
        offset: u64,
        limit: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;

    /// Newest `limit` rows of a conversation, returned in ascending order.
    fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;

    fn count_messages(&self, conversation_id: ConversationId) -> BoxFuture<'_, StorageResult<u64>>;

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<bool>>;

    /// Returns the number of deleted rows.
    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>>;
}
