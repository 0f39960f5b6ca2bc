use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, monotonic_timestamp_millis};

pub const DEFAULT_MESSAGE_TYPE: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Plain,
    Markdown,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Markdown => "markdown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "plain" | "text" => Some(Self::Plain),
            "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }
}

/// Message lifecycle. `Sending` and `Streaming` are transient, `Sent` and
/// `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Streaming,
    Sent,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sending" => Some(Self::Sending),
            "streaming" => Some(Self::Streaming),
            "sent" => Some(Self::Sent),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Error)
    }

    /// Terminal states never regress; transient states may move anywhere forward.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (current, next) if *current == next => true,
            (Self::Sent | Self::Error, _) => false,
            (Self::Streaming, Self::Sending) => false,
            _ => true,
        }
    }
}

/// Backend-reported token counters for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn new(total: u64, prompt: u64, completion: u64) -> Self {
        Self {
            total,
            prompt,
            completion,
        }
    }

    /// Per-counter maximum. Vendors repeat or only finalize counters, so the
    /// max seen so far is the only aggregate that never goes backwards.
    pub fn max_merge(self, other: TokenUsage) -> Self {
        Self {
            total: self.total.max(other.total),
            prompt: self.prompt.max(other.prompt),
            completion: self.completion.max(other.completion),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.prompt == 0 && self.completion == 0
    }
}

/// One tool invocation requested by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRecord {
    pub fn is_invalid(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub content_type: ContentType,
    pub thinking_content: Option<String>,
    pub status: MessageStatus,
    pub token_usage: Option<TokenUsage>,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub invalid_tool_calls: Option<Vec<ToolCallRecord>>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub message_type: String,
    pub timestamp: i64,
}

impl MessageRecord {
    pub fn new(
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: MessageId::new_v7(),
            conversation_id,
            role,
            content: content.into(),
            content_type: ContentType::Plain,
            thinking_content: None,
            status,
            token_usage: None,
            tool_calls: None,
            invalid_tool_calls: None,
            error: None,
            metadata: None,
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            timestamp: monotonic_timestamp_millis(),
        }
    }

    /// Optimistic user turn, persisted before the backend is contacted.
    pub fn user_sending(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(
            conversation_id,
            MessageRole::User,
            content,
            MessageStatus::Sending,
        )
    }

    /// Empty assistant placeholder shown the instant a turn starts.
    pub fn assistant_placeholder(conversation_id: ConversationId) -> Self {
        let mut message = Self::new(
            conversation_id,
            MessageRole::Assistant,
            String::new(),
            MessageStatus::Streaming,
        );
        message.content_type = ContentType::Markdown;
        message
    }

    /// Applies `next` only if the lifecycle allows it. Returns whether the status changed.
    pub fn advance_status(&mut self, next: MessageStatus) -> bool {
        if self.status == next || !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn thinking(&self) -> &str {
        self.thinking_content.as_deref().unwrap_or_default()
    }
}

/// Optional fields of a combined content+metadata update. `None` leaves the
/// stored column untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageExtras {
    pub thinking_content: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub invalid_tool_calls: Option<Vec<ToolCallRecord>>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl MessageExtras {
    pub fn is_empty(&self) -> bool {
        self.thinking_content.is_none()
            && self.token_usage.is_none()
            && self.tool_calls.is_none()
            && self.invalid_tool_calls.is_none()
            && self.metadata.is_none()
            && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub content: String,
    pub status: MessageStatus,
    pub content_type: ContentType,
    pub extras: MessageExtras,
}

impl MessageUpdate {
    pub fn new(content: impl Into<String>, status: MessageStatus, content_type: ContentType) -> Self {
        Self {
            content: content.into(),
            status,
            content_type,
            extras: MessageExtras::default(),
        }
    }

    pub fn with_extras(mut self, extras: MessageExtras) -> Self {
        self.extras = extras;
        self
    }

    /// Full-row snapshot of a message, used for debounced and final writes.
    pub fn from_record(message: &MessageRecord) -> Self {
        Self {
            content: message.content.clone(),
            status: message.status,
            content_type: message.content_type,
            extras: MessageExtras {
                thinking_content: message.thinking_content.clone(),
                token_usage: message.token_usage,
                tool_calls: message.tool_calls.clone(),
                invalid_tool_calls: message.invalid_tool_calls.clone(),
                metadata: message.metadata.clone(),
                error: message.error.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already existed; nothing was written.
    Skipped,
}

impl InsertOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_never_regresses() {
        let mut message = MessageRecord::assistant_placeholder(ConversationId::new("c1"));
        assert!(message.advance_status(MessageStatus::Sent));
        assert!(!message.advance_status(MessageStatus::Streaming));
        assert!(!message.advance_status(MessageStatus::Error));
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn streaming_cannot_fall_back_to_sending() {
        assert!(!MessageStatus::Streaming.can_advance_to(MessageStatus::Sending));
        assert!(MessageStatus::Sending.can_advance_to(MessageStatus::Streaming));
        assert!(MessageStatus::Sending.can_advance_to(MessageStatus::Error));
    }

    #[test]
    fn max_merge_is_per_counter() {
        let merged = TokenUsage::new(10, 0, 7).max_merge(TokenUsage::new(4, 6, 3));
        assert_eq!(merged, TokenUsage::new(10, 6, 7));
    }

    #[test]
    fn placeholder_sorts_after_user_turn() {
        let conversation_id = ConversationId::new("c1");
        let user = MessageRecord::user_sending(conversation_id.clone(), "hi");
        let assistant = MessageRecord::assistant_placeholder(conversation_id);
        assert!(user.timestamp < assistant.timestamp);
        assert_eq!(assistant.content_type, ContentType::Markdown);
    }
}
