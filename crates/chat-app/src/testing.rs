//! Test doubles shared by the orchestrator, conversation and session tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur_llm::{
    AdapterError, AdapterResult, AdapterStreamHandle, AdapterWorker, BackendConfig, BoxFuture,
    HistoryMessage, ModelAdapter, ModelCheck, StopSignal, make_chunk_stream, validate_tool_call,
};
use murmur_storage::{
    ConversationId, InsertOutcome, MessageId, MessageRecord, MessageStore, MessageUpdate,
    StorageError, StorageResult, ToolCallRecord,
};
use serde_json::Value;

/// One step replayed by [`ScriptedAdapter`].
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Chunk(Value),
    Delay(Duration),
    Fail(&'static str),
    ToolCall(&'static str, Value),
    /// Requests a manual stop on the shared signal, as a user would.
    Stop,
}

pub(crate) fn text(value: &str) -> Step {
    Step::Chunk(Value::String(value.to_string()))
}

pub(crate) struct ScriptedAdapter {
    steps: Vec<Step>,
    tool_calls: Arc<Mutex<Vec<ToolCallRecord>>>,
    pub(crate) histories: Arc<Mutex<Vec<Vec<HistoryMessage>>>>,
    pub(crate) fail_initialize: bool,
}

impl ScriptedAdapter {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            tool_calls: Arc::new(Mutex::new(Vec::new())),
            histories: Arc::new(Mutex::new(Vec::new())),
            fail_initialize: false,
        }
    }

    fn record_history(&self, history: &[HistoryMessage]) {
        if let Ok(mut histories) = self.histories.lock() {
            histories.push(history.to_vec());
        }
    }
}

impl ModelAdapter for ScriptedAdapter {
    fn backend_id(&self) -> &str {
        "scripted"
    }

    fn initialize(&mut self, config: BackendConfig) -> AdapterResult<()> {
        if self.fail_initialize {
            return Err(AdapterError::MissingApiKey {
                stage: "scripted-initialize",
                backend_id: config.backend_id,
            });
        }
        Ok(())
    }

    fn chat<'a>(&'a self, history: Vec<HistoryMessage>) -> BoxFuture<'a, AdapterResult<String>> {
        self.record_history(&history);
        Box::pin(async move {
            let mut reply = String::new();
            for step in &self.steps {
                match step {
                    Step::Chunk(Value::String(text)) => reply.push_str(text),
                    Step::Fail(message) => {
                        return Err(AdapterError::Transport {
                            stage: "scripted-chat",
                            message: message.to_string(),
                        });
                    }
                    _ => {}
                }
            }
            Ok(reply)
        })
    }

    fn stream(
        &self,
        history: Vec<HistoryMessage>,
        stop: StopSignal,
    ) -> AdapterResult<AdapterStreamHandle> {
        self.record_history(&history);
        let (chunk_tx, chunks) = make_chunk_stream();
        let steps = self.steps.clone();
        let tool_calls = self.tool_calls.clone();

        let worker: AdapterWorker = Box::pin(async move {
            for step in steps {
                match step {
                    Step::Chunk(chunk) => {
                        if chunk_tx.send(Ok(chunk)).is_err() {
                            return;
                        }
                    }
                    Step::Delay(duration) => tokio::time::sleep(duration).await,
                    Step::Fail(message) => {
                        let _ = chunk_tx.send(Err(AdapterError::Transport {
                            stage: "scripted-stream",
                            message: message.to_string(),
                        }));
                        return;
                    }
                    Step::ToolCall(name, arguments) => {
                        if let Ok(mut calls) = tool_calls.lock() {
                            let id = format!("call-{}", calls.len());
                            calls.push(validate_tool_call(id, name, arguments));
                        }
                    }
                    Step::Stop => stop.request_stop(true),
                }
            }
        });

        Ok(AdapterStreamHandle { chunks, worker })
    }

    fn test_model<'a>(&'a self) -> BoxFuture<'a, ModelCheck> {
        Box::pin(async { ModelCheck::Success })
    }

    fn last_tool_calls(&self) -> Vec<ToolCallRecord> {
        self.tool_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

/// In-process [`MessageStore`] with the same row semantics as the SQLite store.
/// Runs without a blocking worker thread, so it is safe under a paused clock.
#[derive(Default)]
pub(crate) struct MemoryStore {
    rows: Mutex<Vec<MessageRecord>>,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) reads: AtomicUsize,
    /// Simulated latency for inserts, in milliseconds.
    pub(crate) insert_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn snapshot(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        let mut rows = self
            .rows
            .lock()
            .map(|rows| {
                rows.iter()
                    .filter(|row| &row.conversation_id == conversation_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        rows.sort_by(|left, right| {
            (left.timestamp, left.id.as_str()).cmp(&(right.timestamp, right.id.as_str()))
        });
        rows
    }

    fn check_writable(&self, stage: &'static str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StorageError::InvariantViolation {
                stage,
                details: "writes disabled for this test".to_string(),
            });
        }
        Ok(())
    }
}

impl MessageStore for MemoryStore {
    fn insert_message(&self, message: MessageRecord) -> BoxFuture<'_, StorageResult<InsertOutcome>> {
        Box::pin(async move {
            let delay = self.insert_delay_ms.load(Ordering::Acquire);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.check_writable("memory-insert")?;
            let Ok(mut rows) = self.rows.lock() else {
                return Ok(InsertOutcome::Skipped);
            };
            if rows.iter().any(|row| row.id == message.id) {
                return Ok(InsertOutcome::Skipped);
            }
            rows.push(message);
            Ok(InsertOutcome::Inserted)
        })
    }

    fn update_message(
        &self,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            self.check_writable("memory-update")?;
            let Ok(mut rows) = self.rows.lock() else {
                return Ok(false);
            };
            let Some(row) = rows
                .iter_mut()
                .find(|row| row.id == message_id && !row.status.is_terminal())
            else {
                return Ok(false);
            };

            row.content = update.content;
            row.status = update.status;
            row.content_type = update.content_type;
            let extras = update.extras;
            if extras.thinking_content.is_some() {
                row.thinking_content = extras.thinking_content;
            }
            if extras.token_usage.is_some() {
                row.token_usage = extras.token_usage;
            }
            if extras.tool_calls.is_some() {
                row.tool_calls = extras.tool_calls;
            }
            if extras.invalid_tool_calls.is_some() {
                row.invalid_tool_calls = extras.invalid_tool_calls;
            }
            if extras.metadata.is_some() {
                row.metadata = extras.metadata;
            }
            if extras.error.is_some() {
                row.error = extras.error;
            }
            Ok(true)
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            Ok(self.rows.lock().ok().and_then(|rows| {
                rows.iter().find(|row| row.id == message_id).cloned()
            }))
        })
    }

    fn list_page(
        &self,
        conversation_id: ConversationId,
        offset: u64,
        limit: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::AcqRel);
            Ok(self
                .snapshot(&conversation_id)
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        })
    }

    fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u64,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::AcqRel);
            let rows = self.snapshot(&conversation_id);
            let skip = rows.len().saturating_sub(limit as usize);
            Ok(rows.into_iter().skip(skip).collect())
        })
    }

    fn count_messages(&self, conversation_id: ConversationId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move { Ok(self.snapshot(&conversation_id).len() as u64) })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            self.check_writable("memory-delete")?;
            let Ok(mut rows) = self.rows.lock() else {
                return Ok(false);
            };
            let before = rows.len();
            rows.retain(|row| row.id != message_id);
            Ok(rows.len() < before)
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            self.check_writable("memory-delete-conversation")?;
            let Ok(mut rows) = self.rows.lock() else {
                return Ok(0);
            };
            let before = rows.len();
            rows.retain(|row| row.conversation_id != conversation_id);
            Ok((before - rows.len()) as u64)
        })
    }
}
