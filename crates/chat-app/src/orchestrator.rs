//! Drives one assistant turn from adapter output to a terminal stored message.
//!
//! The loop folds raw chunks through the normalizer, coalesces UI deliveries to
//! at most one per throttle interval, debounces store writes behind a growth
//! threshold, and always ends with exactly one final write.

use std::sync::Arc;
use std::time::Duration;

use murmur_llm::{
    AdapterError, ChunkAccumulator, HistoryMessage, ModelAdapter, RawChunk, StopSignal,
    aggregate_usage, fold_chunk,
};
use murmur_storage::{
    ContentType, MessageExtras, MessageRecord, MessageStatus, MessageStore, MessageUpdate,
    ToolCallRecord,
};
use serde_json::json;
use tokio::time::{Instant, sleep, sleep_until};

use crate::error::{SessionError, SessionResult};

/// Receives the current `(user, assistant)` pair on every delivery.
pub type UpdateCallback = Arc<dyn Fn(&MessageRecord, &MessageRecord) + Send + Sync>;

// Upper bound between stop-flag polls while no chunk arrives.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTuning {
    pub ui_interval: Duration,
    pub store_quiet_period: Duration,
    pub store_growth_threshold: usize,
    pub final_echo_delay: Duration,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            ui_interval: Duration::from_millis(120),
            store_quiet_period: Duration::from_millis(200),
            store_growth_threshold: 250,
            final_echo_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Streaming,
    Completed,
    Stopped,
    Failed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

/// One turn handed to the orchestrator. Both messages must already be stored.
#[derive(Debug, Clone)]
pub struct StreamTurn {
    pub user: MessageRecord,
    pub assistant: MessageRecord,
    pub history: Vec<HistoryMessage>,
    pub model: String,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub state: StreamState,
    pub user: MessageRecord,
    pub assistant: MessageRecord,
}

/// Coalesces UI deliveries: at most one per interval, always the latest state.
#[derive(Debug)]
struct UiThrottle {
    interval: Duration,
    last_delivery: Option<Instant>,
    dirty: bool,
}

impl UiThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_delivery: None,
            dirty: false,
        }
    }

    fn mark_delivered(&mut self, now: Instant) {
        self.last_delivery = Some(now);
        self.dirty = false;
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn is_due(&self, now: Instant) -> bool {
        self.dirty
            && self
                .last_delivery
                .is_none_or(|last| now.duration_since(last) >= self.interval)
    }

    /// Backstop timer so a continuous chunk stream still renders on cadence.
    fn deadline(&self) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        Some(
            self.last_delivery
                .map_or_else(Instant::now, |last| last + self.interval),
        )
    }
}

/// Debounces durable writes. Only growth past the threshold arms the timer, and
/// every qualifying update pushes it back.
#[derive(Debug)]
struct WriteDebouncer {
    quiet_period: Duration,
    growth_threshold: usize,
    written_content_chars: usize,
    written_thinking_chars: usize,
    deadline: Option<Instant>,
}

impl WriteDebouncer {
    fn new(quiet_period: Duration, growth_threshold: usize) -> Self {
        Self {
            quiet_period,
            growth_threshold,
            written_content_chars: 0,
            written_thinking_chars: 0,
            deadline: None,
        }
    }

    fn observe(&mut self, accumulator: &ChunkAccumulator, now: Instant) {
        let content_growth = accumulator
            .content
            .chars()
            .count()
            .saturating_sub(self.written_content_chars);
        let thinking_growth = accumulator
            .thinking
            .chars()
            .count()
            .saturating_sub(self.written_thinking_chars);

        if content_growth.max(thinking_growth) >= self.growth_threshold {
            self.deadline = Some(now + self.quiet_period);
            tracing::debug!(
                content_growth,
                thinking_growth,
                "store write debounce rearmed"
            );
        }
    }

    fn mark_written(&mut self, accumulator: &ChunkAccumulator) {
        self.written_content_chars = accumulator.content.chars().count();
        self.written_thinking_chars = accumulator.thinking.chars().count();
        self.deadline = None;
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }
}

pub struct StreamOrchestrator {
    store: Arc<dyn MessageStore>,
    tuning: StreamTuning,
}

impl StreamOrchestrator {
    pub fn new(store: Arc<dyn MessageStore>, tuning: StreamTuning) -> Self {
        Self { store, tuning }
    }

    pub fn tuning(&self) -> StreamTuning {
        self.tuning
    }

    /// Runs one turn to a terminal state.
    ///
    /// Completion and manual stop both end with status `sent`. A backend failure
    /// that was not caused by cancellation ends with status `error` and is
    /// returned as [`SessionError::Generation`] after the final write and
    /// callbacks have happened.
    pub async fn run(
        &self,
        adapter: &dyn ModelAdapter,
        turn: StreamTurn,
        stop: StopSignal,
        on_update: UpdateCallback,
    ) -> SessionResult<StreamOutcome> {
        let StreamTurn {
            mut user,
            mut assistant,
            history,
            model,
            streaming,
        } = turn;
        let mut state = StreamState::Init;

        on_update(&user, &assistant);

        if user.advance_status(MessageStatus::Sent) {
            self.persist(&user, "persist-user-sent").await;
        }

        let mut raw_history: Vec<RawChunk> = Vec::new();
        let mut accumulator = ChunkAccumulator::new();
        let mut failure: Option<AdapterError> = None;

        state = self.transition(state, StreamState::Streaming, &assistant);

        let exit_state = if streaming {
            self.drive_stream(
                adapter,
                history,
                &stop,
                &user,
                &mut assistant,
                &mut raw_history,
                &mut accumulator,
                &mut failure,
                &on_update,
            )
            .await
        } else {
            self.drive_chat(
                adapter,
                history,
                &stop,
                &mut raw_history,
                &mut accumulator,
                &mut failure,
            )
            .await
        };
        state = self.transition(state, exit_state, &assistant);

        let tool_calls = adapter.last_tool_calls();
        Self::finalize(
            &mut assistant,
            &accumulator,
            &raw_history,
            tool_calls,
            failure.as_ref(),
            json!({
                "backend": adapter.backend_id(),
                "model": model,
                "chunk_count": raw_history.len(),
                "stopped_manually": stop.stopped_manually(),
            }),
        );

        self.persist(&assistant, "persist-final").await;

        on_update(&user, &assistant);
        sleep(self.tuning.final_echo_delay).await;
        on_update(&user, &assistant);

        tracing::info!(
            message_id = %assistant.id,
            conversation_id = %assistant.conversation_id,
            state = state.as_str(),
            chunk_count = raw_history.len(),
            content_len = assistant.content.len(),
            "assistant turn finished"
        );

        match failure {
            Some(source) => Err(SessionError::Generation {
                stage: "stream-orchestrate",
                source,
                assistant: Box::new(assistant),
            }),
            None => Ok(StreamOutcome {
                state,
                user,
                assistant,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        &self,
        adapter: &dyn ModelAdapter,
        history: Vec<HistoryMessage>,
        stop: &StopSignal,
        user: &MessageRecord,
        assistant: &mut MessageRecord,
        raw_history: &mut Vec<RawChunk>,
        accumulator: &mut ChunkAccumulator,
        failure: &mut Option<AdapterError>,
        on_update: &UpdateCallback,
    ) -> StreamState {
        let handle = match adapter.stream(history, stop.clone()) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(
                    message_id = %assistant.id,
                    error = %error,
                    "failed to start backend stream"
                );
                *failure = Some(error);
                return StreamState::Failed;
            }
        };

        let mut chunks = handle.chunks;
        let worker = tokio::spawn(handle.worker);

        let mut throttle = UiThrottle::new(self.tuning.ui_interval);
        throttle.mark_delivered(Instant::now());
        let mut debouncer = WriteDebouncer::new(
            self.tuning.store_quiet_period,
            self.tuning.store_growth_threshold,
        );

        let exit_state = loop {
            if stop.is_cancelled() {
                break StreamState::Stopped;
            }

            let ui_deadline = throttle.deadline();
            let store_deadline = debouncer.deadline;

            tokio::select! {
                next = chunks.recv() => match next {
                    Some(Ok(chunk)) => {
                        // A chunk that lands after the stop request is not part of the reply.
                        if stop.is_cancelled() {
                            break StreamState::Stopped;
                        }

                        let before = (accumulator.content.len(), accumulator.thinking.len());
                        *accumulator = fold_chunk(&chunk, std::mem::take(accumulator));
                        raw_history.push(chunk);
                        if before == (accumulator.content.len(), accumulator.thinking.len()) {
                            continue;
                        }

                        Self::apply_progress(assistant, accumulator);
                        let now = Instant::now();
                        throttle.mark_dirty();
                        debouncer.observe(accumulator, now);
                        if throttle.is_due(now) {
                            on_update(user, assistant);
                            throttle.mark_delivered(now);
                        }
                    }
                    Some(Err(error)) => {
                        if stop.is_cancelled() {
                            tracing::debug!(
                                message_id = %assistant.id,
                                error = %error,
                                "ignoring stream error after cancellation"
                            );
                            break StreamState::Stopped;
                        }
                        tracing::warn!(
                            message_id = %assistant.id,
                            error = %error,
                            "backend stream failed"
                        );
                        *failure = Some(error);
                        break StreamState::Failed;
                    }
                    None => {
                        break if stop.is_cancelled() {
                            StreamState::Stopped
                        } else {
                            StreamState::Completed
                        };
                    }
                },
                _ = sleep_until(ui_deadline.unwrap_or_else(Instant::now)), if ui_deadline.is_some() => {
                    on_update(user, assistant);
                    throttle.mark_delivered(Instant::now());
                }
                _ = sleep_until(store_deadline.unwrap_or_else(Instant::now)), if store_deadline.is_some() => {
                    let update = MessageUpdate::new(
                        assistant.content.clone(),
                        MessageStatus::Streaming,
                        assistant.content_type,
                    )
                    .with_extras(MessageExtras {
                        thinking_content: assistant.thinking_content.clone(),
                        ..MessageExtras::default()
                    });
                    self.write(assistant, update, "persist-debounced").await;
                    debouncer.mark_written(accumulator);
                }
                _ = sleep(STOP_POLL_INTERVAL) => {}
            }
        };

        debouncer.cancel();
        drop(chunks);
        if exit_state != StreamState::Completed {
            worker.abort();
        }

        exit_state
    }

    async fn drive_chat(
        &self,
        adapter: &dyn ModelAdapter,
        history: Vec<HistoryMessage>,
        stop: &StopSignal,
        raw_history: &mut Vec<RawChunk>,
        accumulator: &mut ChunkAccumulator,
        failure: &mut Option<AdapterError>,
    ) -> StreamState {
        match adapter.chat(history).await {
            Ok(reply) => {
                let chunk = RawChunk::String(reply);
                *accumulator = fold_chunk(&chunk, std::mem::take(accumulator));
                raw_history.push(chunk);
                if stop.is_cancelled() {
                    StreamState::Stopped
                } else {
                    StreamState::Completed
                }
            }
            Err(_) if stop.is_cancelled() => StreamState::Stopped,
            Err(error) => {
                tracing::warn!(
                    backend_id = adapter.backend_id(),
                    error = %error,
                    "backend chat call failed"
                );
                *failure = Some(error);
                StreamState::Failed
            }
        }
    }

    fn apply_progress(assistant: &mut MessageRecord, accumulator: &ChunkAccumulator) {
        assistant.content.clone_from(&accumulator.content);
        assistant.thinking_content = if accumulator.thinking.is_empty() {
            None
        } else {
            Some(accumulator.thinking.clone())
        };
    }

    fn finalize(
        assistant: &mut MessageRecord,
        accumulator: &ChunkAccumulator,
        raw_history: &[RawChunk],
        tool_calls: Vec<ToolCallRecord>,
        failure: Option<&AdapterError>,
        metadata: serde_json::Value,
    ) {
        Self::apply_progress(assistant, accumulator);
        assistant.content_type = ContentType::Markdown;
        assistant.token_usage = aggregate_usage(raw_history);

        let (invalid, valid): (Vec<_>, Vec<_>) =
            tool_calls.into_iter().partition(ToolCallRecord::is_invalid);
        assistant.tool_calls = (!valid.is_empty()).then_some(valid);
        assistant.invalid_tool_calls = (!invalid.is_empty()).then_some(invalid);
        assistant.metadata = Some(metadata);

        match failure {
            Some(error) => {
                assistant.advance_status(MessageStatus::Error);
                assistant.error = Some(error.to_string());
            }
            None => {
                assistant.advance_status(MessageStatus::Sent);
            }
        }
    }

    fn transition(
        &self,
        from: StreamState,
        to: StreamState,
        assistant: &MessageRecord,
    ) -> StreamState {
        tracing::debug!(
            message_id = %assistant.id,
            from = from.as_str(),
            to = to.as_str(),
            "stream state changed"
        );
        to
    }

    async fn persist(&self, message: &MessageRecord, stage: &'static str) {
        self.write(message, MessageUpdate::from_record(message), stage)
            .await;
    }

    /// Store failures never end the turn; the in-memory state stays authoritative.
    async fn write(&self, message: &MessageRecord, update: MessageUpdate, stage: &'static str) {
        match self.store.update_message(message.id.clone(), update).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                message_id = %message.id,
                stage,
                "store update matched no writable row"
            ),
            Err(error) => tracing::warn!(
                message_id = %message.id,
                stage,
                error = %error,
                "store update failed; continuing in memory"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use murmur_storage::{ConversationId, TokenUsage};
    use serde_json::Value;

    use super::*;
    use crate::testing::{MemoryStore, ScriptedAdapter, Step, text};

    async fn stored_turn(store: &MemoryStore, streaming: bool) -> StreamTurn {
        let conversation_id = ConversationId::new("c1");
        let user = MessageRecord::user_sending(conversation_id.clone(), "question");
        let assistant = MessageRecord::assistant_placeholder(conversation_id);
        store.insert_message(user.clone()).await.expect("insert user");
        store
            .insert_message(assistant.clone())
            .await
            .expect("insert assistant");

        StreamTurn {
            history: vec![HistoryMessage::new(user.role, user.content.clone())],
            user,
            assistant,
            model: "scripted-model".to_string(),
            streaming,
        }
    }

    type Frames = Arc<Mutex<Vec<(Instant, MessageRecord)>>>;

    fn recorder() -> (UpdateCallback, Frames) {
        let frames: Frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let callback: UpdateCallback =
            Arc::new(move |_user: &MessageRecord, assistant: &MessageRecord| {
                if let Ok(mut frames) = sink.lock() {
                    frames.push((Instant::now(), assistant.clone()));
                }
            });
        (callback, frames)
    }

    async fn stored(store: &MemoryStore, message: &MessageRecord) -> MessageRecord {
        store
            .get_message(message.id.clone())
            .await
            .expect("read")
            .expect("row exists")
    }

    #[tokio::test(start_paused = true)]
    async fn completed_stream_persists_final_state() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        let placeholder = turn.assistant.clone();
        let adapter = ScriptedAdapter::new(vec![
            Step::Chunk(json!({"additional_kwargs": {"reasoning_content": "step1"}})),
            text("Hello"),
            text(" world"),
            Step::Chunk(json!({"usage": {"prompt_tokens": 3, "completion_tokens": 2}})),
            Step::Chunk(json!({"usage_metadata": {"total_tokens": 9}})),
            Step::ToolCall("search", json!({"q": "rust"})),
            Step::ToolCall("broken", json!("{not json")),
        ]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, frames) = recorder();

        let outcome = orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect("turn should complete");

        assert_eq!(outcome.state, StreamState::Completed);
        assert_eq!(outcome.user.status, MessageStatus::Sent);

        let row = stored(&store, &placeholder).await;
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.content, "Hello world");
        assert_eq!(row.thinking(), "step1");
        assert_eq!(row.token_usage, Some(TokenUsage::new(9, 3, 2)));
        assert_eq!(row.tool_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(row.invalid_tool_calls.as_ref().map(Vec::len), Some(1));
        let metadata = row.metadata.expect("metadata");
        assert_eq!(metadata["backend"], json!("scripted"));
        assert_eq!(metadata["chunk_count"], json!(5));
        assert_eq!(metadata["stopped_manually"], json!(false));

        let frames = frames.lock().expect("lock");
        assert!(frames[0].1.content.is_empty(), "placeholder is delivered first");
        let (last_at, last) = &frames[frames.len() - 1];
        let (final_at, final_frame) = &frames[frames.len() - 2];
        assert_eq!(last, final_frame, "final state is delivered twice");
        assert_eq!(*last_at - *final_at, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_stop_still_writes_sent_row() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        let placeholder = turn.assistant.clone();
        let adapter = ScriptedAdapter::new(vec![
            Step::Chunk(json!({"reasoning": "thinking..."})),
            text("partial"),
            Step::Delay(Duration::from_millis(30)),
            Step::Stop,
            Step::Delay(Duration::from_millis(30)),
            text(" never seen"),
            Step::Fail("connection reset after stop"),
        ]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, _frames) = recorder();

        let outcome = orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect("a manual stop is not an error");

        assert_eq!(outcome.state, StreamState::Stopped);
        let row = stored(&store, &placeholder).await;
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.content, "partial");
        assert_eq!(row.thinking(), "thinking...");
        assert_eq!(row.metadata.expect("metadata")["stopped_manually"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_backend_stalls_keeps_recorded_tool_calls() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        let placeholder = turn.assistant.clone();
        let adapter = ScriptedAdapter::new(vec![
            text("partial"),
            Step::ToolCall("search", json!({"q": "rust"})),
            Step::Delay(Duration::from_secs(5)),
            text(" never seen"),
        ]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, _frames) = recorder();

        let stop = StopSignal::new();
        let stopper = stop.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            stopper.request_stop(true);
        });

        let outcome = orchestrator
            .run(&adapter, turn, stop, callback)
            .await
            .expect("a manual stop is not an error");

        assert_eq!(outcome.state, StreamState::Stopped);
        let row = stored(&store, &placeholder).await;
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.content, "partial");
        let calls = row.tool_calls.expect("tool calls recorded before the stop");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_propagates_after_final_write() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        let placeholder = turn.assistant.clone();
        let adapter = ScriptedAdapter::new(vec![text("half an ans"), Step::Fail("socket closed")]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, frames) = recorder();

        let error = orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect_err("transport failure must propagate");

        let SessionError::Generation { assistant, .. } = error else {
            panic!("expected a generation error");
        };
        assert_eq!(assistant.status, MessageStatus::Error);
        assert!(
            assistant
                .error
                .as_deref()
                .is_some_and(|message| message.contains("socket closed"))
        );

        let row = stored(&store, &placeholder).await;
        assert_eq!(row.status, MessageStatus::Error);
        assert_eq!(row.content, "half an ans");
        let last_status = frames.lock().expect("lock").last().map(|(_, m)| m.status);
        assert_eq!(last_status, Some(MessageStatus::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_do_not_end_the_turn() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        store
            .fail_writes
            .store(true, std::sync::atomic::Ordering::Release);
        let adapter = ScriptedAdapter::new(vec![text("still answered")]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, _frames) = recorder();

        let outcome = orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect("persistence errors are non-fatal");

        assert_eq!(outcome.assistant.content, "still answered");
        assert_eq!(outcome.assistant.status, MessageStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn ui_updates_are_throttled_and_carry_latest_state() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        let mut steps = Vec::new();
        for _ in 0..50 {
            steps.push(text("x"));
            steps.push(Step::Delay(Duration::from_millis(10)));
        }
        let adapter = ScriptedAdapter::new(steps);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, frames) = recorder();

        orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect("turn should complete");

        let frames = frames.lock().expect("lock");
        // Placeholder first, final frame and its echo last.
        let streaming_frames = &frames[1..frames.len() - 2];
        assert!(
            streaming_frames.len() >= 3,
            "the backstop timer keeps frames flowing under a continuous stream"
        );
        assert!(streaming_frames.len() <= 5);
        for pair in streaming_frames.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(120));
            assert!(pair[1].1.content.len() > pair[0].1.content.len());
        }
        assert_eq!(frames[frames.len() - 1].1.content.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn store_writes_wait_for_growth_and_quiet_period() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, true).await;
        let placeholder = turn.assistant.clone();
        let adapter = ScriptedAdapter::new(vec![
            text("short"),
            Step::Delay(Duration::from_millis(400)),
            Step::Chunk(Value::String("y".repeat(300))),
            Step::Delay(Duration::from_millis(100)),
            text("z"),
            Step::Delay(Duration::from_millis(500)),
        ]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());

        let probe_store = store.clone();
        let probe = tokio::spawn(async move {
            let mut samples = Vec::new();
            for _ in 0..9 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let row = stored(&probe_store, &placeholder).await;
                samples.push(row.content.chars().count());
            }
            samples
        });

        let (callback, _frames) = recorder();
        orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect("turn should complete");
        let samples = probe.await.expect("probe task");

        // t=300: "short" alone never crosses the growth threshold.
        assert_eq!(samples[2], 0);
        // t=600: the burst at t=400 armed the timer, "z" at t=500 pushed it back.
        assert_eq!(samples[5], 0);
        // t=800: the single debounced write has landed with the latest text.
        assert_eq!(samples[7], 306);
    }

    #[tokio::test(start_paused = true)]
    async fn non_streaming_profile_uses_chat() {
        let store = MemoryStore::new();
        let turn = stored_turn(&store, false).await;
        let adapter = ScriptedAdapter::new(vec![text("<think>plan</think>done")]);
        let orchestrator = StreamOrchestrator::new(store.clone(), StreamTuning::default());
        let (callback, _frames) = recorder();

        let outcome = orchestrator
            .run(&adapter, turn, StopSignal::new(), callback)
            .await
            .expect("chat should complete");

        assert_eq!(outcome.state, StreamState::Completed);
        assert_eq!(outcome.assistant.content, "done");
        assert_eq!(outcome.assistant.thinking(), "plan");
        assert_eq!(
            outcome.assistant.metadata.expect("metadata")["chunk_count"],
            json!(1)
        );
    }

    #[test]
    fn throttle_is_due_only_after_interval() {
        let start = Instant::now();
        let mut throttle = UiThrottle::new(Duration::from_millis(120));
        throttle.mark_delivered(start);
        assert_eq!(throttle.deadline(), None);

        throttle.mark_dirty();
        assert!(!throttle.is_due(start + Duration::from_millis(50)));
        assert!(throttle.is_due(start + Duration::from_millis(120)));
        assert_eq!(throttle.deadline(), Some(start + Duration::from_millis(120)));
    }
}
