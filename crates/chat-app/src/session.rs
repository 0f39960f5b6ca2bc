use std::sync::Arc;

use arc_swap::ArcSwap;
use murmur_llm::{
    AdapterFactory, BackendConfig, HistoryMessage, ModelCheck, ModelCheckFailure, StopSignal,
    classify_failure,
};
use murmur_storage::{
    ConversationId, MessageId, MessageRecord, MessageRole, MessageStatus, MessageStore,
    MessageUpdate,
};
use snafu::ResultExt;

use crate::conversation::ConversationView;
use crate::error::{
    AdapterInitSnafu, MessageNotFoundSnafu, NotRetryableSnafu, SessionError, SessionResult,
};
use crate::orchestrator::{StreamOrchestrator, StreamState, StreamTurn, UpdateCallback};

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: StreamState,
    pub user: MessageRecord,
    pub assistant: MessageRecord,
}

/// One conversation's send/retry/stop/delete surface. The UI is expected to
/// keep a single turn in flight at a time.
pub struct ChatSession {
    store: Arc<dyn MessageStore>,
    adapters: Arc<dyn AdapterFactory>,
    orchestrator: StreamOrchestrator,
    view: Arc<ConversationView>,
    stop: ArcSwap<StopSignal>,
    on_update: UpdateCallback,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn MessageStore>,
        adapters: Arc<dyn AdapterFactory>,
        orchestrator: StreamOrchestrator,
        view: Arc<ConversationView>,
        on_update: UpdateCallback,
    ) -> Self {
        Self {
            store,
            adapters,
            orchestrator,
            view,
            stop: ArcSwap::from_pointee(StopSignal::new()),
            on_update,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.view.conversation_id()
    }

    pub fn view(&self) -> &Arc<ConversationView> {
        &self.view
    }

    /// Requests a manual stop of the turn in flight, if any.
    pub fn stop(&self) {
        let signal = self.stop.load();
        if !signal.is_cancelled() {
            tracing::info!(conversation_id = %self.conversation_id(), "manual stop requested");
        }
        signal.request_stop(true);
    }

    /// Submits `text` as a new user turn.
    ///
    /// Both messages are appended and stored before the backend is contacted. An
    /// unknown backend is not an error: the turn ends with an assistant message
    /// in status `error` and [`StreamState::Failed`].
    pub async fn send(
        &self,
        text: impl Into<String>,
        config: BackendConfig,
    ) -> SessionResult<TurnOutcome> {
        // Installed before any await so an early stop reaches this turn.
        let stop = StopSignal::new();
        self.stop.store(Arc::new(stop.clone()));

        let text = text.into();
        let conversation_id = self.conversation_id().clone();
        let history = self.history_for(&text);
        let user = MessageRecord::user_sending(conversation_id.clone(), text);
        let assistant = MessageRecord::assistant_placeholder(conversation_id);

        self.view.add_message(user.clone());
        self.view.add_message(assistant.clone());
        self.insert(&user).await;
        self.insert(&assistant).await;

        let Some(mut adapter) = self.adapters.create(&config.backend_id) else {
            tracing::warn!(
                backend_id = %config.backend_id,
                message_id = %assistant.id,
                "unsupported backend"
            );
            let message = format!("unsupported backend '{}'", config.backend_id);
            return Ok(self.fail_turn(user, assistant, message).await);
        };

        let backend_id = config.backend_id.clone();
        let model = config.model.clone();
        let streaming = config.streaming;
        if let Err(source) = adapter.initialize(config) {
            let message = source.to_string();
            self.fail_turn(user, assistant, message).await;
            return Err(source).context(AdapterInitSnafu {
                stage: "session-initialize-adapter",
                backend_id,
            });
        }

        let turn = StreamTurn {
            user,
            assistant,
            history,
            model,
            streaming,
        };
        let result = self
            .orchestrator
            .run(adapter.as_ref(), turn, stop, self.view_callback())
            .await;

        match result {
            Ok(outcome) => {
                self.view.add_message(outcome.user.clone());
                self.view.add_message(outcome.assistant.clone());
                Ok(TurnOutcome {
                    state: outcome.state,
                    user: outcome.user,
                    assistant: outcome.assistant,
                })
            }
            Err(error) => {
                if let SessionError::Generation { assistant, .. } = &error {
                    self.view.add_message(assistant.as_ref().clone());
                }
                Err(error)
            }
        }
    }

    /// Resubmits the text of an earlier user message unchanged, as a new turn.
    pub async fn retry(
        &self,
        user_message_id: &MessageId,
        config: BackendConfig,
    ) -> SessionResult<TurnOutcome> {
        let message = match self.view.message(user_message_id) {
            Some(message) => Some(message),
            None => self
                .store
                .get_message(user_message_id.clone())
                .await
                .unwrap_or_else(|error| {
                    tracing::warn!(
                        message_id = %user_message_id,
                        error = %error,
                        "store lookup for retry failed"
                    );
                    None
                }),
        };

        let Some(message) = message else {
            return MessageNotFoundSnafu {
                stage: "session-retry",
                message_id: user_message_id.to_string(),
            }
            .fail();
        };
        if message.role != MessageRole::User {
            return NotRetryableSnafu {
                stage: "session-retry",
                message_id: user_message_id.to_string(),
            }
            .fail();
        }

        tracing::info!(message_id = %user_message_id, "retrying user message");
        self.send(message.content, config).await
    }

    /// Removes one message from the view and the store. Store failures are logged.
    pub async fn delete_message(&self, message_id: &MessageId) -> bool {
        let removed = self.view.remove_message(message_id);
        match self.store.delete_message(message_id.clone()).await {
            Ok(deleted) => removed || deleted,
            Err(error) => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %error,
                    "failed to delete stored message"
                );
                removed
            }
        }
    }

    /// Clears the conversation. Returns the number of stored rows deleted.
    pub async fn delete_conversation(&self) -> u64 {
        self.view.clear();
        match self
            .store
            .delete_conversation(self.conversation_id().clone())
            .await
        {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id(),
                    error = %error,
                    "failed to delete stored conversation"
                );
                0
            }
        }
    }

    /// Initializes a throwaway adapter for `config` and runs its connectivity probe.
    pub async fn check_backend(&self, config: BackendConfig) -> ModelCheck {
        let Some(mut adapter) = self.adapters.create(&config.backend_id) else {
            return ModelCheck::Failure(ModelCheckFailure::Unknown);
        };
        if let Err(error) = adapter.initialize(config) {
            return ModelCheck::Failure(classify_failure(&error.to_string()));
        }
        adapter.test_model().await
    }

    /// Prior settled turns plus the new user text, oldest first.
    fn history_for(&self, text: &str) -> Vec<HistoryMessage> {
        let mut history = self
            .view
            .messages()
            .into_iter()
            .filter(|message| {
                message.status == MessageStatus::Sent && !message.content.trim().is_empty()
            })
            .map(|message| HistoryMessage::new(message.role, message.content))
            .collect::<Vec<_>>();
        history.push(HistoryMessage::new(MessageRole::User, text));
        history
    }

    /// Keeps the view in step with every delivered frame before handing it to the UI.
    fn view_callback(&self) -> UpdateCallback {
        let view = self.view.clone();
        let on_update = self.on_update.clone();
        Arc::new(move |user: &MessageRecord, assistant: &MessageRecord| {
            view.add_message(user.clone());
            view.add_message(assistant.clone());
            on_update(user, assistant);
        })
    }

    async fn fail_turn(
        &self,
        mut user: MessageRecord,
        mut assistant: MessageRecord,
        message: String,
    ) -> TurnOutcome {
        user.advance_status(MessageStatus::Sent);
        assistant.advance_status(MessageStatus::Error);
        assistant.error = Some(message);

        self.update(&user).await;
        self.update(&assistant).await;
        self.view.add_message(user.clone());
        self.view.add_message(assistant.clone());
        (self.on_update)(&user, &assistant);

        TurnOutcome {
            state: StreamState::Failed,
            user,
            assistant,
        }
    }

    async fn insert(&self, message: &MessageRecord) {
        if let Err(error) = self.store.insert_message(message.clone()).await {
            tracing::warn!(
                message_id = %message.id,
                error = %error,
                "failed to persist message; keeping it in memory"
            );
        }
    }

    async fn update(&self, message: &MessageRecord) {
        if let Err(error) = self
            .store
            .update_message(message.id.clone(), MessageUpdate::from_record(message))
            .await
        {
            tracing::warn!(
                message_id = %message.id,
                error = %error,
                "failed to persist message update"
            );
        }
    }
}
