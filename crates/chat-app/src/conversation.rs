use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use murmur_storage::{ConversationId, InsertOutcome, MessageId, MessageRecord, MessageStore};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationTuning {
    pub initial_page: u64,
    pub page_size: u64,
    pub cooldown: Duration,
    pub sync_window: u64,
}

impl Default for PaginationTuning {
    fn default() -> Self {
        Self {
            initial_page: 15,
            page_size: 10,
            cooldown: Duration::from_millis(500),
            sync_window: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMore {
    /// Rows merged into the view; duplicates of already-loaded ids are not counted.
    Loaded(usize),
    AllLoaded,
    /// Another fetch is running.
    InFlight,
    /// The previous fetch finished too recently.
    CoolingDown,
    /// The store could not be read; the view is unchanged.
    Unavailable,
}

/// Ascending messages plus an id index into them.
#[derive(Debug, Default)]
struct ViewState {
    messages: Vec<MessageRecord>,
    positions: HashMap<MessageId, usize>,
    all_loaded: bool,
}

impl ViewState {
    /// Inserts or replaces by id. Returns whether the id was new. Callers
    /// re-sort after a batch of upserts.
    fn upsert(&mut self, message: MessageRecord) -> bool {
        match self.positions.get(&message.id) {
            Some(&position) => {
                self.messages[position] = message;
                false
            }
            None => {
                self.positions.insert(message.id.clone(), self.messages.len());
                self.messages.push(message);
                true
            }
        }
    }

    fn get(&self, message_id: &MessageId) -> Option<&MessageRecord> {
        self.positions
            .get(message_id)
            .map(|&position| &self.messages[position])
    }

    fn remove(&mut self, message_id: &MessageId) -> bool {
        let Some(position) = self.positions.remove(message_id) else {
            return false;
        };
        self.messages.remove(position);
        self.reindex();
        true
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.positions.clear();
    }

    fn sort(&mut self) {
        self.messages.sort_by(|left, right| {
            (left.timestamp, left.id.as_str()).cmp(&(right.timestamp, right.id.as_str()))
        });
        self.reindex();
    }

    fn reindex(&mut self) {
        self.positions = self
            .messages
            .iter()
            .enumerate()
            .map(|(position, message)| (message.id.clone(), position))
            .collect();
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// In-memory, ascending view of one conversation, kept loosely in step with the
/// store. Divergence is expected and repaired on demand by [`Self::sync_with_store`].
pub struct ConversationView {
    conversation_id: ConversationId,
    store: Arc<dyn MessageStore>,
    tuning: PaginationTuning,
    state: Mutex<ViewState>,
    fetch_in_flight: AtomicBool,
    last_fetch: Mutex<Option<Instant>>,
}

impl ConversationView {
    pub fn new(
        conversation_id: ConversationId,
        store: Arc<dyn MessageStore>,
        tuning: PaginationTuning,
    ) -> Self {
        Self {
            conversation_id,
            store,
            tuning,
            state: Mutex::new(ViewState::default()),
            fetch_in_flight: AtomicBool::new(false),
            last_fetch: Mutex::new(None),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    fn state(&self) -> MutexGuard<'_, ViewState> {
        // A poisoned view still holds consistent rows; every mutation is a single upsert or sort.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.state().messages.clone()
    }

    pub fn message(&self, message_id: &MessageId) -> Option<MessageRecord> {
        self.state().get(message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    pub fn is_all_loaded(&self) -> bool {
        self.state().all_loaded
    }

    /// Loads the newest page for first paint. Returns the number of rows loaded.
    pub async fn load_initial(&self) -> usize {
        let total = match self.store.count_messages(self.conversation_id.clone()).await {
            Ok(total) => total,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "failed to count stored messages"
                );
                return 0;
            }
        };

        let rows = match self
            .store
            .list_recent(self.conversation_id.clone(), self.tuning.initial_page)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "failed to load recent messages"
                );
                return 0;
            }
        };

        let loaded = rows.len();
        let mut state = self.state();
        for row in rows {
            state.upsert(row);
        }
        state.sort();
        state.all_loaded = total <= loaded as u64;

        tracing::debug!(
            conversation_id = %self.conversation_id,
            loaded,
            total,
            all_loaded = state.all_loaded,
            "initial conversation page loaded"
        );
        loaded
    }

    /// Fetches the next older page.
    pub async fn load_more(&self) -> LoadMore {
        if self.is_all_loaded() {
            return LoadMore::AllLoaded;
        }

        let Some(_guard) = InFlightGuard::acquire(&self.fetch_in_flight) else {
            return LoadMore::InFlight;
        };

        if self.is_cooling_down() {
            return LoadMore::CoolingDown;
        }

        let outcome = self.fetch_older_page().await;
        if let Ok(mut last_fetch) = self.last_fetch.lock() {
            *last_fetch = Some(Instant::now());
        }
        outcome
    }

    fn is_cooling_down(&self) -> bool {
        self.last_fetch
            .lock()
            .ok()
            .and_then(|last_fetch| *last_fetch)
            .is_some_and(|at| at.elapsed() < self.tuning.cooldown)
    }

    async fn fetch_older_page(&self) -> LoadMore {
        let total = match self.store.count_messages(self.conversation_id.clone()).await {
            Ok(total) => total,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "failed to count stored messages"
                );
                return LoadMore::Unavailable;
            }
        };

        let loaded = self.len() as u64;
        let remaining = total.saturating_sub(loaded);
        let offset = remaining.saturating_sub(self.tuning.page_size);
        let limit = remaining - offset;

        if limit == 0 {
            self.state().all_loaded = true;
            return LoadMore::AllLoaded;
        }

        let rows = match self
            .store
            .list_page(self.conversation_id.clone(), offset, limit)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    offset,
                    limit,
                    error = %error,
                    "failed to load older messages"
                );
                return LoadMore::Unavailable;
            }
        };

        let mut state = self.state();
        let added = rows.into_iter().filter(|row| state.upsert(row.clone())).count();
        state.sort();
        state.all_loaded = offset == 0;

        tracing::debug!(
            conversation_id = %self.conversation_id,
            offset,
            limit,
            added,
            all_loaded = state.all_loaded,
            "older conversation page loaded"
        );
        LoadMore::Loaded(added)
    }

    /// Inserts or replaces by id and keeps ascending order.
    pub fn add_message(&self, message: MessageRecord) {
        let mut state = self.state();
        state.upsert(message);
        state.sort();
    }

    pub fn remove_message(&self, message_id: &MessageId) -> bool {
        self.state().remove(message_id)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.clear();
        state.all_loaded = true;
    }

    /// Re-persists in-memory messages that are missing from the store's most
    /// recent window. Best effort: returns how many rows were written back.
    pub async fn sync_with_store(&self) -> usize {
        let window = self.tuning.sync_window;
        let stored = match self
            .store
            .list_recent(self.conversation_id.clone(), window)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "sync skipped; store read failed"
                );
                return 0;
            }
        };

        let stored_ids = stored
            .into_iter()
            .map(|row| row.id)
            .collect::<HashSet<_>>();
        let missing = {
            let state = self.state();
            let skip = state.messages.len().saturating_sub(window as usize);
            state
                .messages
                .iter()
                .skip(skip)
                .filter(|message| !stored_ids.contains(&message.id))
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut repaired = 0;
        for message in missing {
            let message_id = message.id.clone();
            match self.store.insert_message(message).await {
                Ok(InsertOutcome::Inserted) => repaired += 1,
                Ok(InsertOutcome::Skipped) => {}
                Err(error) => tracing::warn!(
                    message_id = %message_id,
                    error = %error,
                    "failed to re-persist message during sync"
                ),
            }
        }

        if repaired > 0 {
            tracing::info!(
                conversation_id = %self.conversation_id,
                repaired,
                "re-persisted messages missing from store"
            );
        }
        repaired
    }
}
