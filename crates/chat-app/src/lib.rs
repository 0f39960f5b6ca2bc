pub mod conversation;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod settings;

#[cfg(test)]
mod testing;

pub use conversation::{ConversationView, LoadMore, PaginationTuning};
pub use error::{SessionError, SessionResult};
pub use orchestrator::{
    StreamOrchestrator, StreamOutcome, StreamState, StreamTuning, StreamTurn, UpdateCallback,
};
pub use session::{ChatSession, TurnOutcome};
pub use settings::{BackendProfile, Settings, SettingsError, SettingsStore};
