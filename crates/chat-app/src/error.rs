use murmur_llm::AdapterError;
use murmur_storage::MessageRecord;
use snafu::Snafu;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("backend '{backend_id}' could not be initialized on `{stage}`: {source}"))]
    AdapterInit {
        stage: &'static str,
        backend_id: String,
        source: AdapterError,
    },
    /// The turn failed for a reason other than cancellation. `assistant` is the
    /// terminal error message that was already stored and delivered.
    #[snafu(display("generation failed on `{stage}`: {source}"))]
    Generation {
        stage: &'static str,
        source: AdapterError,
        assistant: Box<MessageRecord>,
    },
    #[snafu(display("message '{message_id}' not found on `{stage}`"))]
    MessageNotFound {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("message '{message_id}' is not a user message on `{stage}`"))]
    NotRetryable {
        stage: &'static str,
        message_id: String,
    },
}
