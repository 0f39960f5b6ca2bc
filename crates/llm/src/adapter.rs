use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use murmur_storage::{MessageRole, ToolCallRecord};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::mpsc;

use super::normalizer::RawChunk;

pub const MODEL_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const MODEL_CHECK_PROMPT: &str = "Reply with the single word: pong";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type AdapterWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type AdapterResult<T> = Result<T, AdapterError>;

/// A tool the backend may call. `parameters` must be a JSON-schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Per-send backend settings. Built for one call and dropped after `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub backend_id: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub streaming: bool,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSpec>,
}

impl BackendConfig {
    pub fn new(
        backend_id: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            backend_id: backend_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            base_url: String::new(),
            model: model.into().trim().to_string(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            streaming: true,
            system_prompt: None,
            tools: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().to_string();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// One prior turn handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Cooperative cancellation shared between the caller, the orchestrator loop
/// and the adapter's stream worker. Polled, never preemptive.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    cancelled: Arc<AtomicBool>,
    manual: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. `manual` marks a user-initiated stop, which only
    /// affects bookkeeping.
    pub fn request_stop(&self, manual: bool) {
        if manual {
            self.manual.store(true, Ordering::Release);
        }
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn stopped_manually(&self) -> bool {
        self.manual.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCheckFailure {
    Timeout,
    InvalidApiKey,
    ConnectionError,
    Unknown,
}

impl ModelCheckFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::InvalidApiKey => "invalid_api_key",
            Self::ConnectionError => "connection_error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCheck {
    Success,
    Failure(ModelCheckFailure),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdapterError {
    #[snafu(display("missing API key for backend '{backend_id}'"))]
    MissingApiKey {
        stage: &'static str,
        backend_id: String,
    },
    #[snafu(display("missing model name for backend '{backend_id}'"))]
    MissingModel {
        stage: &'static str,
        backend_id: String,
    },
    #[snafu(display("adapter for '{backend_id}' was used before initialize"))]
    NotInitialized {
        stage: &'static str,
        backend_id: String,
    },
    #[snafu(display("request has no user or assistant messages"))]
    EmptyMessageSet { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("backend transport failed on `{stage}`: {message}"))]
    Transport {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("backend stream ended without producing any content"))]
    EmptyResponse { stage: &'static str },
}

/// Receiving half of an adapter stream. Dropping it tells the worker to stop.
pub struct ChunkStream {
    chunks: mpsc::UnboundedReceiver<AdapterResult<RawChunk>>,
}

impl ChunkStream {
    pub async fn recv(&mut self) -> Option<AdapterResult<RawChunk>> {
        self.chunks.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AdapterResult<RawChunk>> {
        self.chunks.try_recv().ok()
    }
}

/// A started stream: `chunks` yields raw vendor chunks while `worker` drives the
/// backend call. The caller decides where the worker runs.
pub struct AdapterStreamHandle {
    pub chunks: ChunkStream,
    pub worker: AdapterWorker,
}

pub fn make_chunk_stream() -> (mpsc::UnboundedSender<AdapterResult<RawChunk>>, ChunkStream) {
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    (chunk_tx, ChunkStream { chunks: chunk_rx })
}

/// Uniform wrapper around one vendor's call, stream and connectivity-test operations.
pub trait ModelAdapter: Send + Sync {
    fn backend_id(&self) -> &str;

    /// Prepares a session. Tool binding problems are logged and tools dropped;
    /// only a configuration the backend cannot work with is an error.
    fn initialize(&mut self, config: BackendConfig) -> AdapterResult<()>;

    /// Blocking full-response call.
    fn chat<'a>(&'a self, history: Vec<HistoryMessage>) -> BoxFuture<'a, AdapterResult<String>>;

    /// Starts streaming. The stream yields an [`AdapterError::EmptyResponse`] if it
    /// finishes without any content, unless `stop` was signalled.
    fn stream(
        &self,
        history: Vec<HistoryMessage>,
        stop: StopSignal,
    ) -> AdapterResult<AdapterStreamHandle>;

    fn test_model<'a>(&'a self) -> BoxFuture<'a, ModelCheck>;

    /// Tool calls seen during the most recent `chat` or `stream`.
    fn last_tool_calls(&self) -> Vec<ToolCallRecord>;
}

/// Races a probe call against `timeout` and classifies the outcome.
pub async fn check_model<F>(probe: F, timeout: Duration) -> ModelCheck
where
    F: Future<Output = AdapterResult<String>>,
{
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(_)) => ModelCheck::Success,
        Ok(Err(error)) => {
            let kind = classify_failure(&error.to_string());
            tracing::warn!(error = %error, kind = kind.as_str(), "model check failed");
            ModelCheck::Failure(kind)
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "model check timed out");
            ModelCheck::Failure(ModelCheckFailure::Timeout)
        }
    }
}

/// The probe history used by [`ModelAdapter::test_model`] implementations.
pub fn model_check_history() -> Vec<HistoryMessage> {
    vec![HistoryMessage::new(MessageRole::User, MODEL_CHECK_PROMPT)]
}

pub fn classify_failure(message: &str) -> ModelCheckFailure {
    let lowered = message.to_ascii_lowercase();
    let has_any = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));

    if has_any(&["timed out", "timeout"]) {
        ModelCheckFailure::Timeout
    } else if has_any(&[
        "401",
        "403",
        "unauthorized",
        "invalid api key",
        "invalid_api_key",
        "incorrect api key",
        "authentication",
        "missing api key",
    ]) {
        ModelCheckFailure::InvalidApiKey
    } else if has_any(&[
        "connect",
        "connection",
        "dns",
        "network",
        "unreachable",
        "refused",
        "reset by peer",
    ]) {
        ModelCheckFailure::ConnectionError
    } else {
        ModelCheckFailure::Unknown
    }
}

/// Marks malformed calls so they land in the invalid bucket at finalization.
pub fn validate_tool_call(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: serde_json::Value,
) -> ToolCallRecord {
    let name = name.into();
    let (arguments, error) = match arguments {
        serde_json::Value::String(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(parsed @ serde_json::Value::Object(_)) => (parsed, None),
            Ok(_) | Err(_) => (
                serde_json::Value::String(raw),
                Some("tool arguments are not a JSON object".to_string()),
            ),
        },
        object @ serde_json::Value::Object(_) => (object, None),
        serde_json::Value::Null => (serde_json::Value::Object(Default::default()), None),
        other => (other, Some("tool arguments are not a JSON object".to_string())),
    };

    let error = if name.trim().is_empty() {
        Some("tool call has no name".to_string())
    } else {
        error
    };

    ToolCallRecord {
        id: id.into(),
        name,
        arguments,
        error,
    }
}
