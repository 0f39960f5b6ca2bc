use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::{Stream, StreamExt};
use murmur_storage::{MessageRole, ToolCallRecord};
use rig::completion::{
    AssistantContent, CompletionError, CompletionModel, GetTokenUsage, Message as RigMessage,
    ToolDefinition,
};
use rig::prelude::CompletionClient;
use rig::providers::{anthropic, openai};
use rig::streaming::StreamedAssistantContent;
use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::mpsc;

use super::adapter::{
    AdapterError, AdapterResult, AdapterStreamHandle, AdapterWorker, BackendConfig, BoxFuture,
    CompletionsFailedSnafu, EmptyMessageSetSnafu, EmptyResponseSnafu, HistoryMessage,
    HttpClientSnafu, MODEL_CHECK_TIMEOUT, MissingApiKeySnafu, MissingModelSnafu, ModelAdapter,
    ModelCheck, NotInitializedSnafu, StopSignal, ToolSpec, check_model, make_chunk_stream,
    model_check_history, validate_tool_call,
};
use super::normalizer::RawChunk;

pub const OPENAI_BACKEND_ID: &str = "openai";
pub const ANTHROPIC_BACKEND_ID: &str = "anthropic";

// Anthropic rejects requests without an explicit output cap.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    OpenAi,
    Anthropic,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [Self::OpenAi, Self::Anthropic];

    pub fn id(&self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BACKEND_ID,
            Self::Anthropic => ANTHROPIC_BACKEND_ID,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id().eq_ignore_ascii_case(value.trim()))
    }
}

/// Settings resolved by `initialize`; every request is built from this snapshot.
#[derive(Debug, Clone)]
struct PreparedSession {
    config: BackendConfig,
    tools: Vec<ToolDefinition>,
}

pub struct RigAdapter {
    kind: BackendKind,
    session: Option<PreparedSession>,
    last_tool_calls: Arc<ArcSwap<Vec<ToolCallRecord>>>,
}

impl RigAdapter {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            session: None,
            last_tool_calls: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    fn prepared(&self, stage: &'static str) -> AdapterResult<&PreparedSession> {
        self.session.as_ref().context(NotInitializedSnafu {
            stage,
            backend_id: self.kind.id().to_string(),
        })
    }

    fn openai_client(config: &BackendConfig) -> AdapterResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-openai-client",
        })
    }

    fn anthropic_client(config: &BackendConfig) -> AdapterResult<anthropic::Client> {
        let mut builder = anthropic::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-anthropic-client",
        })
    }

    /// Invalid tool schemas are dropped with a warning; the session stays usable.
    fn bind_tools(backend_id: &str, tools: &[ToolSpec]) -> Vec<ToolDefinition> {
        tools
            .iter()
            .filter_map(|tool| {
                if tool.name.trim().is_empty() {
                    tracing::warn!(backend_id, "dropping tool without a name");
                    return None;
                }

                let parameters = match &tool.parameters {
                    Value::Null => json!({"type": "object", "properties": {}}),
                    schema @ Value::Object(_) => schema.clone(),
                    other => {
                        tracing::warn!(
                            backend_id,
                            tool = %tool.name,
                            schema_kind = json_kind(other),
                            "dropping tool whose parameters are not a JSON schema object"
                        );
                        return None;
                    }
                };

                Some(ToolDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters,
                })
            })
            .collect()
    }

    fn to_rig_message(message: &HistoryMessage) -> Option<RigMessage> {
        match message.role {
            MessageRole::System => None,
            MessageRole::User => Some(RigMessage::user(message.content.clone())),
            MessageRole::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(config: &BackendConfig, history: &[HistoryMessage]) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &config.system_prompt
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble, so system turns are folded into it.
        for message in history {
            if matches!(message.role, MessageRole::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    fn build_request<M: CompletionModel>(
        model: &M,
        kind: BackendKind,
        session: &PreparedSession,
        history: &[HistoryMessage],
    ) -> AdapterResult<rig::completion::CompletionRequestBuilder<M>> {
        let mut messages = history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                backend_id = kind.id(),
                model = %session.config.model,
                total_message_count = history.len(),
                "cannot build request because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "build-request-filter-messages",
            }
            .fail();
        };

        let config = &session.config;
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(config, history) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }

        match (config.max_tokens, kind) {
            (Some(max_tokens), _) => builder = builder.max_tokens(max_tokens),
            (None, BackendKind::Anthropic) => {
                builder = builder.max_tokens(ANTHROPIC_DEFAULT_MAX_TOKENS)
            }
            (None, BackendKind::OpenAi) => {}
        }

        if let Some(top_p) = config.top_p {
            builder = builder.additional_params(json!({ "top_p": top_p }));
        }

        if !session.tools.is_empty() {
            builder = builder.tools(session.tools.clone());
        }

        Ok(builder)
    }

    async fn complete<M: CompletionModel>(
        model: M,
        kind: BackendKind,
        session: PreparedSession,
        history: Vec<HistoryMessage>,
        tool_calls: Arc<ArcSwap<Vec<ToolCallRecord>>>,
    ) -> AdapterResult<String> {
        let builder = Self::build_request(&model, kind, &session, &history)?;
        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "chat-send",
        })?;

        let mut text = String::new();
        let mut calls = Vec::new();
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(part) => text.push_str(&part.text),
                AssistantContent::ToolCall(call) => calls.push(validate_tool_call(
                    call.id.clone(),
                    call.function.name.clone(),
                    call.function.arguments.clone(),
                )),
                _ => {}
            }
        }
        tool_calls.store(Arc::new(calls));

        Ok(text)
    }

    fn send_chunk(
        chunk_tx: &mpsc::UnboundedSender<AdapterResult<RawChunk>>,
        chunk: RawChunk,
    ) -> bool {
        chunk_tx.send(Ok(chunk)).is_ok()
    }

    fn emit_error(chunk_tx: &mpsc::UnboundedSender<AdapterResult<RawChunk>>, error: AdapterError) {
        let _ = chunk_tx.send(Err(error));
    }

    /// Maps one rig item to a vendor-shaped raw chunk. Tool calls are recorded
    /// on the side and produce no chunk.
    fn map_stream_item<R>(
        item: StreamedAssistantContent<R>,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> Option<RawChunk>
    where
        R: Clone + Unpin + GetTokenUsage,
    {
        match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                Some(json!({ "content": text.text }))
            }
            StreamedAssistantContent::Reasoning(reasoning) => {
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                Some(json!({ "additional_kwargs": { "reasoning_content": text } }))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                Some(json!({ "additional_kwargs": { "reasoning_content": reasoning } }))
            }
            StreamedAssistantContent::ToolCall { tool_call, .. } => {
                tool_calls.push(validate_tool_call(
                    tool_call.id,
                    tool_call.function.name,
                    tool_call.function.arguments,
                ));
                None
            }
            StreamedAssistantContent::Final(response) => {
                let usage = response.token_usage()?;
                Some(json!({
                    "usage_metadata": {
                        "input_tokens": usage.input_tokens,
                        "output_tokens": usage.output_tokens,
                        "total_tokens": usage.total_tokens,
                    }
                }))
            }
            StreamedAssistantContent::ToolCallDelta { .. } => None,
        }
    }

    async fn run_stream_worker<M: CompletionModel>(
        model: M,
        kind: BackendKind,
        session: PreparedSession,
        history: Vec<HistoryMessage>,
        stop: StopSignal,
        chunk_tx: mpsc::UnboundedSender<AdapterResult<RawChunk>>,
        tool_calls_slot: Arc<ArcSwap<Vec<ToolCallRecord>>>,
    ) {
        let opened = match Self::build_request(&model, kind, &session, &history) {
            Ok(builder) => builder.stream().await.context(CompletionsFailedSnafu {
                stage: "open-stream",
            }),
            Err(error) => Err(error),
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    backend_id = kind.id(),
                    model = %session.config.model,
                    error = %error,
                    "failed to open backend stream"
                );
                Self::emit_error(&chunk_tx, error);
                return;
            }
        };

        Self::pump_stream(stream, kind, &stop, &chunk_tx, &tool_calls_slot).await;
    }

    /// Forwards rig stream items as raw chunks until the stream ends, fails or
    /// the stop signal is seen. Each tool call is published to `tool_calls_slot`
    /// as soon as it arrives, so an aborted worker never loses recorded calls.
    async fn pump_stream<S, R>(
        mut stream: S,
        kind: BackendKind,
        stop: &StopSignal,
        chunk_tx: &mpsc::UnboundedSender<AdapterResult<RawChunk>>,
        tool_calls_slot: &ArcSwap<Vec<ToolCallRecord>>,
    ) where
        S: Stream<Item = Result<StreamedAssistantContent<R>, CompletionError>> + Unpin,
        R: Clone + Unpin + GetTokenUsage,
    {
        let mut tool_calls = Vec::new();
        let mut produced_content = false;
        let mut failed = false;

        while let Some(item) = stream.next().await {
            if stop.is_cancelled() {
                tracing::debug!(backend_id = kind.id(), "backend stream cancelled");
                break;
            }

            match item {
                Ok(item) => {
                    let calls_before = tool_calls.len();
                    let chunk = Self::map_stream_item(item, &mut tool_calls);
                    if tool_calls.len() > calls_before {
                        produced_content = true;
                        tool_calls_slot.store(Arc::new(tool_calls.clone()));
                    }
                    let Some(chunk) = chunk else {
                        continue;
                    };
                    produced_content |= chunk.get("usage_metadata").is_none();
                    if !Self::send_chunk(chunk_tx, chunk) {
                        break;
                    }
                }
                Err(source) => {
                    failed = true;
                    tracing::warn!(
                        backend_id = kind.id(),
                        error = %source,
                        "backend stream emitted an error chunk"
                    );
                    Self::emit_error(
                        chunk_tx,
                        AdapterError::CompletionsFailed {
                            stage: "stream-chunk",
                            source,
                        },
                    );
                    break;
                }
            }
        }

        if !produced_content && !failed && !stop.is_cancelled() {
            Self::emit_error(
                chunk_tx,
                EmptyResponseSnafu {
                    stage: "stream-finished",
                }
                .build(),
            );
        }
    }
}

impl ModelAdapter for RigAdapter {
    fn backend_id(&self) -> &str {
        self.kind.id()
    }

    fn initialize(&mut self, config: BackendConfig) -> AdapterResult<()> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "initialize",
                backend_id: self.kind.id().to_string(),
            }
        );
        ensure!(
            !config.model.is_empty(),
            MissingModelSnafu {
                stage: "initialize",
                backend_id: self.kind.id().to_string(),
            }
        );

        // Fail fast on a malformed endpoint instead of on first send.
        match self.kind {
            BackendKind::OpenAi => {
                Self::openai_client(&config)?;
            }
            BackendKind::Anthropic => {
                Self::anthropic_client(&config)?;
            }
        }

        let tools = Self::bind_tools(self.kind.id(), &config.tools);
        tracing::debug!(
            backend_id = self.kind.id(),
            model = %config.model,
            bound_tools = tools.len(),
            requested_tools = config.tools.len(),
            streaming = config.streaming,
            "backend adapter initialized"
        );

        self.session = Some(PreparedSession { config, tools });
        Ok(())
    }

    fn chat<'a>(&'a self, history: Vec<HistoryMessage>) -> BoxFuture<'a, AdapterResult<String>> {
        Box::pin(async move {
            let session = self.prepared("chat")?.clone();
            let tool_calls = self.last_tool_calls.clone();
            let model_name = session.config.model.clone();

            match self.kind {
                BackendKind::OpenAi => {
                    let model =
                        Self::openai_client(&session.config)?.completion_model(model_name);
                    Self::complete(model, self.kind, session, history, tool_calls).await
                }
                BackendKind::Anthropic => {
                    let model =
                        Self::anthropic_client(&session.config)?.completion_model(model_name);
                    Self::complete(model, self.kind, session, history, tool_calls).await
                }
            }
        })
    }

    fn stream(
        &self,
        history: Vec<HistoryMessage>,
        stop: StopSignal,
    ) -> AdapterResult<AdapterStreamHandle> {
        let session = self.prepared("stream")?.clone();
        ensure!(
            !history.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-validate"
            }
        );

        self.last_tool_calls.store(Arc::new(Vec::new()));
        let (chunk_tx, chunks) = make_chunk_stream();
        let slot = self.last_tool_calls.clone();
        let model_name = session.config.model.clone();

        let worker: AdapterWorker = match self.kind {
            BackendKind::OpenAi => {
                let model = Self::openai_client(&session.config)?.completion_model(model_name);
                Box::pin(Self::run_stream_worker(
                    model, self.kind, session, history, stop, chunk_tx, slot,
                ))
            }
            BackendKind::Anthropic => {
                let model = Self::anthropic_client(&session.config)?.completion_model(model_name);
                Box::pin(Self::run_stream_worker(
                    model, self.kind, session, history, stop, chunk_tx, slot,
                ))
            }
        };

        Ok(AdapterStreamHandle { chunks, worker })
    }

    fn test_model<'a>(&'a self) -> BoxFuture<'a, ModelCheck> {
        Box::pin(async move { check_model(self.chat(model_check_history()), MODEL_CHECK_TIMEOUT).await })
    }

    fn last_tool_calls(&self) -> Vec<ToolCallRecord> {
        self.last_tool_calls.load().as_ref().clone()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
