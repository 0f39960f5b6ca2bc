mod adapter;
mod normalizer;
mod registry;
mod rig_adapter;

pub use adapter::{
    AdapterError, AdapterResult, AdapterStreamHandle, AdapterWorker, BackendConfig, BoxFuture,
    ChunkStream, HistoryMessage, MODEL_CHECK_TIMEOUT, ModelAdapter, ModelCheck, ModelCheckFailure,
    StopSignal, ToolSpec, check_model, classify_failure, make_chunk_stream, model_check_history,
    validate_tool_call,
};
pub use normalizer::{ChunkAccumulator, RawChunk, aggregate_usage, fold_chunk, fold_chunks};
pub use registry::{AdapterFactory, BackendRegistry};
pub use rig_adapter::{ANTHROPIC_BACKEND_ID, BackendKind, OPENAI_BACKEND_ID, RigAdapter};
