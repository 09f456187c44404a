//! Model Cluster Common Types
//!
//! Shared types used by worker hosts, the controller and the API gateway.

pub mod chat;
pub mod instance;
pub mod output;
pub mod protocol;

pub use instance::{InstanceKey, ModelInstance, WorkerType};
pub use output::{
    error_code, ErrorBody, ErrorDetail, FinishReason, ModelMetadata, ModelOutput, ModelUsage,
    ParameterDescription,
};
pub use protocol::{
    ApplyOutput, ApplyType, EmbeddingsRequest, InstanceRef, ModelMessage, PromptRequest,
    WorkerApplyOutput, WorkerApplyRequest, WorkerParams, WorkerStartupRequest,
};
