//! Business logic services for the LLM gateway.
//!
//! This module contains the request pipeline: provider pools, the provider
//! capability trait, micro-batching and the orchestrator tying them together.

pub mod batch_processor;
pub mod connection_pool;
pub mod orchestrator;
pub mod provider;

// Re-export commonly used types
pub use batch_processor::BatchProcessor;
pub use connection_pool::{ConnectionPool, ConnectionPools, PoolStats, PooledHandle, ProviderHandle};
pub use orchestrator::{RequestOrchestrator, SchemaSource, StructuredCompletion, StructuredRequest};
pub use provider::{
    Completion, GenerationParams, GenerationRequest, LlmProvider, ModelInfo, OpenAiProvider,
    ProviderRegistry, TokenUsage,
};
