#![allow(clippy::missing_docs_in_private_items)]

pub mod ai_gateway;
pub mod chunking_pipeline;
pub mod circuit_breaker;
pub mod providers;
pub mod queue;
pub mod rate_limiter;
pub mod workers;

pub use ai_gateway::AiGateway;
pub use chunking_pipeline::ChunkingPipeline;
pub use queue::{IngestionQueue, JobProcessor, ProcessorOutcome, QueueEvent};
