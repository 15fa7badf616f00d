//! # grounded-engine
//!
//! Exchange orchestration on top of `grounded-core` and `grounded-llm`.
//!
//! - **Accumulator**: rebuilds tool calls from streamed fragments
//! - **Executor**: runs a batch of tool calls locally or via a remote endpoint
//! - **Coordinator**: drives a managed agent run through `requires_action` to a terminal state
//! - **Citations**: normalizes tool payloads into labelled sources and renders them
//! - **Orchestrator**: one exchange end to end, streaming or blocking
//!
//! ## Crate Position
//!
//! Depends on: grounded-core, grounded-llm.
//! Depended on by: the `grounded` binary.

#![deny(unsafe_code)]

pub mod accumulator;
pub mod cache;
pub mod citations;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod tools;

pub use accumulator::{parse_raw_calls, MalformedToolCall, ToolCallAccumulator};
pub use cache::AgentCache;
pub use citations::{render, Citation, CitationKind, CitationNormalizer};
pub use coordinator::{AgentRunCoordinator, CompletedRun};
pub use error::{ExchangeStatus, OrchestratorError};
pub use executor::{LocalToolExecutor, RemoteToolExecutor, ToolExecutor};
pub use orchestrator::{CompletionOutcome, ConversationOrchestrator, ExchangeReport, StreamChunk};
pub use registry::ToolRegistry;
pub use tools::create_default_registry;
