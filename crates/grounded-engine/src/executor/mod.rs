//! Tool execution. Every call in a batch yields exactly one [`ToolResult`],
//! in the order the calls were given; failures never escape as errors.

mod local;
mod remote;

pub use local::LocalToolExecutor;
pub use remote::RemoteToolExecutor;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use grounded_core::tools::{ToolCall, ToolDefinition, ToolResult};

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run `calls` concurrently. One failing call produces an error result
    /// for that call only. Cancelling `cancel` turns unfinished calls into
    /// `cancelled` error results.
    async fn execute(&self, calls: Vec<ToolCall>, cancel: &CancellationToken) -> Vec<ToolResult>;
}
