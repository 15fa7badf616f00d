//! Provider-facing plumbing: SSE framing, the normalized token stream reader,
//! an OpenAI-compatible chat client, an Assistants-style agent client, and
//! scripted mocks for tests.

pub mod assistants;
pub mod client;
pub mod converter;
pub mod reader;
pub mod sse;

pub mod mock;
pub mod mock_agent;

pub use assistants::AssistantsClient;
pub use client::OpenAiChatProvider;
pub use mock::{MockChunk, MockProvider, MockResponse};
pub use mock_agent::{MockAgentService, MockRunState};
pub use reader::TokenStreamReader;
