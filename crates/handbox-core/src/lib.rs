// ABOUTME: Core library for handbox, containing the data model shared by every agent strategy.
// ABOUTME: Defines the provider contract, errors, plans, transcripts, structured extraction and memory.

pub mod clock;
pub mod context;
pub mod error;
pub mod extract;
pub mod memory;
pub mod plan;
pub mod provider;
pub mod transcript;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::ExecutionContext;
pub use error::{HandboxError, MalformedModelOutput, ProviderError, TaskStateError};
pub use extract::{extract_structured, extract_typed, value_to_text};
pub use memory::{MemoryConfig, MemoryEntry, MemoryStore};
pub use plan::{Plan, Task, TaskStatus};
pub use provider::{
    ConnectionState, Credentials, EmbedRequest, EmbedResponse, ImageInput, InvokeRequest,
    InvokeResponse, Provider, ProviderCategory, ProviderDescriptor, ToolCall, ToolSpec, Usage,
};
pub use transcript::{AgentMessage, AgentTurn, Round};
