// ABOUTME: Agent layer for handbox: provider adapters and registry, the capability catalog, and strategies.
// ABOUTME: Strategies (router, planner, executor, ReAct, collaboration, critic) are exposed as agent.* capabilities.

pub mod builtin;
pub mod capability;
pub mod collaboration;
pub mod config;
pub mod critic;
pub mod engine;
pub mod executor;
pub mod llm;
pub mod planner;
pub mod providers;
pub mod react;
pub mod registry;
pub mod router;
pub mod testing;

pub use builtin::{AgentKind, register_builtins};
pub use capability::{
    CapabilityCategory, CapabilityDefinition, CapabilityExecutor, CapabilityMap,
    CapabilityOutcome, CapabilityRegistry, CapabilitySchema,
};
pub use collaboration::{Collaboration, CollaborationConfig, CollaborationOutcome, Collaborator, Consensus};
pub use config::{ConfigError, HandboxConfig};
pub use critic::{Critic, CriticConfig, Critique};
pub use engine::Engine;
pub use executor::{ExecutionPolicy, ExecutionReport, ExecutorConfig, TaskExecutor};
pub use llm::{ModelSettings, invoke_model};
pub use planner::{Planner, PlannerConfig};
pub use react::{ReactAgent, ReactConfig, ReactOutcome, ReactState};
pub use registry::{ProviderRegistry, RegistryEvent};
pub use router::{Route, RouteDecision, RouteMethod, Router, RouterConfig};
