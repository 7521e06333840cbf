// ABOUTME: Built-in capabilities (llm.*, memory.*, agent.*) wired to the registries and memory store.
// ABOUTME: Dispatch is by enum kind; typed configs are deserialised from the plain config maps.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use handbox_core::{
    EmbedRequest, ExecutionContext, HandboxError, ImageInput, MemoryStore, Plan, ProviderCategory,
};

use crate::capability::{
    CapabilityCategory, CapabilityDefinition, CapabilityExecutor, CapabilityMap,
    CapabilityRegistry,
};
use crate::collaboration::{Collaboration, CollaborationConfig};
use crate::critic::{Critic, CriticConfig};
use crate::executor::{ExecutorConfig, TaskExecutor};
use crate::llm::{ModelSettings, invoke_model};
use crate::planner::{Planner, PlannerConfig};
use crate::react::{ReactAgent, ReactConfig};
use crate::registry::ProviderRegistry;
use crate::router::{Router, RouterConfig};

const DEFAULT_NAMESPACE: &str = "default";

/// Register every built-in capability on `capabilities`.
pub fn register_builtins(
    capabilities: &Arc<CapabilityRegistry>,
    providers: &Arc<ProviderRegistry>,
    memory: &Arc<MemoryStore>,
) {
    capabilities.register(
        CapabilityDefinition::new(
            "llm.invoke",
            CapabilityCategory::Llm,
            Arc::new(LlmInvoke {
                providers: providers.clone(),
            }),
        )
        .with_description("Send a prompt to a generative model and return its text.")
        .with_schema(
            json!({"type": "object", "required": ["prompt"], "properties": {
                "prompt": {"type": "string"},
                "system_prompt": {"type": "string"},
                "images": {"type": "array"}
            }}),
            model_settings_schema(),
            json!({"type": "object", "properties": {"text": {"type": "string"}, "usage": {"type": "object"}}}),
        ),
    );

    capabilities.register(
        CapabilityDefinition::new(
            "llm.embed",
            CapabilityCategory::Embedding,
            Arc::new(LlmEmbed {
                providers: providers.clone(),
            }),
        )
        .with_description("Embed one or more texts with an embedding model.")
        .with_schema(
            json!({"type": "object", "properties": {
                "texts": {"type": "array", "items": {"type": "string"}},
                "text": {"type": "string"}
            }}),
            model_settings_schema(),
            json!({"type": "object", "properties": {"embeddings": {"type": "array"}, "dimension": {"type": "integer"}}}),
        ),
    );

    for (op, description) in [
        (MemoryOp::Store, "Store a value under a key in agent memory."),
        (MemoryOp::Retrieve, "Retrieve a value by key from agent memory."),
        (MemoryOp::Search, "Search agent memory keys and values for a substring."),
        (MemoryOp::Clear, "Remove one key, or a whole namespace, from agent memory."),
    ] {
        capabilities.register(
            CapabilityDefinition::new(
                op.capability_name(),
                CapabilityCategory::Memory,
                Arc::new(MemoryCapability {
                    memory: memory.clone(),
                    op,
                }),
            )
            .with_description(description)
            .with_schema(op.input_schema(), json!({"type": "object"}), json!({"type": "object"})),
        );
    }

    for kind in [
        AgentKind::Route,
        AgentKind::Plan,
        AgentKind::ExecutePlan,
        AgentKind::React,
        AgentKind::Collaborate,
        AgentKind::Critic,
    ] {
        capabilities.register(
            CapabilityDefinition::new(
                kind.capability_name(),
                CapabilityCategory::Agent,
                Arc::new(AgentCapability {
                    kind,
                    providers: providers.clone(),
                    capabilities: Arc::downgrade(capabilities),
                    memory: memory.clone(),
                }),
            )
            .with_description(kind.description())
            .with_schema(kind.input_schema(), json!({"type": "object"}), json!({"type": "object"})),
        );
    }

    tracing::debug!(count = capabilities.names(None).len(), "built-in capabilities registered");
}

fn model_settings_schema() -> Value {
    json!({"type": "object", "properties": {
        "provider": {"type": "string"},
        "model": {"type": "string"},
        "temperature": {"type": "number"},
        "max_tokens": {"type": "integer"}
    }})
}

fn parse_config<T: DeserializeOwned>(config: &CapabilityMap) -> Result<T, HandboxError> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| HandboxError::InvalidConfig(e.to_string()))
}

fn to_output<T: Serialize>(value: &T) -> Result<CapabilityMap, HandboxError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Ok(CapabilityMap::from_iter([("result".to_string(), other)])),
        Err(e) => Err(HandboxError::Capability(e.to_string())),
    }
}

/// First non-empty string among `keys`, or `InvalidInput` naming the first key.
fn required_text(input: &CapabilityMap, keys: &[&str]) -> Result<String, HandboxError> {
    optional_text(input, keys).ok_or_else(|| {
        HandboxError::InvalidInput(format!("missing required input '{}'", keys[0]))
    })
}

fn optional_text(input: &CapabilityMap, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

struct LlmInvoke {
    providers: Arc<ProviderRegistry>,
}

#[async_trait]
impl CapabilityExecutor for LlmInvoke {
    async fn execute(
        &self,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        let settings: ModelSettings = parse_config(config)?;
        let prompt = required_text(input, &["prompt", "input", "task"])?;
        let mut request = settings.request(optional_text(input, &["system_prompt"]), prompt);
        if let Some(images) = input.get("images") {
            request.images = serde_json::from_value::<Vec<ImageInput>>(images.clone())
                .map_err(|e| HandboxError::InvalidInput(format!("images: {}", e)))?;
        }

        let response = invoke_model(&self.providers, ctx, &settings, request).await?;
        to_output(&response)
    }
}

struct LlmEmbed {
    providers: Arc<ProviderRegistry>,
}

#[async_trait]
impl CapabilityExecutor for LlmEmbed {
    async fn execute(
        &self,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        let settings: ModelSettings = parse_config(config)?;
        let texts: Vec<String> = match input.get("texts") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        HandboxError::InvalidInput("texts must be strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => vec![required_text(input, &["text", "input"])?],
        };

        let provider =
            self.providers
                .resolve(ctx, ProviderCategory::Embedding, settings.provider.as_deref())?;
        tracing::debug!(trace_id = %ctx.trace_id, provider = provider.id(), texts = texts.len(), "embedding");
        let response = provider
            .embed(&EmbedRequest {
                texts,
                model: settings.model,
            })
            .await?;
        to_output(&response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryOp {
    Store,
    Retrieve,
    Search,
    Clear,
}

impl MemoryOp {
    fn capability_name(self) -> &'static str {
        match self {
            MemoryOp::Store => "memory.store",
            MemoryOp::Retrieve => "memory.retrieve",
            MemoryOp::Search => "memory.search",
            MemoryOp::Clear => "memory.clear",
        }
    }

    fn input_schema(self) -> Value {
        let required: &[&str] = match self {
            MemoryOp::Store => &["key", "value"],
            MemoryOp::Retrieve => &["key"],
            MemoryOp::Search => &["query"],
            MemoryOp::Clear => &[],
        };
        json!({"type": "object", "required": required, "properties": {
            "namespace": {"type": "string"},
            "key": {"type": "string"},
            "value": {},
            "query": {"type": "string"}
        }})
    }
}

struct MemoryCapability {
    memory: Arc<MemoryStore>,
    op: MemoryOp,
}

#[async_trait]
impl CapabilityExecutor for MemoryCapability {
    async fn execute(
        &self,
        input: &CapabilityMap,
        _config: &CapabilityMap,
        _ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        let namespace = optional_text(input, &["namespace"]);
        let scoped = namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);

        let output = match self.op {
            MemoryOp::Store => {
                let key = required_text(input, &["key"])?;
                let value = input
                    .get("value")
                    .cloned()
                    .ok_or_else(|| HandboxError::InvalidInput("missing required input 'value'".to_string()))?;
                self.memory.store(scoped, &key, value);
                json!({"stored": true, "namespace": scoped, "key": key})
            }
            MemoryOp::Retrieve => {
                let key = required_text(input, &["key"])?;
                match self.memory.retrieve(scoped, &key) {
                    Some(value) => json!({"found": true, "value": value}),
                    None => json!({"found": false, "value": null}),
                }
            }
            MemoryOp::Search => {
                let query = required_text(input, &["query", "input"])?;
                // Without an explicit namespace, search spans all of them.
                let hits = self.memory.search(namespace.as_deref(), &query);
                json!({"count": hits.len(), "results": hits})
            }
            MemoryOp::Clear => {
                let removed = match namespace.as_deref() {
                    None if optional_text(input, &["key"]).is_none() => self.memory.clear_all(),
                    _ => self
                        .memory
                        .clear(scoped, optional_text(input, &["key"]).as_deref()),
                };
                json!({"removed": removed})
            }
        };
        to_output(&output)
    }
}

/// The finite set of agent strategies exposed as capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Route,
    Plan,
    ExecutePlan,
    React,
    Collaborate,
    Critic,
}

impl AgentKind {
    pub fn capability_name(self) -> &'static str {
        match self {
            AgentKind::Route => "agent.route",
            AgentKind::Plan => "agent.plan",
            AgentKind::ExecutePlan => "agent.execute_plan",
            AgentKind::React => "agent.react",
            AgentKind::Collaborate => "agent.collaborate",
            AgentKind::Critic => "agent.critic",
        }
    }

    fn description(self) -> &'static str {
        match self {
            AgentKind::Route => "Pick the best matching route for an input.",
            AgentKind::Plan => "Break a goal into dependent tasks.",
            AgentKind::ExecutePlan => "Run a plan's tasks under a scheduling policy.",
            AgentKind::React => "Solve a goal with a think/act/observe loop over tools.",
            AgentKind::Collaborate => "Run a multi-agent discussion and synthesise a decision.",
            AgentKind::Critic => "Review content against criteria with scores and suggestions.",
        }
    }

    fn input_schema(self) -> Value {
        let (field, kind) = match self {
            AgentKind::Route => ("input", "string"),
            AgentKind::Plan | AgentKind::React => ("goal", "string"),
            AgentKind::ExecutePlan => ("plan", "object"),
            AgentKind::Collaborate => ("topic", "string"),
            AgentKind::Critic => ("content", "string"),
        };
        let properties = CapabilityMap::from_iter([(field.to_string(), json!({"type": kind}))]);
        json!({"type": "object", "required": [field], "properties": properties})
    }
}

struct AgentCapability {
    kind: AgentKind,
    providers: Arc<ProviderRegistry>,
    capabilities: Weak<CapabilityRegistry>,
    memory: Arc<MemoryStore>,
}

impl AgentCapability {
    fn capabilities(&self) -> Result<Arc<CapabilityRegistry>, HandboxError> {
        self.capabilities
            .upgrade()
            .ok_or_else(|| HandboxError::Capability("capability registry was dropped".to_string()))
    }
}

#[async_trait]
impl CapabilityExecutor for AgentCapability {
    async fn execute(
        &self,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        tracing::debug!(trace_id = %ctx.trace_id, agent = self.kind.capability_name(), depth = ctx.depth, "agent capability");
        match self.kind {
            AgentKind::Route => {
                let text = required_text(input, &["input", "text", "prompt"])?;
                let router = Router::new(parse_config::<RouterConfig>(config)?);
                to_output(&router.route(&self.providers, ctx, &text).await?)
            }
            AgentKind::Plan => {
                let goal = required_text(input, &["goal", "input", "prompt"])?;
                let context = optional_text(input, &["context"]);
                let planner = Planner::new(parse_config::<PlannerConfig>(config)?);
                let plan = planner
                    .plan(&self.providers, ctx, &goal, context.as_deref())
                    .await?;
                Ok(CapabilityMap::from_iter([
                    ("degraded".to_string(), json!(plan.is_degraded())),
                    ("plan".to_string(), serde_json::to_value(&plan).map_err(|e| HandboxError::Capability(e.to_string()))?),
                ]))
            }
            AgentKind::ExecutePlan => {
                let plan_value = input
                    .get("plan")
                    .cloned()
                    .ok_or_else(|| HandboxError::InvalidInput("missing required input 'plan'".to_string()))?;
                let mut plan: Plan = serde_json::from_value(plan_value)
                    .map_err(|e| HandboxError::InvalidInput(format!("plan: {}", e)))?;
                let executor = TaskExecutor::new(parse_config::<ExecutorConfig>(config)?);
                let capabilities = self.capabilities()?;
                let report = executor.execute(&mut plan, &capabilities, &ctx.child()).await?;
                to_output(&report)
            }
            AgentKind::React => {
                let goal = required_text(input, &["goal", "input", "prompt"])?;
                let agent = ReactAgent::new(parse_config::<ReactConfig>(config)?)
                    .with_memory(self.memory.clone());
                let capabilities = self.capabilities()?;
                to_output(&agent.run(&self.providers, Some(&capabilities), ctx, &goal).await?)
            }
            AgentKind::Collaborate => {
                let topic = required_text(input, &["topic", "input", "prompt"])?;
                let collaboration = Collaboration::new(parse_config::<CollaborationConfig>(config)?)?;
                to_output(&collaboration.run(&self.providers, ctx, &topic).await?)
            }
            AgentKind::Critic => {
                let content = input
                    .get("content")
                    .or_else(|| input.get("input"))
                    .cloned()
                    .ok_or_else(|| HandboxError::InvalidInput("missing required input 'content'".to_string()))?;
                let critic = Critic::new(parse_config::<CriticConfig>(config)?);
                to_output(&critic.review(&self.providers, ctx, &content).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use handbox_core::MemoryConfig;

    struct Fixture {
        capabilities: Arc<CapabilityRegistry>,
        providers: Arc<ProviderRegistry>,
        memory: Arc<MemoryStore>,
    }

    fn fixture(provider: ScriptedProvider) -> Fixture {
        let capabilities = Arc::new(CapabilityRegistry::default());
        let providers = Arc::new(ProviderRegistry::new());
        let memory = Arc::new(MemoryStore::new(MemoryConfig::default()));
        providers.register(Arc::new(provider));
        register_builtins(&capabilities, &providers, &memory);
        Fixture {
            capabilities,
            providers,
            memory,
        }
    }

    fn map(value: Value) -> CapabilityMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn all_builtins_are_registered() {
        let f = fixture(ScriptedProvider::always("stub", "ok"));
        let names = f.capabilities.names(None);
        for expected in [
            "llm.invoke",
            "llm.embed",
            "memory.store",
            "memory.retrieve",
            "memory.search",
            "memory.clear",
            "agent.route",
            "agent.plan",
            "agent.execute_plan",
            "agent.react",
            "agent.collaborate",
            "agent.critic",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
        assert_eq!(f.capabilities.names(Some(CapabilityCategory::Agent)).len(), 6);
        assert_eq!(f.providers.list().len(), 1);
    }

    #[tokio::test]
    async fn llm_invoke_returns_text() {
        let f = fixture(ScriptedProvider::always("stub", "hello back"));
        let out = f
            .capabilities
            .execute(
                "llm.invoke",
                &map(json!({"prompt": "hello"})),
                &map(json!({"temperature": 0.2})),
                &ExecutionContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["text"], "hello back");
    }

    #[tokio::test]
    async fn llm_invoke_requires_prompt_and_valid_config() {
        let f = fixture(ScriptedProvider::always("stub", "x"));
        let ctx = ExecutionContext::new();
        let err = f
            .capabilities
            .execute("llm.invoke", &CapabilityMap::new(), &CapabilityMap::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HandboxError::InvalidInput(_)));

        let err = f
            .capabilities
            .execute(
                "llm.invoke",
                &map(json!({"prompt": "hi"})),
                &map(json!({"temperature": "hot"})),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandboxError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn llm_embed_uses_embedding_category() {
        let f = fixture(ScriptedProvider::always("stub", "x"));
        f.providers.register(Arc::new(
            ScriptedProvider::always("embedder", "").with_category(ProviderCategory::Embedding),
        ));
        let out = f
            .capabilities
            .execute(
                "llm.embed",
                &map(json!({"texts": ["one two", "three"]})),
                &CapabilityMap::new(),
                &ExecutionContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["dimension"], 3);
        assert_eq!(out["embeddings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_capabilities_round_trip_through_the_store() {
        let f = fixture(ScriptedProvider::always("stub", "x"));
        let ctx = ExecutionContext::new();
        let none = CapabilityMap::new();

        f.capabilities
            .execute(
                "memory.store",
                &map(json!({"namespace": "s1", "key": "city", "value": "Lisbon"})),
                &none,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(f.memory.retrieve("s1", "city"), Some(json!("Lisbon")));

        let found = f
            .capabilities
            .execute("memory.retrieve", &map(json!({"namespace": "s1", "key": "city"})), &none, &ctx)
            .await
            .unwrap();
        assert_eq!(found["found"], true);

        let hits = f
            .capabilities
            .execute("memory.search", &map(json!({"query": "lisbon"})), &none, &ctx)
            .await
            .unwrap();
        assert_eq!(hits["count"], 1);

        let cleared = f
            .capabilities
            .execute("memory.clear", &map(json!({"namespace": "s1"})), &none, &ctx)
            .await
            .unwrap();
        assert_eq!(cleared["removed"], 1);
        assert!(f.memory.is_empty());
    }

    #[tokio::test]
    async fn react_can_call_other_agents_through_the_registry() {
        let f = fixture(ScriptedProvider::new(
            "stub",
            [
                r#"{"version": 1, "thought": "route it", "action": "agent.route", "action_input": {"input": "refund please"}}"#,
                r#"{"version": 1, "thought": "done", "action": "FINISH", "action_input": "billing"}"#,
            ],
        ));
        let out = f
            .capabilities
            .execute(
                "agent.react",
                &map(json!({"goal": "classify the ticket"})),
                &map(json!({"tools": ["agent.route"]})),
                &ExecutionContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["achieved"], true);
        assert_eq!(out["answer"], "billing");
        // No routes configured for the nested router, so it falls back.
        let observation = out["turns"][0]["observation"].as_str().unwrap();
        assert!(observation.contains("\"method\":\"fallback\""));
    }

    #[tokio::test]
    async fn plan_then_execute_plan() {
        let f = fixture(ScriptedProvider::new(
            "stub",
            [
                r#"{"tasks": [{"id": "1", "name": "Draft"}, {"id": "2", "name": "Polish", "dependencies": ["1"]}]}"#,
                "draft text",
                "polished text",
            ],
        ));
        let ctx = ExecutionContext::new();
        let planned = f
            .capabilities
            .execute("agent.plan", &map(json!({"goal": "write a memo"})), &CapabilityMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(planned["degraded"], false);

        let report = f
            .capabilities
            .execute(
                "agent.execute_plan",
                &map(json!({"plan": planned["plan"].clone()})),
                &map(json!({"policy": "dependency"})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(report["status"]["completed"], 2);
        assert_eq!(report["results"][1]["output"]["text"], "polished text");
    }

    #[tokio::test]
    async fn agent_recursion_is_bounded() {
        let capabilities = Arc::new(CapabilityRegistry::new(1));
        let providers = Arc::new(ProviderRegistry::new());
        let memory = Arc::new(MemoryStore::new(MemoryConfig::default()));
        providers.register(Arc::new(ScriptedProvider::always(
            "stub",
            r#"{"version": 1, "thought": "again", "action": "agent.react", "action_input": {"goal": "recurse"}}"#,
        )));
        register_builtins(&capabilities, &providers, &memory);

        let out = capabilities
            .invoke(
                "agent.react",
                &map(json!({"goal": "recurse"})),
                &map(json!({"max_iterations": 1})),
                &ExecutionContext::new(),
            )
            .await;
        // The nested run is refused one level down and sees that as an observation.
        assert!(out.success);
        let text = serde_json::to_string(&out.output).unwrap();
        assert!(text.contains("agent call depth 2 exceeds"));
    }
}
