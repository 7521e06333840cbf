// ABOUTME: ReAct loop: think, act through a capability, observe, repeat until FINISH or the budget ends.
// ABOUTME: Replies are parsed as a versioned JSON step first, falling back to Thought/Action regexes.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use handbox_core::{
    AgentTurn, ExecutionContext, HandboxError, MemoryStore, ToolSpec, extract_structured,
    value_to_text,
};

use crate::capability::{CapabilityMap, CapabilityRegistry};
use crate::llm::{ModelSettings, invoke_model};
use crate::registry::ProviderRegistry;

pub const FINISH_ACTION: &str = "FINISH";
const STEP_SCHEMA_VERSION: u64 = 1;
const DEFAULT_MAX_ITERATIONS: u32 = 5;
const MAX_OBSERVATION_CHARS: usize = 4000;

static THOUGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)Thought\s*:\s*(.*?)\s*(?:\n\s*Action\s*(?:Input\s*)?:|\z)")
        .expect("thought pattern is valid")
});
static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Action\s*:\s*([^\n]*)").expect("action pattern is valid"));
static ACTION_INPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)Action\s*Input\s*:\s*(.*?)\s*(?:\n\s*(?:Observation|Thought)\s*:|\z)")
        .expect("action input pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactConfig {
    pub max_iterations: u32,
    /// Upper bound on tool executions across the run; unlimited when absent.
    pub max_tool_calls: Option<u32>,
    /// Capability names the agent may call; every registered one when empty.
    pub tools: Vec<String>,
    pub system_prompt: Option<String>,
    /// When set, each turn is written to memory under this namespace.
    pub memory_namespace: Option<String>,
    #[serde(flatten)]
    pub llm: ModelSettings,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tool_calls: None,
            tools: Vec::new(),
            system_prompt: None,
            memory_namespace: None,
            llm: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactState {
    Thinking,
    Acting,
    Observing,
    Finished,
    IterationExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactOutcome {
    pub answer: Option<String>,
    /// True only when the model chose FINISH within the budget.
    pub achieved: bool,
    pub total_iterations: u32,
    pub tool_calls: u32,
    pub final_state: ReactState,
    pub turns: Vec<AgentTurn>,
}

/// One parsed model reply. Missing parts are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactStep {
    pub thought: String,
    pub action: String,
    pub action_input: String,
}

impl ReactStep {
    pub fn is_finish(&self) -> bool {
        self.action.eq_ignore_ascii_case(FINISH_ACTION)
    }
}

/// Parse a reply: the versioned JSON step when the reply is one, otherwise the
/// three independent `Thought:` / `Action:` / `Action Input:` patterns.
pub fn parse_step(text: &str) -> ReactStep {
    if let Some(step) = parse_json_step(text) {
        return step;
    }

    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default()
    };
    ReactStep {
        thought: capture(&THOUGHT_RE),
        action: clean_action(&capture(&ACTION_RE)),
        action_input: capture(&ACTION_INPUT_RE),
    }
}

/// The JSON step counts only when it is the whole reply, or a fenced block
/// in a reply with no `Action:` line. JSON inside an `Action Input:` is not
/// a step.
fn parse_json_step(text: &str) -> Option<ReactStep> {
    let value = match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => value,
        Err(_) if text.contains("```") && !ACTION_RE.is_match(text) => {
            extract_structured(text).ok()?
        }
        Err(_) => return None,
    };
    let fields = value.as_object()?;
    let action = fields.get("action")?.as_str()?;
    match fields.get("version").and_then(Value::as_u64) {
        None | Some(STEP_SCHEMA_VERSION) => {}
        Some(other) => {
            tracing::debug!(version = other, "unknown step schema version, using text parser");
            return None;
        }
    }

    let action_input = match fields.get("action_input") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    Some(ReactStep {
        thought: fields
            .get("thought")
            .map(value_to_text)
            .unwrap_or_default(),
        action: clean_action(action),
        action_input,
    })
}

fn clean_action(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '*' | '[' | ']'))
        .trim()
        .to_string()
}

/// Turn an action input string into a capability input map. JSON objects
/// are used as-is; anything else is wrapped as `{"input": ...}`.
pub fn action_input_map(raw: &str) -> CapabilityMap {
    match extract_structured(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => Map::from_iter([("input".to_string(), other)]),
        Err(_) => Map::from_iter([("input".to_string(), json!(raw))]),
    }
}

pub struct ReactAgent {
    config: ReactConfig,
    memory: Option<Arc<MemoryStore>>,
}

impl ReactAgent {
    pub fn new(config: ReactConfig) -> Self {
        Self {
            config,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Run the loop. Provider failures abort the run; running out of
    /// iterations does not and is reported through `achieved`.
    pub async fn run(
        &self,
        providers: &ProviderRegistry,
        tools: Option<&CapabilityRegistry>,
        ctx: &ExecutionContext,
        goal: &str,
    ) -> Result<ReactOutcome, HandboxError> {
        if goal.trim().is_empty() {
            return Err(HandboxError::InvalidInput("goal must not be empty".to_string()));
        }

        let specs = tools
            .map(|t| t.tool_specs(&self.config.tools))
            .unwrap_or_default();
        let system = self.system_prompt(&specs);
        let mut scratchpad: Vec<String> = Vec::new();
        let mut turns: Vec<AgentTurn> = Vec::new();
        let mut tool_calls = 0u32;

        for iteration in 1..=self.config.max_iterations {
            tracing::debug!(trace_id = %ctx.trace_id, iteration, state = ?ReactState::Thinking, "react step");
            let request = self
                .config
                .llm
                .request(Some(system.clone()), user_prompt(goal, &scratchpad));
            let response = invoke_model(providers, ctx, &self.config.llm, request).await?;
            let step = parse_step(&response.text);

            if step.is_finish() {
                let answer = if step.action_input.is_empty() {
                    step.thought.clone()
                } else {
                    step.action_input.clone()
                };
                let turn = AgentTurn {
                    iteration,
                    thought: step.thought,
                    action: step.action,
                    action_input: step.action_input,
                    observation: None,
                };
                self.remember(ctx, &turn);
                turns.push(turn);
                tracing::info!(trace_id = %ctx.trace_id, iterations = iteration, tool_calls, "react finished");
                return Ok(ReactOutcome {
                    answer: Some(answer),
                    achieved: true,
                    total_iterations: iteration,
                    tool_calls,
                    final_state: ReactState::Finished,
                    turns,
                });
            }

            tracing::debug!(trace_id = %ctx.trace_id, iteration, state = ?ReactState::Acting, action = %step.action, "react step");
            let observation = self.act(&step, tools, &specs, ctx, &mut tool_calls).await;
            tracing::debug!(trace_id = %ctx.trace_id, iteration, state = ?ReactState::Observing, "react step");

            scratchpad.push(format!(
                "Thought: {}\nAction: {}\nAction Input: {}\nObservation: {}",
                step.thought, step.action, step.action_input, observation
            ));
            let turn = AgentTurn {
                iteration,
                thought: step.thought,
                action: step.action,
                action_input: step.action_input,
                observation: Some(observation),
            };
            self.remember(ctx, &turn);
            turns.push(turn);
        }

        tracing::warn!(
            trace_id = %ctx.trace_id,
            max_iterations = self.config.max_iterations,
            "react iteration budget exhausted"
        );
        Ok(ReactOutcome {
            answer: turns.last().and_then(|t| t.observation.clone()),
            achieved: false,
            total_iterations: turns.len() as u32,
            tool_calls,
            final_state: ReactState::IterationExhausted,
            turns,
        })
    }

    /// Execute the chosen action and describe what happened. Every problem
    /// becomes an observation the model can react to.
    async fn act(
        &self,
        step: &ReactStep,
        tools: Option<&CapabilityRegistry>,
        specs: &[ToolSpec],
        ctx: &ExecutionContext,
        tool_calls: &mut u32,
    ) -> String {
        if step.action.is_empty() {
            return "No action was given. Reply with a thought, an action and its input, \
                    or use FINISH with the final answer."
                .to_string();
        }
        let Some(registry) = tools else {
            return format!("Action '{}' is unavailable: no tools are configured.", step.action);
        };
        if !specs.iter().any(|s| s.name == step.action) {
            let available: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
            return format!(
                "Unknown action '{}'. Available actions: {}, {}.",
                step.action,
                available.join(", "),
                FINISH_ACTION
            );
        }
        if let Some(limit) = self.config.max_tool_calls
            && *tool_calls >= limit
        {
            return format!(
                "Tool call budget of {} is used up. Use {} with your best answer.",
                limit, FINISH_ACTION
            );
        }

        *tool_calls += 1;
        let input = action_input_map(&step.action_input);
        match registry
            .execute(&step.action, &input, &CapabilityMap::new(), &ctx.child())
            .await
        {
            Ok(output) => truncate(value_to_text(&Value::Object(output))),
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id, action = %step.action, error = %e, "tool call failed");
                format!("Error: {}", e)
            }
        }
    }

    fn remember(&self, ctx: &ExecutionContext, turn: &AgentTurn) {
        if let (Some(memory), Some(namespace)) = (&self.memory, &self.config.memory_namespace)
            && let Ok(value) = serde_json::to_value(turn)
        {
            memory.store(
                namespace,
                &format!("{}:turn:{}", ctx.trace_id, turn.iteration),
                value,
            );
        }
    }

    fn system_prompt(&self, specs: &[ToolSpec]) -> String {
        let mut prompt = self.config.system_prompt.clone().unwrap_or_else(|| {
            "You are an agent that solves tasks step by step. In each reply, think about \
             the next step, then choose one action."
                .to_string()
        });
        prompt.push_str("\n\nAvailable actions:\n");
        for spec in specs {
            prompt.push_str(&format!(
                "- {}: {} Input schema: {}\n",
                spec.name, spec.description, spec.parameters
            ));
        }
        prompt.push_str(&format!(
            "- {}: end the task; put the final answer in action_input.\n\n\
             Reply with a single JSON object and nothing else:\n\
             {{\"version\": {}, \"thought\": \"...\", \"action\": \"<action name>\", \"action_input\": ...}}",
            FINISH_ACTION, STEP_SCHEMA_VERSION
        ));
        prompt
    }
}

fn user_prompt(goal: &str, scratchpad: &[String]) -> String {
    if scratchpad.is_empty() {
        format!("Task: {}", goal)
    } else {
        format!("Task: {}\n\n{}", goal, scratchpad.join("\n\n"))
    }
}

fn truncate(mut text: String) -> String {
    if text.chars().count() > MAX_OBSERVATION_CHARS {
        text = text.chars().take(MAX_OBSERVATION_CHARS).collect();
        text.push_str(" [truncated]");
    }
    text
}
