// ABOUTME: Single-call planner that asks the model for a task decomposition with dependencies.
// ABOUTME: Unparseable answers yield a degraded plan carrying the raw text instead of an error.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use handbox_core::{ExecutionContext, HandboxError, Plan, Task, extract_structured};

use crate::llm::{ModelSettings, invoke_model};
use crate::registry::ProviderRegistry;

const DEFAULT_MAX_TASKS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_tasks: usize,
    pub system_prompt: Option<String>,
    #[serde(flatten)]
    pub llm: ModelSettings,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            system_prompt: None,
            llm: ModelSettings::default(),
        }
    }
}

pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub async fn plan(
        &self,
        providers: &ProviderRegistry,
        ctx: &ExecutionContext,
        goal: &str,
        context: Option<&str>,
    ) -> Result<Plan, HandboxError> {
        if goal.trim().is_empty() {
            return Err(HandboxError::InvalidInput("goal must not be empty".to_string()));
        }

        let system = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(default_system_prompt);
        let request = self
            .config
            .llm
            .request(Some(system), planning_prompt(goal, context, self.config.max_tasks));
        let response = invoke_model(providers, ctx, &self.config.llm, request).await?;

        let plan = parse_plan(goal, &response.text, self.config.max_tasks);
        if plan.is_degraded() {
            tracing::warn!(trace_id = %ctx.trace_id, "planner returned a degraded plan");
        } else {
            tracing::info!(
                trace_id = %ctx.trace_id,
                tasks = plan.tasks.len(),
                critical_path_len = plan.critical_path.len(),
                "plan created"
            );
        }
        Ok(plan)
    }
}

fn default_system_prompt() -> String {
    "You are a planning assistant. Break goals into concrete, ordered tasks \
     with explicit dependencies. Answer with JSON only."
        .to_string()
}

fn planning_prompt(goal: &str, context: Option<&str>, max_tasks: usize) -> String {
    let mut prompt = format!("Goal: {}\n", goal);
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("\nContext:\n{}\n", context));
    }
    prompt.push_str(&format!(
        "\nBreak the goal into at most {} tasks. Respond with JSON of the form:\n\
         {{\"tasks\": [{{\"id\": \"1\", \"name\": \"...\", \"description\": \"...\", \
         \"dependencies\": [\"<task id>\"], \"estimated_duration\": \"...\"}}], \
         \"critical_path\": [\"<task id>\"]}}",
        max_tasks
    ));
    prompt
}

/// Turn a model answer into a plan. Any shape that yields no tasks is
/// returned as a degraded plan holding the raw text.
pub fn parse_plan(goal: &str, text: &str, max_tasks: usize) -> Plan {
    let Ok(value) = extract_structured(text) else {
        return Plan::degraded(goal, text);
    };

    let (task_values, critical_values) = match &value {
        Value::Array(items) => (items.clone(), Vec::new()),
        Value::Object(map) => (
            map.get("tasks")
                .or_else(|| map.get("steps"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            map.get("critical_path")
                .or_else(|| map.get("criticalPath"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        ),
        _ => (Vec::new(), Vec::new()),
    };

    let mut tasks: Vec<Task> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (position, item) in task_values.iter().enumerate() {
        let Some(task) = parse_task(item, position) else {
            continue;
        };
        if !seen.insert(task.id.clone()) {
            tracing::warn!(task_id = %task.id, "duplicate task id in plan, keeping the first");
            continue;
        }
        tasks.push(task);
    }

    if tasks.is_empty() {
        return Plan::degraded(goal, text);
    }
    if tasks.len() > max_tasks.max(1) {
        tracing::warn!(tasks = tasks.len(), max_tasks, "plan truncated");
        tasks.truncate(max_tasks.max(1));
    }

    let known: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for task in &mut tasks {
        let dangling: Vec<String> = task
            .dependencies
            .iter()
            .filter(|dep| !known.contains(*dep) || **dep == task.id)
            .cloned()
            .collect();
        for dep in dangling {
            tracing::warn!(task_id = %task.id, dependency = %dep, "dropping unknown dependency");
            task.dependencies.remove(&dep);
        }
    }

    let mut plan = Plan::new(goal, tasks);
    plan.critical_path = critical_values
        .iter()
        .filter_map(id_from)
        .filter(|id| known.contains(id))
        .collect();
    if plan.critical_path.is_empty() {
        plan.critical_path = plan.longest_dependency_chain();
    }
    plan
}

fn parse_task(item: &Value, position: usize) -> Option<Task> {
    let fields = item.as_object()?;
    let id = fields
        .get("id")
        .and_then(id_from)
        .unwrap_or_else(|| (position + 1).to_string());
    let name = ["name", "title", "task"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(Value::as_str))
        .map(str::to_string)?;

    let mut task = Task::new(id, name);
    task.description = fields
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    task.dependencies = fields
        .get("dependencies")
        .or_else(|| fields.get("depends_on"))
        .and_then(Value::as_array)
        .map(|deps| deps.iter().filter_map(id_from).collect())
        .unwrap_or_else(BTreeSet::new);
    task.estimated_duration = fields
        .get("estimated_duration")
        .or_else(|| fields.get("duration"))
        .and_then(|d| match d {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    task.capability = fields
        .get("capability")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(input) = fields.get("input").and_then(Value::as_object) {
        task.input = input.clone();
    }
    Some(task)
}

/// Task ids may come back as strings or numbers.
fn id_from(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
