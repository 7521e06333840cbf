// ABOUTME: Runs a plan's tasks through the capability registry under a scheduling policy.
// ABOUTME: Sequential, parallel (barrier chunks of max_parallel), or dependency (topological waves).

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use handbox_core::{ExecutionContext, HandboxError, Plan, Task, TaskStatus};

use crate::capability::{CapabilityMap, CapabilityRegistry};

const DEFAULT_MAX_PARALLEL: usize = 3;
const DEFAULT_CAPABILITY: &str = "llm.invoke";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    #[default]
    Sequential,
    Parallel,
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub policy: ExecutionPolicy,
    pub max_parallel: usize,
    pub continue_on_error: bool,
    /// Capability run for tasks that do not name one.
    pub default_capability: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            continue_on_error: false,
            default_capability: DEFAULT_CAPABILITY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub output: Option<CapabilityMap>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: String,
    pub message: String,
}

/// Outcome of one plan run. `completed + failed + skipped` may be less than
/// `total` when the walk stopped at the first failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub results: Vec<TaskResult>,
    pub status: ExecutionStatus,
    pub errors: Vec<TaskError>,
    /// Task ids grouped by the batch they ran in, in run order.
    pub batches: Vec<Vec<String>>,
}

impl ExecutionReport {
    fn record(&mut self, task: &mut Task, outcome: Result<CapabilityMap, HandboxError>) {
        let transition = match &outcome {
            Ok(_) => task.complete(),
            Err(_) => task.fail(),
        };
        if let Err(e) = transition {
            tracing::warn!(task_id = %task.id, error = %e, "ignoring repeated terminal transition");
        }

        let (output, error) = match outcome {
            Ok(output) => (Some(output), None),
            Err(e) => {
                let failure = HandboxError::TaskExecutionFailed {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(task_id = %task.id, error = %failure, "task failed");
                self.errors.push(TaskError {
                    task_id: task.id.clone(),
                    message: failure.to_string(),
                });
                (None, Some(e.to_string()))
            }
        };
        self.results.push(TaskResult {
            task_id: task.id.clone(),
            name: task.name.clone(),
            status: task.status(),
            output,
            error,
        });
    }

    fn record_skip(&mut self, task: &mut Task, reason: String) {
        if let Err(e) = task.skip() {
            tracing::warn!(task_id = %task.id, error = %e, "ignoring repeated terminal transition");
        }
        tracing::info!(task_id = %task.id, reason = %reason, "task skipped");
        self.results.push(TaskResult {
            task_id: task.id.clone(),
            name: task.name.clone(),
            status: TaskStatus::Skipped,
            output: None,
            error: Some(reason),
        });
    }

    fn finish(mut self, total: usize) -> Self {
        let count = |status| self.results.iter().filter(|r| r.status == status).count();
        self.status = ExecutionStatus {
            total,
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
        };
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status.completed == self.status.total
    }
}

pub struct TaskExecutor {
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Run every task of `plan`. Per-task statuses are annotated on the plan;
    /// the task graph itself is never changed.
    pub async fn execute(
        &self,
        plan: &mut Plan,
        capabilities: &CapabilityRegistry,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionReport, HandboxError> {
        if plan.is_degraded() {
            return Err(HandboxError::InvalidInput(
                "plan is degraded and has no tasks to execute".to_string(),
            ));
        }

        tracing::info!(
            trace_id = %ctx.trace_id,
            policy = ?self.config.policy,
            tasks = plan.tasks.len(),
            "executing plan"
        );
        let report = match self.config.policy {
            ExecutionPolicy::Sequential => self.run_sequential(plan, capabilities, ctx).await,
            ExecutionPolicy::Parallel => self.run_parallel(plan, capabilities, ctx).await,
            ExecutionPolicy::Dependency => self.run_dependency(plan, capabilities, ctx).await,
        };
        let report = report.finish(plan.tasks.len());
        tracing::info!(
            trace_id = %ctx.trace_id,
            completed = report.status.completed,
            failed = report.status.failed,
            skipped = report.status.skipped,
            "plan execution finished"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        plan: &mut Plan,
        capabilities: &CapabilityRegistry,
        ctx: &ExecutionContext,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for idx in 0..plan.tasks.len() {
            let failed = self
                .run_batch(&[idx], plan, &HashMap::new(), capabilities, ctx, &mut report)
                .await;
            if failed && !self.config.continue_on_error {
                break;
            }
        }
        report
    }

    async fn run_parallel(
        &self,
        plan: &mut Plan,
        capabilities: &CapabilityRegistry,
        ctx: &ExecutionContext,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let indices: Vec<usize> = (0..plan.tasks.len()).collect();
        for chunk in indices.chunks(self.max_parallel()) {
            let failed = self
                .run_batch(chunk, plan, &HashMap::new(), capabilities, ctx, &mut report)
                .await;
            if failed && !self.config.continue_on_error {
                break;
            }
        }
        report
    }

    /// Topological waves: every pending task whose dependencies have all
    /// completed is ready; ready tasks run in chunks of `max_parallel`.
    async fn run_dependency(
        &self,
        plan: &mut Plan,
        capabilities: &CapabilityRegistry,
        ctx: &ExecutionContext,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let known: HashSet<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        let mut outputs: HashMap<String, CapabilityMap> = HashMap::new();

        loop {
            // Skip anything downstream of a failure before picking the next wave.
            let mut skipped_any = false;
            for idx in 0..plan.tasks.len() {
                let task = &plan.tasks[idx];
                if task.status() != TaskStatus::Pending {
                    continue;
                }
                let blocked_by = task.dependencies.iter().find(|dep| {
                    plan.task(dep).is_some_and(|d| {
                        matches!(d.status(), TaskStatus::Failed | TaskStatus::Skipped)
                    })
                });
                if let Some(dep) = blocked_by {
                    let reason = format!("dependency {} did not complete", dep);
                    report.record_skip(&mut plan.tasks[idx], reason);
                    skipped_any = true;
                }
            }

            let ready: Vec<usize> = plan
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status() == TaskStatus::Pending)
                .filter(|(_, t)| {
                    t.dependencies
                        .iter()
                        .all(|dep| !known.contains(dep) || outputs.contains_key(dep))
                })
                .map(|(idx, _)| idx)
                .collect();

            if ready.is_empty() {
                if skipped_any {
                    continue;
                }
                break;
            }

            for chunk in ready.chunks(self.max_parallel()) {
                let failed = self
                    .run_batch(chunk, plan, &outputs, capabilities, ctx, &mut report)
                    .await;
                for &idx in chunk {
                    let task = &plan.tasks[idx];
                    if task.status() == TaskStatus::Completed
                        && let Some(result) = report.results.iter().rev().find(|r| r.task_id == task.id)
                        && let Some(output) = &result.output
                    {
                        outputs.insert(task.id.clone(), output.clone());
                    }
                }
                if failed && !self.config.continue_on_error {
                    return report;
                }
            }
        }

        // Whatever is still pending waits on itself through a cycle.
        for task in plan.tasks.iter_mut().filter(|t| t.status() == TaskStatus::Pending) {
            if let Err(e) = task.fail() {
                tracing::warn!(task_id = %task.id, error = %e, "ignoring repeated terminal transition");
            }
            let message = HandboxError::TaskExecutionFailed {
                task_id: task.id.clone(),
                reason: "dependency cycle".to_string(),
            }
            .to_string();
            tracing::warn!(task_id = %task.id, "task is part of a dependency cycle");
            report.errors.push(TaskError {
                task_id: task.id.clone(),
                message: message.clone(),
            });
            report.results.push(TaskResult {
                task_id: task.id.clone(),
                name: task.name.clone(),
                status: TaskStatus::Failed,
                output: None,
                error: Some(message),
            });
        }
        report
    }

    /// Run a batch of tasks concurrently and wait for all of them.
    /// Returns whether any task in the batch failed.
    async fn run_batch(
        &self,
        batch: &[usize],
        plan: &mut Plan,
        upstream: &HashMap<String, CapabilityMap>,
        capabilities: &CapabilityRegistry,
        ctx: &ExecutionContext,
        report: &mut ExecutionReport,
    ) -> bool {
        for &idx in batch {
            if let Err(e) = plan.tasks[idx].start() {
                tracing::warn!(error = %e, "task already finished");
            }
        }
        let ids: Vec<String> = batch.iter().map(|&i| plan.tasks[i].id.clone()).collect();
        tracing::debug!(trace_id = %ctx.trace_id, tasks = ?ids, "running batch");
        report.batches.push(ids);

        let snapshot: Vec<Task> = batch.iter().map(|&i| plan.tasks[i].clone()).collect();
        let outcomes = join_all(
            snapshot
                .iter()
                .map(|task| self.run_task(task, upstream, capabilities, ctx)),
        )
        .await;

        let mut failed = false;
        for (&idx, outcome) in batch.iter().zip(outcomes) {
            failed |= outcome.is_err();
            report.record(&mut plan.tasks[idx], outcome);
        }
        failed
    }

    async fn run_task(
        &self,
        task: &Task,
        upstream: &HashMap<String, CapabilityMap>,
        capabilities: &CapabilityRegistry,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        let capability = task
            .capability
            .as_deref()
            .unwrap_or(&self.config.default_capability);

        let mut input = task.input.clone();
        input
            .entry("task_id")
            .or_insert_with(|| json!(task.id));
        input
            .entry("task")
            .or_insert_with(|| json!(task.name));
        if !task.description.is_empty() {
            input
                .entry("description")
                .or_insert_with(|| json!(task.description));
        }

        let dependency_outputs: Map<String, Value> = task
            .dependencies
            .iter()
            .filter_map(|dep| {
                upstream
                    .get(dep)
                    .map(|out| (dep.clone(), Value::Object(out.clone())))
            })
            .collect();
        if !input.contains_key("prompt") {
            input.insert(
                "prompt".to_string(),
                json!(task_prompt(task, &dependency_outputs)),
            );
        }
        if !dependency_outputs.is_empty() {
            input
                .entry("dependencies")
                .or_insert(Value::Object(dependency_outputs));
        }

        tracing::debug!(trace_id = %ctx.trace_id, task_id = %task.id, capability, "running task");
        capabilities
            .execute(capability, &input, &CapabilityMap::new(), ctx)
            .await
    }

    fn max_parallel(&self) -> usize {
        self.config.max_parallel.max(1)
    }
}

fn task_prompt(task: &Task, dependency_outputs: &Map<String, Value>) -> String {
    let mut prompt = task.name.clone();
    if !task.description.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&task.description);
    }
    if !dependency_outputs.is_empty() {
        prompt.push_str("\n\nResults from earlier tasks:");
        for (id, output) in dependency_outputs {
            let text = output
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| output.to_string());
            prompt.push_str(&format!("\n- {}: {}", id, text));
        }
    }
    prompt
}
