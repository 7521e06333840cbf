// ABOUTME: Task graph produced by the planner: tasks with dependency sets plus a critical path.
// ABOUTME: Task status transitions are guarded so a terminal status is only ever set once.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskStateError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Never attempted because a dependency failed.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    /// Capability to run for this task; the executor's default when absent.
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Reported on output only; a deserialized task always starts pending.
    #[serde(default, skip_deserializing)]
    status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            dependencies: BTreeSet::new(),
            estimated_duration: None,
            capability: None,
            input: Map::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn start(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Running)
    }

    pub fn complete(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Completed)
    }

    pub fn fail(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Failed)
    }

    pub fn skip(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Skipped)
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TaskStateError> {
        if self.status.is_terminal() {
            return Err(TaskStateError {
                task_id: self.id.clone(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// A dependency-annotated task graph. When the planner could not parse the
/// model's answer, `raw` holds the text and `tasks` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub critical_path: Vec<String>,
    #[serde(default)]
    pub raw: Option<String>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            goal: goal.into(),
            tasks,
            critical_path: Vec::new(),
            raw: None,
        }
    }

    /// The result of an unparseable planning response.
    pub fn degraded(goal: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            tasks: Vec::new(),
            critical_path: Vec::new(),
            raw: Some(raw.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.tasks.is_empty() && self.raw.is_some()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// `(task, dependency)` pairs for every declared edge.
    pub fn dependency_edges(&self) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .flat_map(|task| {
                task.dependencies
                    .iter()
                    .map(|dep| (task.id.clone(), dep.clone()))
            })
            .collect()
    }

    /// Longest chain of dependent tasks, root first. Edges to unknown ids
    /// are ignored and cycles are cut where they are detected.
    pub fn longest_dependency_chain(&self) -> Vec<String> {
        let index: HashMap<&str, &Task> = self.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut memo: HashMap<&str, Vec<String>> = HashMap::new();
        let mut visiting: HashSet<&str> = HashSet::new();
        let mut best: Vec<String> = Vec::new();

        for task in &self.tasks {
            let chain = chain_ending_at(task.id.as_str(), &index, &mut memo, &mut visiting);
            if chain.len() > best.len() {
                best = chain;
            }
        }
        best
    }
}

fn chain_ending_at<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a Task>,
    memo: &mut HashMap<&'a str, Vec<String>>,
    visiting: &mut HashSet<&'a str>,
) -> Vec<String> {
    if let Some(chain) = memo.get(id) {
        return chain.clone();
    }
    if !visiting.insert(id) {
        return Vec::new();
    }

    let mut longest: Vec<String> = Vec::new();
    if let Some(&task) = index.get(id) {
        for dep in &task.dependencies {
            if let Some(&dep_task) = index.get(dep.as_str()) {
                let chain = chain_ending_at(dep_task.id.as_str(), index, memo, visiting);
                if chain.len() > longest.len() {
                    longest = chain;
                }
            }
        }
    }

    visiting.remove(id);
    longest.push(id.to_string());
    memo.insert(id, longest.clone());
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_is_set_once() {
        let mut task = Task::new("t1", "Collect data");
        assert_eq!(task.status(), TaskStatus::Pending);

        task.start().unwrap();
        task.complete().unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);

        let err = task.fail().unwrap_err();
        assert_eq!(err.task_id, "t1");
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn skipped_is_terminal() {
        let mut task = Task::new("t1", "Report");
        task.skip().unwrap();
        assert!(task.start().is_err());
    }

    #[test]
    fn degraded_plan_keeps_raw_text() {
        let plan = Plan::degraded("ship it", "I think you should just ship it.");
        assert!(plan.is_degraded());
        assert!(plan.tasks.is_empty());
        assert!(plan.dependency_edges().is_empty());

        let ok = Plan::new("ship it", vec![Task::new("a", "A")]);
        assert!(!ok.is_degraded());
    }

    #[test]
    fn longest_chain_follows_dependencies() {
        let plan = Plan::new(
            "launch",
            vec![
                Task::new("design", "Design"),
                Task::new("build", "Build").with_dependencies(["design"]),
                Task::new("docs", "Docs").with_dependencies(["design"]),
                Task::new("test", "Test").with_dependencies(["build"]),
                Task::new("release", "Release").with_dependencies(["test", "docs"]),
            ],
        );

        assert_eq!(
            plan.longest_dependency_chain(),
            vec!["design", "build", "test", "release"]
        );
        assert_eq!(plan.dependency_edges().len(), 5);
    }

    #[test]
    fn longest_chain_survives_cycles_and_unknown_ids() {
        let plan = Plan::new(
            "loop",
            vec![
                Task::new("a", "A").with_dependencies(["b", "ghost"]),
                Task::new("b", "B").with_dependencies(["a"]),
            ],
        );
        let chain = plan.longest_dependency_chain();
        assert!(!chain.is_empty());
        assert!(chain.len() <= 2);
    }
}
