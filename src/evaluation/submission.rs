//! Submission types produced by the external agent.
//!
//! A submission is produced once per evaluation and consumed read-only by
//! every analyzer. Field names follow the agent's camelCase wire format.

use serde::{Deserialize, Serialize};

/// Goal recorded when a free-text rationale is promoted to a reasoning step.
const PROMOTED_RATIONALE_GOAL: &str = "Justify the submitted solution";

/// One piece of context an agent consumed during a reasoning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Identifier referenced by debt events.
    pub id: String,
    /// Where the context came from (file, search result, memory, ...).
    #[serde(default)]
    pub source: String,
    /// Raw content as the agent saw it.
    #[serde(default)]
    pub content: String,
}

impl ContextItem {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            content: content.into(),
        }
    }
}

/// Tool invocation performed at the end of a reasoning step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

/// One recorded unit of an agent's decision process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStep {
    pub step_index: u32,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub consumed_context: Vec<ContextItem>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub action_result: String,
}

impl ReasoningStep {
    /// Creates a step with no context, action or result.
    pub fn new(step_index: u32, goal: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            step_index,
            goal: goal.into(),
            consumed_context: Vec::new(),
            rationale: rationale.into(),
            action: Action::default(),
            action_result: String::new(),
        }
    }

    /// Appends a consumed context item.
    pub fn with_context(mut self, item: ContextItem) -> Self {
        self.consumed_context.push(item);
        self
    }

    /// Returns whether this step consumed a context item with the given id.
    pub fn consumed(&self, context_id: &str) -> bool {
        self.consumed_context.iter().any(|c| c.id == context_id)
    }
}

/// The agent's response to an issued task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub source_code: String,
    #[serde(default)]
    pub test_code: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub steps: Vec<ReasoningStep>,
}

impl Submission {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            ..Default::default()
        }
    }

    pub fn with_test_code(mut self, test_code: impl Into<String>) -> Self {
        self.test_code = Some(test_code.into());
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<ReasoningStep>) -> Self {
        self.steps = steps;
        self
    }

    /// Returns the reasoning trace to judge.
    ///
    /// Multi-step traces win. A submission that only carries free-text
    /// rationale yields a single step built from it; one with neither yields
    /// an empty trace.
    pub fn reasoning_trace(&self) -> Vec<ReasoningStep> {
        if !self.steps.is_empty() {
            return self.steps.clone();
        }

        match self.rationale.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                vec![ReasoningStep::new(0, PROMOTED_RATIONALE_GOAL, text)]
            }
            _ => Vec::new(),
        }
    }
}

/// An outstanding task from the task pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLike {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
}

impl TaskLike {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: content.into(),
        }
    }
}

/// Body sent to the agent when a task is issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: String,
    pub requirement: String,
}

impl From<&TaskLike> for TaskRequest {
    fn from(task: &TaskLike) -> Self {
        Self {
            task_id: task.id.clone(),
            requirement: task.content.clone(),
        }
    }
}
