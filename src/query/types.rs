use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a task, unique only within its owning query.
pub type TaskId = u64;

/// Immutable identity of one logical query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueryKey {
    /// Named partition used to segregate query resources.
    pub query_pool: String,
    pub query_id: String,
    /// Name of the query logic that executes this query.
    pub query_logic: String,
}

impl QueryKey {
    pub fn new(
        query_pool: impl Into<String>,
        query_id: impl Into<String>,
        query_logic: impl Into<String>,
    ) -> Self {
        Self {
            query_pool: query_pool.into(),
            query_id: query_id.into(),
            query_logic: query_logic.into(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.query_pool, self.query_id, self.query_logic)
    }
}

/// Identifies one unit of work of a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub task_id: TaskId,
    pub query_key: QueryKey,
}

impl TaskKey {
    pub fn new(task_id: TaskId, query_key: QueryKey) -> Self {
        Self { task_id, query_key }
    }

    pub fn query_id(&self) -> &str {
        &self.query_key.query_id
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.query_key, self.task_id)
    }
}

/// Lifecycle of a query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    #[default]
    Defined,
    Created,
    Closed,
    Canceled,
    Failed,
}

impl QueryState {
    /// Closed, canceled and failed queries never schedule more work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Canceled | Self::Failed)
    }
}

/// Concurrency state of a single task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting to be claimed by a worker.
    Ready,
    /// Claimed by a worker. Counts against the running-task budget.
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryAction {
    Create,
    Plan,
    Predict,
    Next,
    Close,
}

/// Query parameters as submitted by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub query: String,
    pub query_name: Option<String>,
    pub query_logic_name: String,
    pub begin_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub pagesize: u32,
    /// User that created the query. Set by `create_query`.
    pub owner: Option<String>,
    pub parameters: BTreeMap<String, String>,
}

impl Query {
    pub fn new(query: impl Into<String>, query_logic_name: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            query_name: None,
            query_logic_name: query_logic_name.into(),
            begin_date: None,
            end_date: None,
            pagesize: 10,
            owner: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_dates(mut self, begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.begin_date = Some(begin);
        self.end_date = Some(end);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Lifecycle record of one query, owned by the query-status store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryStatus {
    pub query_key: QueryKey,
    pub query_state: QueryState,
    pub query: Option<Query>,
    pub calculated_auths: BTreeSet<String>,
    /// Execution plan generated while creating the query.
    pub plan: Option<String>,
    pub num_results_returned: u64,
    pub num_results_generated: u64,
    pub concurrent_next_count: u32,
    pub last_page_number: u64,
    /// Last user interaction.
    pub last_used: Option<DateTime<Utc>>,
    /// Last service interaction.
    pub last_updated: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl QueryStatus {
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            query_key,
            query_state: QueryState::Defined,
            query: None,
            calculated_auths: BTreeSet::new(),
            plan: None,
            num_results_returned: 0,
            num_results_generated: 0,
            concurrent_next_count: 0,
            last_page_number: 0,
            last_used: None,
            last_updated: None,
            failure_message: None,
            stack_trace: None,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_key.query_id
    }

    pub fn increment_num_results_returned(&mut self, increment: u64) {
        self.num_results_returned += increment;
    }

    pub fn increment_num_results_generated(&mut self, increment: u64) {
        self.num_results_generated += increment;
    }

    pub fn touch_last_used(&mut self, now: DateTime<Utc>) {
        self.last_used = Some(now);
    }

    pub fn touch_last_updated(&mut self, now: DateTime<Utc>) {
        self.last_updated = Some(now);
    }

    /// Records the failure message and the full cause chain as the trace.
    pub fn set_failure(&mut self, failure: &anyhow::Error) {
        self.failure_message = Some(failure.to_string());
        self.stack_trace = Some(format!("{:?}", failure));
    }
}

/// Result of asking `TaskStates` to move a task to a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The running-task budget is exhausted, the task is already running, or the
    /// task has already finished.
    Rejected,
    UnknownTask,
}

/// Concurrency record of one query, owned by the task-states store.
///
/// Invariant: the number of `Running` tasks never exceeds `max_running`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStates {
    pub query_key: QueryKey,
    pub max_running: usize,
    next_task_id: TaskId,
    task_states: BTreeMap<TaskId, TaskState>,
}

impl TaskStates {
    pub fn new(query_key: QueryKey, max_running: usize) -> Self {
        Self {
            query_key,
            max_running,
            next_task_id: 0,
            task_states: BTreeMap::new(),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_key.query_id
    }

    pub fn get_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.task_states.get(&task_id).copied()
    }

    /// Sets a state unconditionally. Used to seed records, not for admission.
    pub fn set_state(&mut self, task_id: TaskId, state: TaskState) {
        self.task_states.insert(task_id, state);
        if task_id >= self.next_task_id {
            self.next_task_id = task_id + 1;
        }
    }

    /// Hands out the next task id and registers it as `Ready`.
    pub fn allocate_task(&mut self) -> TaskId {
        let task_id = self.next_task_id;
        self.set_state(task_id, TaskState::Ready);
        task_id
    }

    /// Applies a transition subject to the running-task budget.
    ///
    /// `Completed` and `Failed` are final. A `Running` task may go back to `Ready`,
    /// which hands its claim back and frees its slot.
    pub fn transition(&mut self, task_id: TaskId, new_state: TaskState) -> Transition {
        let Some(current) = self.get_state(task_id) else {
            return Transition::UnknownTask;
        };

        if current.is_terminal() {
            return Transition::Rejected;
        }

        if new_state == TaskState::Running
            && (current == TaskState::Running || self.running_count() >= self.max_running)
        {
            return Transition::Rejected;
        }

        self.task_states.insert(task_id, new_state);
        Transition::Applied
    }

    pub fn running_count(&self) -> usize {
        self.task_states
            .values()
            .filter(|state| **state == TaskState::Running)
            .count()
    }

    pub fn tasks_in_state(&self, state: TaskState) -> Vec<TaskId> {
        self.task_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn has_ready_tasks(&self) -> bool {
        self.task_states.values().any(|s| *s == TaskState::Ready)
    }

    pub fn states(&self) -> &BTreeMap<TaskId, TaskState> {
        &self.task_states
    }
}

/// Resumable execution state of a task.
///
/// `config` is opaque to storage; replaying it on any worker must continue
/// exactly where the previous owner stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryCheckpoint {
    pub query_key: QueryKey,
    pub config: serde_json::Value,
}

impl QueryCheckpoint {
    pub fn new(query_key: QueryKey, config: serde_json::Value) -> Self {
        Self { query_key, config }
    }
}

/// One unit of work, owned by the task store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryTask {
    pub task_key: TaskKey,
    pub action: QueryAction,
    pub checkpoint: QueryCheckpoint,
}

impl QueryTask {
    pub fn new(task_id: TaskId, action: QueryAction, checkpoint: QueryCheckpoint) -> Self {
        Self {
            task_key: TaskKey::new(task_id, checkpoint.query_key.clone()),
            action,
            checkpoint,
        }
    }

    pub fn describe(&self, state: Option<TaskState>) -> TaskDescription {
        TaskDescription {
            task_key: self.task_key.clone(),
            action: self.action,
            state,
        }
    }
}

/// Read-only projection of a task that leaves out the checkpoint payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescription {
    pub task_key: TaskKey,
    pub action: QueryAction,
    pub state: Option<TaskState>,
}

/// One page of output, carried by the result queue and never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub id: String,
    pub payload: serde_json::Value,
}

impl QueryResult {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}
