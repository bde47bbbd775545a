//! Query Logic Registry
//!
//! Maps query logic names (the `query_logic` part of a `QueryKey`) to the async
//! closures that execute that logic's tasks. Storage and scheduling stay generic;
//! everything query-specific lives behind this registry.

use crate::query::types::{QueryAction, QueryResult, QueryTask};

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a task produced and what should run next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    /// Result pages to publish to the query's listeners.
    pub results: Vec<QueryResult>,
    /// Follow-up task, as an action plus the checkpoint config to resume from.
    pub next: Option<(QueryAction, serde_json::Value)>,
    /// Execution plan to record on the query status.
    pub plan: Option<String>,
}

impl TaskOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_results(mut self, results: Vec<QueryResult>) -> Self {
        self.results = results;
        self
    }

    pub fn then(mut self, action: QueryAction, config: serde_json::Value) -> Self {
        self.next = Some((action, config));
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }
}

pub type QueryLogicFn =
    Arc<dyn Fn(QueryTask) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>> + Send + Sync>;

pub struct QueryLogicRegistry {
    logics: DashMap<String, QueryLogicFn>,
}

impl QueryLogicRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            logics: DashMap::new(),
        })
    }

    pub fn register<F, Fut>(&self, logic_name: &str, logic: F)
    where
        F: Fn(QueryTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
    {
        let logic_fn: QueryLogicFn = Arc::new(move |task: QueryTask| {
            Box::pin(logic(task)) as Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>>
        });

        self.logics.insert(logic_name.to_string(), logic_fn);

        tracing::info!("Registered query logic: {}", logic_name);
    }

    /// Runs the logic named by the task's query key.
    pub async fn execute(&self, task: &QueryTask) -> Result<TaskOutcome> {
        let logic_name = &task.task_key.query_key.query_logic;
        // Clone out of the map so no shard lock is held across the await.
        let logic_fn = self.logics.get(logic_name).map(|entry| entry.value().clone());

        match logic_fn {
            Some(logic_fn) => {
                tracing::debug!("Executing {:?} task {} with {}", task.action, task.task_key, logic_name);
                logic_fn(task.clone()).await
            }
            None => {
                let error = format!("Unknown query logic: {}", logic_name);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    pub fn list_logics(&self) -> Vec<String> {
        self.logics.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_logic(&self, logic_name: &str) -> bool {
        self.logics.contains_key(logic_name)
    }

    pub fn logic_count(&self) -> usize {
        self.logics.len()
    }
}

impl Default for QueryLogicRegistry {
    fn default() -> Self {
        Self {
            logics: DashMap::new(),
        }
    }
}
