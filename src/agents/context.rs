//! Shared handles every agent is built from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::retrieval::ContextRetriever;
use crate::llm::GeneratorPool;
use crate::mcp::ToolInvoker;
use crate::plan::PlannerConfig;
use crate::store::PlanStore;

/// Resources shared by all agents of a runtime.
///
/// Cloning is cheap; every field is a handle.
#[derive(Clone)]
pub struct AgentContext {
    /// Generator pool for intent, synthesis, planning and answers
    pub generator: Arc<GeneratorPool>,

    /// Tool catalog and invocation
    pub tools: Arc<dyn ToolInvoker>,

    /// Plan persistence
    pub plan_store: PlanStore,

    /// Optional retrieval; `None` means requests run without context
    pub retriever: Option<Arc<dyn ContextRetriever>>,

    /// Where planner writes plan JSON copies
    pub plans_dir: Option<PathBuf>,

    /// Per tool call timeout
    pub step_timeout: Duration,

    /// Number of retrieval chunks requested per call
    pub top_k: usize,
}

impl AgentContext {
    pub fn new(generator: Arc<GeneratorPool>, tools: Arc<dyn ToolInvoker>, plan_store: PlanStore) -> Self {
        Self {
            generator,
            tools,
            plan_store,
            retriever: None,
            plans_dir: None,
            step_timeout: Duration::from_secs(120),
            top_k: 5,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_plans_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plans_dir = Some(dir.into());
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub(crate) fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            plans_dir: self.plans_dir.clone(),
            ..PlannerConfig::default()
        }
    }
}
