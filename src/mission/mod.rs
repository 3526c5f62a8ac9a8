//! Multi-task missions: a goal decomposed into tasks, run by a team of
//! pooled agents under one of four topologies.

mod commander;
mod strategy;
mod types;

pub use commander::{Commander, CommanderConfig};
pub use strategy::generate_strategy;
pub use types::{
    AgentTask, Mission, MissionStatus, MissionStrategy, StrategyType, TaskDecomposition, TaskMetrics,
    TaskStatus, TaskType,
};
