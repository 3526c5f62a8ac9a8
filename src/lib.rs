//! # rago-agents
//!
//! Plan-and-execute agent runtime with supervised MCP tool servers and
//! multi-task missions.
//!
//! This library provides:
//! - SQLite stores for plans, executions and mission progress
//! - A broker that supervises stdio tool servers and routes tool calls
//! - Generator and embedder pools over OpenAI-compatible endpoints
//! - A planner/executor pair and the [`agents::Agent`] façade
//! - A mission [`mission::Commander`] that runs a team of pooled agents
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │            Commander             │
//!        │   (strategy, topology, resume)   │
//!        └────────────────┬─────────────────┘
//!                         │ AgentPool
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │              Agent               │
//!        │  intent → decide → plan → execute│
//!        └───────┬─────────────────┬────────┘
//!                │                 │
//!                ▼                 ▼
//!        ┌──────────────┐  ┌──────────────┐
//!        │ GeneratorPool│  │  ToolBroker  │
//!        └──────────────┘  └──────┬───────┘
//!                                 ▼
//!                         stdio tool servers
//! ```
//!
//! ## Modules
//! - `store`: plan store and progress store
//! - `mcp`: tool-server supervision and the `ToolInvoker` seam
//! - `llm`: chat/embedding clients and pools
//! - `plan`: plan model, planner, executor
//! - `agents`: the agent façade and worker pool
//! - `mission`: strategies and the commander
//! - `runtime`: wiring from configuration

pub mod agents;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod mission;
pub mod plan;
pub mod runtime;
pub mod store;
pub mod util;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::Runtime;
