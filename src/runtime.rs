//! Process-level wiring: stores, tool broker, model pools, agents and the
//! mission commander built from one [`Config`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::agents::{Agent, AgentContext, AgentPool};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::llm::{EmbedderPool, GeneratorPool};
use crate::mcp::{ToolBroker, ToolInvoker, ToolServerFile};
use crate::mission::Commander;
use crate::store::{PlanStore, ProgressStore};

pub struct Runtime {
    pub config: Config,
    pub plans: PlanStore,
    pub progress: ProgressStore,
    pub broker: Arc<ToolBroker>,
    pub generator: Arc<GeneratorPool>,
    pub embedder: Arc<EmbedderPool>,
    pub agents: Arc<AgentPool>,
    pub commander: Arc<Commander>,
    context: AgentContext,
}

impl Runtime {
    /// Open the stores, start auto-start tool servers and build the agent
    /// team. Tool servers that fail to start are logged and left out.
    pub async fn start(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await.map_err(|e| {
            Error::Config(format!("cannot create {}: {}", config.data_dir.display(), e))
        })?;
        let plans = PlanStore::open(config.plans_db()).await?;
        let progress = ProgressStore::open(config.progress_db()).await?;

        let servers = match &config.tool_servers_file {
            Some(path) => ToolServerFile::load(path).await?,
            None => Vec::new(),
        };
        let broker = Arc::new(
            ToolBroker::new(servers, &config.workspace_dir)?.with_call_timeout(config.step_timeout),
        );
        let (up, down) = broker.start_with_failures().await;
        if !down.is_empty() {
            warn!(failed = ?down, "Some tool servers did not start");
        }
        info!(servers = up.len(), tools = broker.list_tools().await.len(), "Tool broker ready");

        let generator = Arc::new(GeneratorPool::from_config(&config.llm));
        let embedder = Arc::new(EmbedderPool::from_config(&config.llm));
        if generator.is_empty() {
            warn!("No generator endpoints configured");
        }

        let tools: Arc<dyn ToolInvoker> = broker.clone();
        let context = AgentContext::new(generator.clone(), tools.clone(), plans.clone())
            .with_plans_dir(config.plans_dir())
            .with_step_timeout(config.step_timeout);
        let agents = Arc::new(AgentPool::new(&context, config.agent_workers));
        let commander = Arc::new(Commander::new(
            generator.clone(),
            tools,
            agents.clone(),
            progress.clone(),
        ));
        info!(workers = agents.size(), data_dir = %config.data_dir.display(), "Runtime started");

        Ok(Self {
            config,
            plans,
            progress,
            broker,
            generator,
            embedder,
            agents,
            commander,
            context,
        })
    }

    /// A standalone agent sharing the runtime's stores and tools.
    pub fn agent(&self) -> Agent {
        Agent::new(self.context.clone())
    }

    /// Stop every tool server.
    pub async fn shutdown(&self) {
        self.broker.close().await;
        info!("Runtime stopped");
    }
}
