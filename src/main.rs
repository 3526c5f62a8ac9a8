//! rago-agent - command-line entry point
//!
//! Runs one request through an agent, or one goal as a mission:
//!
//! ```text
//! rago-agent <request...>
//! rago-agent --mission <goal...>
//! ```
//!
//! The result is printed to stdout as JSON; logs go to stderr.

use rago_agents::{config::Config, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rago_agents=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mission = args.first().is_some_and(|a| a == "--mission");
    if mission {
        args.remove(0);
    }
    let goal = args.join(" ");
    if goal.trim().is_empty() {
        anyhow::bail!("usage: rago-agent [--mission] <request>");
    }

    let config = Config::from_env()?;
    let runtime = Runtime::start(config).await?;

    let output = if mission {
        run_mission(&runtime, &goal).await
    } else {
        run_request(&runtime, &goal).await
    };
    runtime.shutdown().await;

    println!("{}", output?);
    Ok(())
}

async fn run_request(runtime: &Runtime, request: &str) -> anyhow::Result<String> {
    let cancel = CancellationToken::new();
    let agent = runtime.agent();
    let result = tokio::select! {
        result = agent.run_with_cancel(request, &cancel) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping after the current step");
            cancel.cancel();
            agent.run_with_cancel(request, &cancel).await
        }
    };
    info!(success = result.success, "Request done");
    Ok(serde_json::to_string_pretty(&result)?)
}

async fn run_mission(runtime: &Runtime, goal: &str) -> anyhow::Result<String> {
    let commander = runtime.commander.clone();
    let goal = goal.to_string();
    let mut task = tokio::spawn(async move { commander.execute_mission(&goal).await });

    let mission = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running missions");
            for mission in runtime.commander.list_missions().await {
                if let Err(e) = runtime.commander.cancel_mission(&mission.id).await {
                    warn!(mission_id = %mission.id, "Cancel failed: {}", e);
                }
            }
            task.await?
        }
    }?;
    info!(mission_id = %mission.id, status = %mission.status, "Mission done");
    Ok(serde_json::to_string_pretty(&mission)?)
}
