//! Fixed-size pool of ready agents for mission workers.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use super::{Agent, AgentContext};
use crate::error::{Error, Result};

/// Checkout/return pool of [`Agent`]s.
///
/// # Invariants
/// - Idle agents plus checked-out guards always equal `size`.
/// - A guard returns its agent exactly once, on drop.
pub struct AgentPool {
    idle: Mutex<Vec<Arc<Agent>>>,
    permits: Semaphore,
    size: usize,
}

impl AgentPool {
    /// Build `size` agents (at least one) sharing `ctx`.
    pub fn new(ctx: &AgentContext, size: usize) -> Self {
        let size = size.max(1);
        let idle = (0..size).map(|_| Arc::new(Agent::new(ctx.clone()))).collect();
        Self {
            idle: Mutex::new(idle),
            permits: Semaphore::new(size),
            size,
        }
    }

    /// Wait for an idle agent.
    pub async fn get(&self) -> Result<PooledAgent<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("agent pool closed".to_string()))?;
        self.checkout(permit)
    }

    /// Wait for an idle agent unless `cancel` fires first.
    pub async fn get_cancellable(&self, cancel: &CancellationToken) -> Result<PooledAgent<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled("waiting for an agent".to_string())),
            guard = self.get() => guard,
        }
    }

    fn checkout<'a>(&'a self, permit: SemaphorePermit<'a>) -> Result<PooledAgent<'a>> {
        let agent = self
            .idle
            .lock()
            .map_err(|_| Error::Internal("agent pool lock poisoned".to_string()))?
            .pop()
            .ok_or_else(|| Error::Internal("agent pool permit without agent".to_string()))?;
        Ok(PooledAgent {
            pool: self,
            agent: Some(agent),
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Idle agents right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A checked-out agent; returns to the pool on drop.
pub struct PooledAgent<'a> {
    pool: &'a AgentPool,
    agent: Option<Arc<Agent>>,
    // Dropped after `Drop::drop` has put the agent back.
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for PooledAgent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAgent")
            .field("agent", &self.agent.as_ref().map(|a| a.id().to_string()))
            .finish()
    }
}

impl Deref for PooledAgent<'_> {
    type Target = Agent;

    fn deref(&self) -> &Agent {
        // Only `drop` takes the agent out.
        self.agent.as_deref().unwrap_or_else(|| unreachable!("agent returned twice"))
    }
}

impl Drop for PooledAgent<'_> {
    fn drop(&mut self) {
        if let Some(agent) = self.agent.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(agent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PlanStore;
    use crate::testutil::{agent_reply, generator, DemoTools, ScriptedLlm};
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    fn pool(size: usize) -> AgentPool {
        let llm = ScriptedLlm::new(|r| agent_reply(r).unwrap_or_default());
        let ctx = AgentContext::new(generator(llm), DemoTools::new(), PlanStore::in_memory().unwrap());
        AgentPool::new(&ctx, size)
    }

    #[tokio::test]
    async fn checkout_blocks_until_return() {
        let pool = pool(2);
        assert_eq!(pool.size(), 2);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);

        let mut waiting = tokio_test::task::spawn(pool.get());
        assert_pending!(waiting.poll());

        drop(a);
        assert!(waiting.is_woken());
        let c = assert_ready!(waiting.poll()).unwrap();
        drop(c);
        drop(b);
        drop(waiting);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn cancelled_wait_returns_error() {
        let pool = pool(1);
        let _held = pool.get().await.unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = pool.get_cancellable(&token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn zero_size_is_clamped() {
        assert_eq!(pool(0).size(), 1);
    }
}
