//! Agent pool manager
//!
//! Realises an allocation decision as a fixed-size set of registered agent
//! instances of one logical type and spreads invocations across them.

use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::bus::EventKind;
use crate::orchestrator::router::{CallContext, ToolOutcome, ToolRouter};
use crate::registry::AgentDescriptor;

/// Handle returned by [`AgentPoolManager::spawn_pool`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PoolHandle {
    pub pool_id: String,
    pub pool_type: String,
}

/// Lifecycle of a pool member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Spawning,
    Idle,
    Busy,
    Terminated,
}

impl MemberState {
    /// Registered and able to take work
    pub fn is_active(&self) -> bool {
        matches!(self, MemberState::Idle | MemberState::Busy)
    }
}

struct PoolMember {
    agent_id: String,
    tool: String,
    state: MemberState,
    in_flight: u32,
}

struct Pool {
    pool_type: String,
    members: Vec<PoolMember>,
    cursor: usize,
    terminated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub agent_id: String,
    pub state: MemberState,
}

/// Pool status for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub pool_type: String,
    pub size: usize,
    pub terminated: bool,
    pub members: Vec<MemberStatus>,
}

/// Marks a member idle again when its call finishes or is dropped
struct InFlight<'a> {
    manager: &'a AgentPoolManager,
    pool_id: &'a str,
    agent_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.manager.release_member(self.pool_id, self.agent_id);
    }
}

/// Owns every pool spawned by the orchestrator
pub struct AgentPoolManager {
    router: Arc<ToolRouter>,
    pools: Mutex<HashMap<String, Pool>>,
}

impl AgentPoolManager {
    pub fn new(router: Arc<ToolRouter>) -> Self {
        Self {
            router,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build `count` agents with `factory` and register them.
    ///
    /// The factory receives the member id to use. If any member cannot be
    /// built or registered, members registered so far are removed again.
    pub fn spawn_pool<F>(&self, pool_type: &str, count: usize, factory: F) -> Result<PoolHandle>
    where
        F: Fn(&str) -> anyhow::Result<AgentDescriptor>,
    {
        let spawn_error = |message: String| OrchestratorError::Spawn {
            pool_type: pool_type.to_string(),
            message,
        };

        if count == 0 {
            return Err(spawn_error("pool size must be at least 1".to_string()));
        }

        let uuid = Uuid::new_v4().simple().to_string();
        let pool_id = format!("{}-{}", pool_type, &uuid[..8]);
        let registry = self.router.registry();

        let mut members: Vec<PoolMember> = Vec::with_capacity(count);
        for i in 0..count {
            let member_id = format!("{}-{:03}", pool_id, i + 1);
            let built = factory(&member_id)
                .map_err(|e| spawn_error(format!("{:#}", e)))
                .and_then(|descriptor| {
                    let tool = descriptor
                        .tools
                        .first()
                        .map(|t| t.name.clone())
                        .ok_or_else(|| spawn_error(format!("agent {} exposes no tools", member_id)))?;
                    let agent_id = descriptor.id.clone();
                    registry
                        .register(descriptor)
                        .map_err(|e| spawn_error(e.to_string()))?;
                    Ok((agent_id, tool))
                });

            match built {
                Ok((agent_id, tool)) => members.push(PoolMember {
                    agent_id,
                    tool,
                    state: MemberState::Spawning,
                    in_flight: 0,
                }),
                Err(err) => {
                    warn!("Rolling back pool {}: {}", pool_id, err);
                    for member in &members {
                        registry.deregister(&member.agent_id);
                    }
                    return Err(err);
                }
            }
        }

        for member in &mut members {
            member.state = MemberState::Idle;
        }

        info!("Spawned pool {} with {} members", pool_id, count);
        self.lock().insert(
            pool_id.clone(),
            Pool {
                pool_type: pool_type.to_string(),
                members,
                cursor: 0,
                terminated: false,
            },
        );
        self.router.events().emit(EventKind::PoolSpawned {
            pool_id: pool_id.clone(),
            pool_type: pool_type.to_string(),
            size: count,
        });

        Ok(PoolHandle {
            pool_id,
            pool_type: pool_type.to_string(),
        })
    }

    /// Invoke the next member of the pool, round-robin over this pool only.
    /// The member's result or error is returned unchanged.
    pub async fn invoke_on_pool(&self, handle: &PoolHandle, params: Value) -> Result<ToolOutcome> {
        self.invoke_on_pool_with(handle, params, &CallContext::default())
            .await
    }

    pub async fn invoke_on_pool_with(
        &self,
        handle: &PoolHandle,
        params: Value,
        context: &CallContext,
    ) -> Result<ToolOutcome> {
        let (agent_id, tool) = {
            let mut pools = self.lock();
            let pool = pools
                .get_mut(&handle.pool_id)
                .filter(|p| !p.terminated)
                .ok_or_else(|| OrchestratorError::no_provider(format!("pool '{}'", handle.pool_id)))?;

            let index = pool.cursor % pool.members.len();
            pool.cursor = index + 1;
            let member = &mut pool.members[index];
            member.in_flight += 1;
            member.state = MemberState::Busy;
            (member.agent_id.clone(), member.tool.clone())
        };

        let _busy = InFlight {
            manager: self,
            pool_id: &handle.pool_id,
            agent_id: &agent_id,
        };
        self.router.invoke_tool_with(&tool, params, context).await
    }

    /// Spread `tasks` over the pool round-robin and run them concurrently.
    ///
    /// Results keep the order of `tasks`. The first failure is returned and
    /// the remaining calls are dropped.
    pub async fn invoke_batch_on_pool(
        &self,
        handle: &PoolHandle,
        tasks: Vec<Value>,
        context: &CallContext,
    ) -> Result<Vec<ToolOutcome>> {
        debug!(
            "Distributing {} tasks over pool {}",
            tasks.len(),
            handle.pool_id
        );
        try_join_all(
            tasks
                .into_iter()
                .map(|params| self.invoke_on_pool_with(handle, params, context)),
        )
        .await
    }

    fn release_member(&self, pool_id: &str, agent_id: &str) {
        let mut pools = self.lock();
        if let Some(member) = pools
            .get_mut(pool_id)
            .and_then(|p| p.members.iter_mut().find(|m| m.agent_id == agent_id))
        {
            member.in_flight = member.in_flight.saturating_sub(1);
            if member.in_flight == 0 && member.state == MemberState::Busy {
                member.state = MemberState::Idle;
            }
        }
    }

    /// Deregister every member. Terminating twice is a no-op.
    pub fn terminate_pool(&self, handle: &PoolHandle) -> Result<()> {
        let mut pools = self.lock();
        let pool = pools
            .get_mut(&handle.pool_id)
            .ok_or_else(|| OrchestratorError::no_provider(format!("pool '{}'", handle.pool_id)))?;

        if pool.terminated {
            return Ok(());
        }

        for member in &mut pool.members {
            self.router.registry().deregister(&member.agent_id);
            member.state = MemberState::Terminated;
        }
        pool.terminated = true;

        info!("Terminated pool {}", handle.pool_id);
        self.router.events().emit(EventKind::PoolTerminated {
            pool_id: handle.pool_id.clone(),
            pool_type: pool.pool_type.clone(),
        });
        Ok(())
    }

    /// Terminate every live pool
    pub fn shutdown(&self) {
        let handles: Vec<PoolHandle> = self
            .lock()
            .iter()
            .filter(|(_, pool)| !pool.terminated)
            .map(|(pool_id, pool)| PoolHandle {
                pool_id: pool_id.clone(),
                pool_type: pool.pool_type.clone(),
            })
            .collect();

        for handle in &handles {
            if let Err(e) = self.terminate_pool(handle) {
                warn!("Failed to terminate pool {}: {}", handle.pool_id, e);
            }
        }
        if !handles.is_empty() {
            info!("Shut down {} pools", handles.len());
        }
    }

    /// Number of pools not yet terminated
    pub fn active_pools(&self) -> usize {
        self.lock().values().filter(|p| !p.terminated).count()
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let pools = self.lock();
        let mut status: Vec<PoolStatus> = pools
            .iter()
            .map(|(pool_id, pool)| PoolStatus {
                pool_id: pool_id.clone(),
                pool_type: pool.pool_type.clone(),
                size: pool.members.len(),
                terminated: pool.terminated,
                members: pool
                    .members
                    .iter()
                    .map(|m| MemberStatus {
                        agent_id: m.agent_id.clone(),
                        state: m.state,
                    })
                    .collect(),
            })
            .collect();
        status.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        status
    }
}
