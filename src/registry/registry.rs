//! Capability registry
//!
//! Maps capabilities to the agents and tools that implement them and routes
//! invocations to a handler. The registration table and the per-capability
//! round-robin cursors sit behind a single mutex; handlers run outside it.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::capability::Capability;
use super::descriptor::{AgentDescriptor, AgentInfo, ToolDescriptor, ToolInfo};
use crate::error::{OrchestratorError, Result};

#[derive(Default)]
struct RegistryInner {
    /// Registered agents in insertion order
    agents: Vec<AgentDescriptor>,
    /// Tool name -> owning agent id
    tool_owners: HashMap<String, String>,
    /// Next provider index per capability
    cursors: HashMap<Capability, usize>,
}

impl RegistryInner {
    fn tool(&self, name: &str) -> Option<(&AgentDescriptor, &ToolDescriptor)> {
        let owner = self.tool_owners.get(name)?;
        let agent = self.agents.iter().find(|a| &a.id == owner)?;
        let tool = agent.tools.iter().find(|t| t.name == name)?;
        Some((agent, tool))
    }

    fn tools_for(&self, capability: Capability) -> Vec<ToolInfo> {
        self.agents
            .iter()
            .flat_map(|agent| {
                agent
                    .tools
                    .iter()
                    .filter(move |t| t.capability == capability)
                    .map(move |t| t.info(&agent.id))
            })
            .collect()
    }
}

/// Registry status for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total_agents: usize,
    pub total_tools: usize,
    pub agents: Vec<String>,
    /// Number of tools serving each capability
    pub capabilities: BTreeMap<Capability, usize>,
}

/// Catalog entry describing one tool to a function-calling model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    /// Tool description with its owning agent appended
    pub description: String,
    pub capability: Capability,
    /// JSON Schema of the parameters
    pub parameters: Value,
}

/// Registry of agents, their capabilities and their tools
#[derive(Default)]
pub struct CapabilityRegistry {
    inner: Mutex<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an agent and all its tools.
    ///
    /// Either everything is registered or nothing is: a duplicate agent id,
    /// a colliding tool name or a tool serving an undeclared capability
    /// leaves the registry untouched.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        let mut inner = self.lock();

        if inner.agents.iter().any(|a| a.id == descriptor.id) {
            return Err(OrchestratorError::DuplicateAgent {
                agent_id: descriptor.id,
            });
        }

        let mut seen = HashSet::new();
        for tool in &descriptor.tools {
            if !descriptor.claims(tool.capability) {
                return Err(OrchestratorError::UndeclaredCapability {
                    agent_id: descriptor.id.clone(),
                    tool: tool.name.clone(),
                    capability: tool.capability,
                });
            }
            if inner.tool_owners.contains_key(&tool.name) || !seen.insert(tool.name.as_str()) {
                return Err(OrchestratorError::DuplicateTool {
                    tool: tool.name.clone(),
                });
            }
        }

        for tool in &descriptor.tools {
            inner
                .tool_owners
                .insert(tool.name.clone(), descriptor.id.clone());
        }

        info!(
            "Registered agent [{}] ({}) with {} tools",
            descriptor.id,
            descriptor.agent_type,
            descriptor.tools.len()
        );
        inner.agents.push(descriptor);
        Ok(())
    }

    /// Remove an agent and its tools. Returns whether anything was removed.
    pub fn deregister(&self, agent_id: &str) -> bool {
        let mut inner = self.lock();

        let Some(pos) = inner.agents.iter().position(|a| a.id == agent_id) else {
            return false;
        };

        let agent = inner.agents.remove(pos);
        for tool in &agent.tools {
            inner.tool_owners.remove(&tool.name);
        }

        info!("Unregistered agent [{}]", agent_id);
        true
    }

    /// Agents claiming `capability`, in registration order
    pub fn discover_agents(&self, capability: Capability) -> Vec<AgentInfo> {
        self.lock()
            .agents
            .iter()
            .filter(|a| a.claims(capability))
            .map(AgentDescriptor::info)
            .collect()
    }

    /// Agents of a logical type, in registration order
    pub fn discover_agents_by_type(&self, agent_type: &str) -> Vec<AgentInfo> {
        self.lock()
            .agents
            .iter()
            .filter(|a| a.agent_type == agent_type)
            .map(AgentDescriptor::info)
            .collect()
    }

    /// Tools serving `capability`, in registration order
    pub fn discover_tools(&self, capability: Capability) -> Vec<ToolInfo> {
        self.lock().tools_for(capability)
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolInfo> {
        self.lock().tool(name).map(|(agent, tool)| tool.info(&agent.id))
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.lock().agents.iter().any(|a| a.id == agent_id)
    }

    /// Pick the next tool for `capability` and advance its round-robin cursor.
    ///
    /// The cursor read and write happen under the registry lock, so concurrent
    /// callers never observe the same cursor value.
    pub fn next_provider(&self, capability: Capability) -> Result<ToolInfo> {
        let mut inner = self.lock();
        let mut tools = inner.tools_for(capability);
        if tools.is_empty() {
            return Err(OrchestratorError::no_provider(capability));
        }

        let cursor = inner.cursors.entry(capability).or_insert(0);
        let index = *cursor % tools.len();
        *cursor = index + 1;

        debug!("Selected provider {}/{} for {}", index + 1, tools.len(), capability);
        Ok(tools.swap_remove(index))
    }

    /// The tool `agent_id` exposes for `capability`, if that agent is registered
    /// and serves it. The round-robin cursor is left alone.
    pub fn preferred_provider(&self, capability: Capability, agent_id: &str) -> Option<ToolInfo> {
        self.lock()
            .tools_for(capability)
            .into_iter()
            .find(|t| t.agent_id == agent_id)
    }

    /// Every registered tool, in registration order
    pub fn tool_catalog(&self) -> Vec<ToolSpec> {
        let inner = self.lock();
        inner
            .agents
            .iter()
            .flat_map(|agent| {
                agent.tools.iter().map(move |tool| {
                    let description = if tool.description.is_empty() {
                        format!("provided by {}", agent.id)
                    } else {
                        format!("{} (provided by {})", tool.description, agent.id)
                    };
                    ToolSpec {
                        name: tool.name.clone(),
                        description,
                        capability: tool.capability,
                        parameters: tool.schema.to_json_schema(),
                    }
                })
            })
            .collect()
    }

    /// Validate `params` against the tool's schema and run its handler.
    pub async fn invoke_tool(&self, name: &str, params: Value) -> Result<Value> {
        let (schema, handler) = {
            let inner = self.lock();
            let (_, tool) = inner
                .tool(name)
                .ok_or_else(|| OrchestratorError::no_provider(format!("tool '{}'", name)))?;
            (tool.schema.clone(), tool.handler.clone())
        };

        schema
            .validate(&params)
            .map_err(|message| OrchestratorError::Validation {
                tool: name.to_string(),
                message,
            })?;

        handler
            .call(params)
            .await
            .map_err(|e| OrchestratorError::Invocation {
                tool: name.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Invoke one provider of `capability`, chosen round-robin.
    pub async fn invoke_capability(&self, capability: Capability, params: Value) -> Result<Value> {
        let tool = self.next_provider(capability)?;
        self.invoke_tool(&tool.name, params).await
    }

    pub fn status(&self) -> RegistryStatus {
        let inner = self.lock();
        let mut capabilities = BTreeMap::new();
        for agent in &inner.agents {
            for tool in &agent.tools {
                *capabilities.entry(tool.capability).or_insert(0) += 1;
            }
        }

        RegistryStatus {
            total_agents: inner.agents.len(),
            total_tools: inner.tool_owners.len(),
            agents: inner.agents.iter().map(|a| a.id.clone()).collect(),
            capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::ToolHandler;
    use crate::registry::schema::{ParamSchema, ParamType};
    use serde_json::json;

    fn echo_agent(id: &str, capability: Capability) -> AgentDescriptor {
        let agent_id = id.to_string();
        let tool = ToolDescriptor::new(
            ToolDescriptor::scoped_name("echo", id),
            capability,
            ParamSchema::new().required("message", ParamType::String, "Text to echo"),
            ToolHandler::new(move |params| {
                let agent_id = agent_id.clone();
                async move { Ok(json!({"agent": agent_id, "echo": params["message"]})) }
            }),
        );
        AgentDescriptor::new(id, "echo-agent")
            .with_capability(capability)
            .with_tool(tool)
    }

    #[test]
    fn test_discover_returns_exactly_registered_set() {
        let registry = CapabilityRegistry::new();
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();
        registry.register(echo_agent("a2", Capability::DataQuality)).unwrap();
        registry.register(echo_agent("a3", Capability::SchemaAnalysis)).unwrap();

        let ids: Vec<String> = registry
            .discover_agents(Capability::SchemaAnalysis)
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["a1", "a3"]);
        assert!(registry.discover_agents(Capability::Ticketing).is_empty());
        assert_eq!(registry.discover_tools(Capability::DataQuality).len(), 1);
    }

    #[test]
    fn test_duplicate_agent_leaves_state_untouched() {
        let registry = CapabilityRegistry::new();
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();

        let mut dup = echo_agent("a1", Capability::DataQuality);
        dup.tools[0].name = "other_tool".to_string();
        let err = registry.register(dup).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateAgent { .. }));

        assert!(registry.get_tool("other_tool").is_none());
        assert!(registry.discover_agents(Capability::DataQuality).is_empty());
        assert_eq!(registry.status().total_agents, 1);
    }

    #[test]
    fn test_duplicate_tool_name_rejected() {
        let registry = CapabilityRegistry::new();
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();

        let mut clash = echo_agent("a2", Capability::SchemaAnalysis);
        clash.tools[0].name = ToolDescriptor::scoped_name("echo", "a1");
        let err = registry.register(clash).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateTool { .. }));
        assert!(!registry.contains_agent("a2"));
    }

    #[test]
    fn test_tool_capability_must_be_declared() {
        let registry = CapabilityRegistry::new();
        let mut agent = echo_agent("a1", Capability::SchemaAnalysis);
        agent.tools[0].capability = Capability::MergeExecution;

        let err = registry.register(agent).unwrap_err();
        assert!(matches!(err, OrchestratorError::UndeclaredCapability { .. }));
        assert_eq!(registry.status().total_tools, 0);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = CapabilityRegistry::new();
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();

        assert!(registry.deregister("a1"));
        assert!(!registry.deregister("a1"));
        assert!(registry.discover_tools(Capability::SchemaAnalysis).is_empty());

        // The tool name is free again
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();
    }

    #[tokio::test]
    async fn test_invoke_tool_validates_params() {
        let registry = CapabilityRegistry::new();
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();

        let err = registry
            .invoke_tool("echo@a1", json!({"message": 42}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));

        let out = registry
            .invoke_tool("echo@a1", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(out["echo"], "hi");
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let registry = CapabilityRegistry::new();
        let tool = ToolDescriptor::new(
            "explode",
            Capability::DataQuality,
            ParamSchema::new(),
            ToolHandler::new(|_| async { Err(anyhow::anyhow!("warehouse unreachable")) }),
        );
        registry
            .register(
                AgentDescriptor::new("q1", "quality-agent")
                    .with_capability(Capability::DataQuality)
                    .with_tool(tool),
            )
            .unwrap();

        let err = registry.invoke_tool("explode", json!({})).await.unwrap_err();
        match err {
            OrchestratorError::Invocation { tool, message } => {
                assert_eq!(tool, "explode");
                assert!(message.contains("warehouse unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_capability_without_provider() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .invoke_capability(Capability::MergeExecution, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProvider { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_cycles_providers() {
        let registry = CapabilityRegistry::new();
        for id in ["a1", "a2", "a3"] {
            registry.register(echo_agent(id, Capability::SchemaMapping)).unwrap();
        }

        let mut visits: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            let out = registry
                .invoke_capability(Capability::SchemaMapping, json!({"message": "x"}))
                .await
                .unwrap();
            *visits.entry(out["agent"].as_str().unwrap().to_string()).or_default() += 1;
        }

        assert_eq!(visits.len(), 3);
        let max = visits.values().max().unwrap();
        let min = visits.values().min().unwrap();
        assert!(max - min <= 1, "unfair distribution: {:?}", visits);
    }

    #[test]
    fn test_preferred_provider_keeps_cursor() {
        let registry = CapabilityRegistry::new();
        for id in ["a1", "a2"] {
            registry.register(echo_agent(id, Capability::SchemaMapping)).unwrap();
        }

        let preferred = registry
            .preferred_provider(Capability::SchemaMapping, "a2")
            .unwrap();
        assert_eq!(preferred.agent_id, "a2");
        assert!(registry
            .preferred_provider(Capability::DataQuality, "a2")
            .is_none());
        assert!(registry
            .preferred_provider(Capability::SchemaMapping, "missing")
            .is_none());

        // round robin still starts at the first provider
        let next = registry.next_provider(Capability::SchemaMapping).unwrap();
        assert_eq!(next.agent_id, "a1");
    }

    #[test]
    fn test_tool_catalog_lists_every_tool() {
        let registry = CapabilityRegistry::new();
        registry.register(echo_agent("a1", Capability::SchemaAnalysis)).unwrap();
        let mut described = echo_agent("a2", Capability::DataQuality);
        described.tools[0].description = "Echo a message".to_string();
        registry.register(described).unwrap();

        let catalog = registry.tool_catalog();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].name, "echo@a1");
        assert_eq!(catalog[0].description, "provided by a1");
        assert_eq!(catalog[1].description, "Echo a message (provided by a2)");
        assert_eq!(catalog[1].capability, Capability::DataQuality);
        assert_eq!(catalog[1].parameters["required"], json!(["message"]));
    }
}
