//! Agent and tool descriptors
//!
//! An agent is a logical unit that declares capabilities and exposes tools.
//! Each tool carries an async handler bound to the agent instance that owns it.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use super::capability::Capability;
use super::schema::ParamSchema;

type HandlerFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Callable bound to the owning agent instance
#[derive(Clone)]
pub struct ToolHandler {
    inner: Arc<HandlerFn>,
}

impl ToolHandler {
    /// Wrap an async closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |params| f(params).boxed()),
        }
    }

    /// Run the handler
    pub fn call(&self, params: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.inner)(params)
    }
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ToolHandler(..)")
    }
}

/// A single named, schema-validated operation exposed by an agent
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Unique within the registry
    pub name: String,
    pub description: String,
    pub capability: Capability,
    pub schema: ParamSchema,
    pub handler: ToolHandler,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        capability: Capability,
        schema: ParamSchema,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capability,
            schema,
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Tool name made unique per agent instance, e.g. `analyze_schema@schema-agent-1a2b3c4d-001`
    pub fn scoped_name(base: &str, agent_id: &str) -> String {
        format!("{}@{}", base, agent_id)
    }

    pub fn info(&self, agent_id: &str) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            capability: self.capability,
            schema: self.schema.clone(),
            agent_id: agent_id.to_string(),
        }
    }
}

/// Handler-free view of a registered tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub capability: Capability,
    pub schema: ParamSchema,
    pub agent_id: String,
}

/// Identity, capabilities and tools of one agent instance
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: String,
    /// Logical type, e.g. `merge-agent`
    pub agent_type: String,
    pub capabilities: BTreeSet<Capability>,
    pub tools: Vec<ToolDescriptor>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_tool(mut self, tool: ToolDescriptor) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn claims(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.iter().copied().collect(),
            tools: self.tools.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

/// Handler-free view of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: String,
    pub capabilities: Vec<Capability>,
    pub tools: Vec<String>,
}
