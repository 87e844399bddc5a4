//! Tool invocation router
//!
//! Resolves a tool name or a capability to a registered tool, applies the
//! per-invocation timeout and reports every call on the event bus.
//! Failures are surfaced once; nothing is retried here.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::bus::{EventBus, EventKind};
use crate::registry::{Capability, CapabilityRegistry, ToolInfo};

/// What to invoke
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A specific tool by name
    Tool(String),
    /// Any provider of a capability, chosen round-robin
    Capability(Capability),
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Tool(name) => write!(f, "tool '{}'", name),
            Route::Capability(capability) => write!(f, "{}", capability),
        }
    }
}

/// Who is calling and, optionally, which provider they would like
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Reported on `agent_call` and `agent_response` events
    pub requester: Option<String>,
    /// Used for capability calls when that agent serves the capability;
    /// otherwise the round-robin pick applies
    pub prefer_agent_id: Option<String>,
}

impl CallContext {
    pub fn from_requester(requester: impl Into<String>) -> Self {
        Self {
            requester: Some(requester.into()),
            prefer_agent_id: None,
        }
    }

    pub fn preferring(mut self, agent_id: impl Into<String>) -> Self {
        self.prefer_agent_id = Some(agent_id.into());
        self
    }
}

/// Result of a successful invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub agent_id: String,
    pub capability: Capability,
    pub output: Value,
    pub duration_ms: u64,
}

impl ToolOutcome {
    /// Decode the tool output. A shape mismatch counts as a failed invocation.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.output.clone()).map_err(|e| OrchestratorError::Invocation {
            tool: self.tool.clone(),
            message: format!("malformed output: {}", e),
        })
    }
}

/// Router between callers and the capability registry
pub struct ToolRouter {
    registry: Arc<CapabilityRegistry>,
    events: Arc<EventBus>,
    timeout: Duration,
}

impl ToolRouter {
    pub fn new(registry: Arc<CapabilityRegistry>, events: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            registry,
            events,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke whatever `route` resolves to
    pub async fn route(&self, route: &Route, params: Value) -> Result<ToolOutcome> {
        match route {
            Route::Tool(name) => self.invoke_tool(name, params).await,
            Route::Capability(capability) => self.invoke_capability(*capability, params).await,
        }
    }

    /// Invoke a tool by name
    pub async fn invoke_tool(&self, name: &str, params: Value) -> Result<ToolOutcome> {
        self.invoke_tool_with(name, params, &CallContext::default()).await
    }

    pub async fn invoke_tool_with(
        &self,
        name: &str,
        params: Value,
        context: &CallContext,
    ) -> Result<ToolOutcome> {
        let tool = match self.registry.get_tool(name) {
            Some(tool) => tool,
            None => {
                let err = OrchestratorError::no_provider(format!("tool '{}'", name));
                self.report_error(name, None, &err);
                return Err(err);
            }
        };
        self.dispatch(tool, params, context).await
    }

    /// Invoke the next provider of `capability`
    pub async fn invoke_capability(&self, capability: Capability, params: Value) -> Result<ToolOutcome> {
        self.invoke_capability_with(capability, params, &CallContext::default())
            .await
    }

    /// Invoke a provider of `capability`, honouring the context's preferred agent
    pub async fn invoke_capability_with(
        &self,
        capability: Capability,
        params: Value,
        context: &CallContext,
    ) -> Result<ToolOutcome> {
        let preferred = context
            .prefer_agent_id
            .as_deref()
            .and_then(|agent_id| self.registry.preferred_provider(capability, agent_id));
        let selected = match preferred {
            Some(tool) => Ok(tool),
            None => {
                if let Some(agent_id) = &context.prefer_agent_id {
                    debug!("Preferred agent {} does not serve {}", agent_id, capability);
                }
                self.registry.next_provider(capability)
            }
        };

        let tool = match selected {
            Ok(tool) => tool,
            Err(err) => {
                self.report_error(capability.as_str(), None, &err);
                return Err(err);
            }
        };
        self.dispatch(tool, params, context).await
    }

    async fn dispatch(&self, tool: ToolInfo, params: Value, context: &CallContext) -> Result<ToolOutcome> {
        debug!(
            "Invoking {} on {} for {}",
            tool.name,
            tool.agent_id,
            context.requester.as_deref().unwrap_or("unknown")
        );
        self.events.emit(EventKind::AgentCall {
            tool: tool.name.clone(),
            agent_id: tool.agent_id.clone(),
            capability: tool.capability,
            requester: context.requester.clone(),
        });

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.registry.invoke_tool(&tool.name, params)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                tool: tool.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.events.emit(EventKind::AgentResponse {
                    tool: tool.name.clone(),
                    agent_id: tool.agent_id.clone(),
                    capability: tool.capability,
                    requester: context.requester.clone(),
                    duration_ms,
                });
                Ok(ToolOutcome {
                    tool: tool.name,
                    agent_id: tool.agent_id,
                    capability: tool.capability,
                    output,
                    duration_ms,
                })
            }
            Err(err) => {
                self.report_error(&tool.name, Some(&tool.agent_id), &err);
                Err(err)
            }
        }
    }

    fn report_error(&self, target: &str, agent_id: Option<&str>, err: &OrchestratorError) {
        warn!("Invocation of {} failed: {}", target, err);
        self.events.emit(EventKind::AgentError {
            target: target.to_string(),
            agent_id: agent_id.map(str::to_string),
            error: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentDescriptor, ParamSchema, ParamType, ToolDescriptor, ToolHandler};
    use serde_json::json;

    fn router(timeout: Duration) -> ToolRouter {
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register(
                AgentDescriptor::new("quality-1", "quality-agent")
                    .with_capability(Capability::DataQuality)
                    .with_tool(ToolDescriptor::new(
                        "validate",
                        Capability::DataQuality,
                        ParamSchema::new().required("table_ref", ParamType::String, ""),
                        ToolHandler::new(|params| async move {
                            Ok(json!({"passed": true, "issues": [], "table": params["table_ref"]}))
                        }),
                    ))
                    .with_tool(ToolDescriptor::new(
                        "slow_validate",
                        Capability::DataQuality,
                        ParamSchema::new(),
                        ToolHandler::new(|_| async {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(json!({}))
                        }),
                    )),
            )
            .unwrap();
        ToolRouter::new(registry, Arc::new(EventBus::default()), timeout)
    }

    #[tokio::test]
    async fn test_invoke_tool_emits_events() {
        let router = router(Duration::from_secs(5));
        let outcome = router
            .invoke_tool("validate", json!({"table_ref": "MERGED_1"}))
            .await
            .unwrap();

        assert_eq!(outcome.agent_id, "quality-1");
        assert_eq!(outcome.output["table"], "MERGED_1");

        let history = router.events().history(10);
        assert!(matches!(history[0].kind, EventKind::AgentCall { .. }));
        assert!(matches!(history[1].kind, EventKind::AgentResponse { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let router = router(Duration::from_millis(50));
        let err = router.invoke_tool("slow_validate", json!({})).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Timeout { timeout_ms: 50, .. }));
        assert!(err.to_string().contains("50ms"));
        let last = router.events().history(1).pop().unwrap();
        assert!(matches!(last.kind, EventKind::AgentError { .. }));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let router = router(Duration::from_secs(1));
        let err = router
            .route(&Route::Capability(Capability::MergeExecution), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProvider { .. }));

        let err = router
            .route(&Route::Tool("missing".to_string()), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProvider { .. }));
    }

    #[tokio::test]
    async fn test_parse_malformed_output() {
        #[derive(Debug, serde::Deserialize)]
        struct Report {
            #[allow(dead_code)]
            passed: bool,
        }
        #[derive(Debug, serde::Deserialize)]
        struct Merge {
            #[allow(dead_code)]
            output_table_ref: String,
        }

        let router = router(Duration::from_secs(5));
        let outcome = router
            .invoke_tool("validate", json!({"table_ref": "MERGED_1"}))
            .await
            .unwrap();

        assert!(outcome.parse::<Report>().is_ok());
        let err = outcome.parse::<Merge>().unwrap_err();
        assert!(matches!(err, OrchestratorError::Invocation { .. }));
    }

    #[tokio::test]
    async fn test_requester_is_reported() {
        let router = router(Duration::from_secs(5));
        router
            .invoke_tool_with(
                "validate",
                json!({"table_ref": "MERGED_1"}),
                &CallContext::from_requester("master-orchestrator"),
            )
            .await
            .unwrap();

        let history = router.events().history(10);
        match (&history[0].kind, &history[1].kind) {
            (
                EventKind::AgentCall { requester: call, .. },
                EventKind::AgentResponse { requester: response, .. },
            ) => {
                assert_eq!(call.as_deref(), Some("master-orchestrator"));
                assert_eq!(response.as_deref(), Some("master-orchestrator"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_preferred_agent_wins_over_round_robin() {
        let router = router(Duration::from_secs(5));
        router
            .registry()
            .register(
                AgentDescriptor::new("quality-2", "quality-agent")
                    .with_capability(Capability::DataQuality)
                    .with_tool(ToolDescriptor::new(
                        "validate_2",
                        Capability::DataQuality,
                        ParamSchema::new(),
                        ToolHandler::new(|_| async { Ok(json!({"passed": true})) }),
                    )),
            )
            .unwrap();

        let context = CallContext::default().preferring("quality-2");
        for _ in 0..3 {
            let outcome = router
                .invoke_capability_with(Capability::DataQuality, json!({}), &context)
                .await
                .unwrap();
            assert_eq!(outcome.agent_id, "quality-2");
        }

        // an unknown preference falls back to the round-robin pick
        let outcome = router
            .invoke_capability_with(
                Capability::DataQuality,
                json!({"table_ref": "MERGED_1"}),
                &CallContext::default().preferring("quality-9"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.agent_id, "quality-1");
    }
}
