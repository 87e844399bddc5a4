//! Multi-agent orchestration module
//!
//! Router, event bus, agent pools, allocation and escalation policies and
//! the master orchestrator that drives a pipeline run.

pub mod allocation;
pub mod bus;
pub mod escalation;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod router;

// Re-export commonly used types
pub use allocation::{AllocationPolicy, DatasetProfile, ResourceAllocationDecision, WarehouseTier};
pub use bus::{Event, EventBus, EventKind};
pub use escalation::{ConflictRecord, EscalationPolicy, MappingProposal, Resolution, SeveritySummary};
pub use orchestrator::MasterOrchestrator;
pub use pipeline::{FailureReport, PipelineStage, PipelineState, StepRecord};
pub use pool::{AgentPoolManager, MemberState, PoolHandle, PoolStatus};
pub use router::{CallContext, Route, ToolOutcome, ToolRouter};
