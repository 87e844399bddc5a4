//! Capability registry module
//!
//! Registration, discovery and invocation routing for agents and their tools.

pub mod capability;
pub mod descriptor;
pub mod registry;
pub mod schema;

pub use capability::Capability;
pub use descriptor::{AgentDescriptor, AgentInfo, ToolDescriptor, ToolHandler, ToolInfo};
pub use registry::{CapabilityRegistry, RegistryStatus, ToolSpec};
pub use schema::{ParamField, ParamSchema, ParamType};
