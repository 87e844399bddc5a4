//! Data Integrator - agent orchestration core
//!
//! Coordinates a fleet of agents that merge two uploaded datasets:
//! - Capability registry with schema-validated tools
//! - Invocation router with per-call timeouts and an event bus
//! - Agent pools sized by a deterministic allocation policy
//! - Conflict escalation that pauses a run for human approval
//! - Pipeline state machine driven by the master orchestrator
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use data_integrator::{Collaborators, Config, Fixture, FixtureServices, MasterOrchestrator};
//! use data_integrator::types::{DatasetRef, PipelineRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let services = Arc::new(FixtureServices::new(Fixture::demo()));
//!     let orchestrator = MasterOrchestrator::new(Config::default(), Collaborators::from_fixture(services))?;
//!     let id = orchestrator.start_pipeline(PipelineRequest::new(
//!         "session-1",
//!         DatasetRef::new("customers_a.csv"),
//!         DatasetRef::new("customers_b.csv"),
//!     ))?;
//!     let state = orchestrator.wait_until_settled(&id).await?;
//!     println!("{}", state.stage);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod types;
pub mod error;
pub mod config;
pub mod registry;
pub mod orchestrator;
pub mod services;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;

pub use error::{ErrorKind, OrchestratorError, Result};

pub use registry::{
    AgentDescriptor,
    Capability,
    CapabilityRegistry,
    ParamSchema,
    ParamType,
    ToolDescriptor,
    ToolHandler,
};

pub use orchestrator::{
    AgentPoolManager,
    MasterOrchestrator,
    PipelineStage,
    PipelineState,
    ToolRouter,
};

pub use services::{Collaborators, Fixture, FixtureServices};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - agent orchestration core", NAME, VERSION)
}
