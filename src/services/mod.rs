//! External collaborators
//!
//! The orchestration core never talks to a warehouse, an inference service
//! or an issue tracker directly. Each of those sits behind one of the traits
//! below and is exposed to the registry as an agent by [`agents`].

pub mod agents;
pub mod fixture;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::orchestrator::allocation::WarehouseTier;
use crate::orchestrator::escalation::{ConflictRecord, SeveritySummary};
use crate::types::{
    ConflictCandidate, DatasetRef, FieldMapping, IngestedTable, JoinType, MergeOutcome,
    QualityReport, TableSchema,
};

pub use fixture::{Fixture, FixtureServices};

/// Loads an uploaded file into the warehouse
#[async_trait]
pub trait IngestionService: Send + Sync {
    async fn ingest(&self, dataset: &DatasetRef, session_id: &str) -> anyhow::Result<IngestedTable>;
}

/// Describes the columns of an ingested table
#[async_trait]
pub trait SchemaAnalysisService: Send + Sync {
    async fn analyze_schema(&self, table_ref: &str) -> anyhow::Result<TableSchema>;
}

/// Proposes source-to-target field mappings
#[async_trait]
pub trait MappingService: Send + Sync {
    async fn propose_mappings(
        &self,
        schema_a: &TableSchema,
        schema_b: &TableSchema,
    ) -> anyhow::Result<Vec<FieldMapping>>;
}

/// Reports conflicts in a proposed mapping set
#[async_trait]
pub trait ConflictDetectionService: Send + Sync {
    async fn detect_conflicts(
        &self,
        schema_a: &TableSchema,
        schema_b: &TableSchema,
        mappings: &[FieldMapping],
    ) -> anyhow::Result<Vec<ConflictCandidate>>;
}

/// Input of SQL generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlRequest {
    pub table_a: String,
    pub table_b: String,
    pub mappings: Vec<FieldMapping>,
    pub join_type: JoinType,
}

/// Merge statement proposed for review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedSql {
    pub sql: String,
}

/// Writes the merge statement for a mapping set
#[async_trait]
pub trait SqlGenerationService: Send + Sync {
    async fn generate_merge_sql(&self, request: &SqlRequest) -> anyhow::Result<String>;
}

/// Input of a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub table_a: String,
    pub table_b: String,
    pub mappings: Vec<FieldMapping>,
    pub join_type: JoinType,
    pub warehouse_tier: WarehouseTier,
    /// Statement produced by SQL generation
    pub sql: String,
}

/// Runs the merge in the warehouse
#[async_trait]
pub trait MergeExecutionService: Send + Sync {
    async fn execute_merge(&self, request: &MergeRequest) -> anyhow::Result<MergeOutcome>;
}

/// Checks the merged table
#[async_trait]
pub trait DataQualityService: Send + Sync {
    async fn validate(&self, table_ref: &str) -> anyhow::Result<QualityReport>;
}

/// Context sent along with an escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub pipeline_id: String,
    pub session_id: String,
    pub project_key: String,
    pub conflicts: Vec<ConflictRecord>,
    pub summary: SeveritySummary,
    /// Merge statement shown for approval alongside the conflicts
    #[serde(default)]
    pub proposed_sql: Option<String>,
}

/// Ticket created for an escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReceipt {
    pub ticket_id: String,
}

/// Opens a ticket for human review
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TicketingService: Send + Sync {
    async fn create_escalation(&self, request: &EscalationRequest) -> anyhow::Result<String>;
}

/// Every collaborator the orchestrator needs
#[derive(Clone)]
pub struct Collaborators {
    pub ingestion: Arc<dyn IngestionService>,
    pub schema_analysis: Arc<dyn SchemaAnalysisService>,
    pub mapping: Arc<dyn MappingService>,
    /// Optional: without it only mapping confidence drives escalation
    pub conflict_detection: Option<Arc<dyn ConflictDetectionService>>,
    pub sql_generation: Arc<dyn SqlGenerationService>,
    pub merge: Arc<dyn MergeExecutionService>,
    pub quality: Arc<dyn DataQualityService>,
    pub ticketing: Arc<dyn TicketingService>,
}

impl Collaborators {
    /// Use one fixture for every collaborator
    pub fn from_fixture(services: Arc<FixtureServices>) -> Self {
        Self {
            ingestion: services.clone(),
            schema_analysis: services.clone(),
            mapping: services.clone(),
            conflict_detection: Some(services.clone()),
            sql_generation: services.clone(),
            merge: services.clone(),
            quality: services.clone(),
            ticketing: services,
        }
    }

    pub fn with_schema_analysis(mut self, schema_analysis: Arc<dyn SchemaAnalysisService>) -> Self {
        self.schema_analysis = schema_analysis;
        self
    }

    pub fn with_sql_generation(mut self, sql_generation: Arc<dyn SqlGenerationService>) -> Self {
        self.sql_generation = sql_generation;
        self
    }

    pub fn with_ticketing(mut self, ticketing: Arc<dyn TicketingService>) -> Self {
        self.ticketing = ticketing;
        self
    }

    pub fn with_quality(mut self, quality: Arc<dyn DataQualityService>) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_merge(mut self, merge: Arc<dyn MergeExecutionService>) -> Self {
        self.merge = merge;
        self
    }

    pub fn without_conflict_detection(mut self) -> Self {
        self.conflict_detection = None;
        self
    }
}
