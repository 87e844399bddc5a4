//! Agent adapters
//!
//! Wrap each collaborator into an [`AgentDescriptor`] whose tool decodes the
//! JSON parameters, calls the service and encodes the result.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::{
    ConflictDetectionService, DataQualityService, EscalationRequest, IngestionService,
    MappingService, MergeExecutionService, MergeRequest, ProposedSql, SchemaAnalysisService,
    SqlGenerationService, SqlRequest, TicketReceipt, TicketingService,
};
use crate::registry::{AgentDescriptor, Capability, ParamSchema, ParamType, ToolDescriptor, ToolHandler};
use crate::types::{DatasetRef, FieldMapping, TableSchema};

pub const INGESTION_AGENT: &str = "ingestion-agent";
pub const SCHEMA_AGENT: &str = "schema-agent";
pub const MAPPING_AGENT: &str = "mapping-agent";
pub const CONFLICT_AGENT: &str = "conflict-detector";
pub const SQL_AGENT: &str = "sql-agent";
pub const MERGE_AGENT: &str = "merge-agent";
pub const QUALITY_AGENT: &str = "quality-agent";
pub const TICKETING_AGENT: &str = "ticketing-agent";

pub const TOOL_INGEST: &str = "ingest_file";
pub const TOOL_ANALYZE_SCHEMA: &str = "analyze_schema";
pub const TOOL_PROPOSE_MAPPINGS: &str = "propose_mappings";
pub const TOOL_DETECT_CONFLICTS: &str = "detect_conflicts";
pub const TOOL_GENERATE_SQL: &str = "generate_merge_sql";
pub const TOOL_EXECUTE_MERGE: &str = "execute_merge";
pub const TOOL_VALIDATE: &str = "validate_table";
pub const TOOL_CREATE_ESCALATION: &str = "create_escalation";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestInput {
    pub file_path: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInput {
    pub table_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingInput {
    pub schema_a: TableSchema,
    pub schema_b: TableSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInput {
    pub schema_a: TableSchema,
    pub schema_b: TableSchema,
    pub mappings: Vec<FieldMapping>,
}

/// Build a handler that speaks typed input and output
fn typed<P, R, F, Fut>(f: F) -> ToolHandler
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    ToolHandler::new(move |params: Value| {
        let f = f.clone();
        async move {
            let input: P = serde_json::from_value(params).context("invalid tool input")?;
            let output = (*f)(input).await?;
            Ok(serde_json::to_value(output)?)
        }
    })
}

fn table_schema() -> ParamSchema {
    ParamSchema::new().required("table_ref", ParamType::String, "Warehouse table reference")
}

pub fn ingestion_agent(id: &str, service: Arc<dyn IngestionService>) -> AgentDescriptor {
    let schema = ParamSchema::new()
        .required("file_path", ParamType::String, "Uploaded file")
        .required("session_id", ParamType::String, "Upload session");
    let handler = typed(move |input: IngestInput| {
        let service = service.clone();
        async move {
            service
                .ingest(&DatasetRef::new(input.file_path), &input.session_id)
                .await
        }
    });

    AgentDescriptor::new(id, INGESTION_AGENT)
        .with_capability(Capability::DataIngestion)
        .with_tool(
            ToolDescriptor::new(TOOL_INGEST, Capability::DataIngestion, schema, handler)
                .with_description("Load an uploaded file into a raw table"),
        )
}

pub fn schema_agent(id: &str, service: Arc<dyn SchemaAnalysisService>) -> AgentDescriptor {
    let handler = typed(move |input: TableInput| {
        let service = service.clone();
        async move { service.analyze_schema(&input.table_ref).await }
    });

    AgentDescriptor::new(id, SCHEMA_AGENT)
        .with_capability(Capability::SchemaAnalysis)
        .with_tool(
            ToolDescriptor::new(
                ToolDescriptor::scoped_name(TOOL_ANALYZE_SCHEMA, id),
                Capability::SchemaAnalysis,
                table_schema(),
                handler,
            )
            .with_description("Describe the columns of a table"),
        )
}

/// Factory for schema-analysis pool members
pub fn schema_agent_factory(
    service: Arc<dyn SchemaAnalysisService>,
) -> impl Fn(&str) -> anyhow::Result<AgentDescriptor> {
    move |id: &str| Ok(schema_agent(id, service.clone()))
}

pub fn mapping_agent(id: &str, service: Arc<dyn MappingService>) -> AgentDescriptor {
    let schema = ParamSchema::new()
        .required("schema_a", ParamType::Object, "Source schema")
        .required("schema_b", ParamType::Object, "Target schema");
    let handler = typed(move |input: MappingInput| {
        let service = service.clone();
        async move { service.propose_mappings(&input.schema_a, &input.schema_b).await }
    });

    AgentDescriptor::new(id, MAPPING_AGENT)
        .with_capability(Capability::SchemaMapping)
        .with_tool(
            ToolDescriptor::new(TOOL_PROPOSE_MAPPINGS, Capability::SchemaMapping, schema, handler)
                .with_description("Propose field mappings between two schemas"),
        )
}

pub fn conflict_agent(id: &str, service: Arc<dyn ConflictDetectionService>) -> AgentDescriptor {
    let schema = ParamSchema::new()
        .required("schema_a", ParamType::Object, "Source schema")
        .required("schema_b", ParamType::Object, "Target schema")
        .required("mappings", ParamType::Array, "Proposed mappings");
    let handler = typed(move |input: ConflictInput| {
        let service = service.clone();
        async move {
            service
                .detect_conflicts(&input.schema_a, &input.schema_b, &input.mappings)
                .await
        }
    });

    AgentDescriptor::new(id, CONFLICT_AGENT)
        .with_capability(Capability::ConflictDetection)
        .with_tool(
            ToolDescriptor::new(TOOL_DETECT_CONFLICTS, Capability::ConflictDetection, schema, handler)
                .with_description("Find type and key conflicts in a mapping set"),
        )
}

pub fn sql_agent(id: &str, service: Arc<dyn SqlGenerationService>) -> AgentDescriptor {
    let schema = ParamSchema::new()
        .required("table_a", ParamType::String, "Left table")
        .required("table_b", ParamType::String, "Right table")
        .required("mappings", ParamType::Array, "Working mappings")
        .required("join_type", ParamType::String, "inner, left, right or full_outer");
    let handler = typed(move |input: SqlRequest| {
        let service = service.clone();
        async move {
            let sql = service.generate_merge_sql(&input).await?;
            Ok(ProposedSql { sql })
        }
    });

    AgentDescriptor::new(id, SQL_AGENT)
        .with_capability(Capability::SqlGeneration)
        .with_tool(
            ToolDescriptor::new(TOOL_GENERATE_SQL, Capability::SqlGeneration, schema, handler)
                .with_description("Write the merge statement for review"),
        )
}

pub fn merge_agent(id: &str, service: Arc<dyn MergeExecutionService>) -> AgentDescriptor {
    let schema = ParamSchema::new()
        .required("table_a", ParamType::String, "Left table")
        .required("table_b", ParamType::String, "Right table")
        .required("mappings", ParamType::Array, "Approved mappings")
        .required("join_type", ParamType::String, "inner, left, right or full_outer")
        .required("warehouse_tier", ParamType::String, "Warehouse size")
        .required("sql", ParamType::String, "Reviewed merge statement");
    let handler = typed(move |input: MergeRequest| {
        let service = service.clone();
        async move { service.execute_merge(&input).await }
    });

    AgentDescriptor::new(id, MERGE_AGENT)
        .with_capability(Capability::MergeExecution)
        .with_tool(
            ToolDescriptor::new(
                ToolDescriptor::scoped_name(TOOL_EXECUTE_MERGE, id),
                Capability::MergeExecution,
                schema,
                handler,
            )
            .with_description("Run the reviewed merge statement"),
        )
}

/// Factory for merge pool members
pub fn merge_agent_factory(
    service: Arc<dyn MergeExecutionService>,
) -> impl Fn(&str) -> anyhow::Result<AgentDescriptor> {
    move |id: &str| Ok(merge_agent(id, service.clone()))
}

pub fn quality_agent(id: &str, service: Arc<dyn DataQualityService>) -> AgentDescriptor {
    let handler = typed(move |input: TableInput| {
        let service = service.clone();
        async move { service.validate(&input.table_ref).await }
    });

    AgentDescriptor::new(id, QUALITY_AGENT)
        .with_capability(Capability::DataQuality)
        .with_tool(
            ToolDescriptor::new(TOOL_VALIDATE, Capability::DataQuality, table_schema(), handler)
                .with_description("Run integrity checks on a merged table"),
        )
}

pub fn ticketing_agent(id: &str, service: Arc<dyn TicketingService>) -> AgentDescriptor {
    let schema = ParamSchema::new()
        .required("pipeline_id", ParamType::String, "Paused pipeline")
        .required("session_id", ParamType::String, "Upload session")
        .required("project_key", ParamType::String, "Tracker project")
        .required("conflicts", ParamType::Array, "Conflicts needing review")
        .required("summary", ParamType::Object, "Severity counts");
    let handler = typed(move |input: EscalationRequest| {
        let service = service.clone();
        async move {
            let ticket_id = service.create_escalation(&input).await?;
            Ok(TicketReceipt { ticket_id })
        }
    });

    AgentDescriptor::new(id, TICKETING_AGENT)
        .with_capability(Capability::Ticketing)
        .with_tool(
            ToolDescriptor::new(TOOL_CREATE_ESCALATION, Capability::Ticketing, schema, handler)
                .with_description("Open a review ticket for unresolved conflicts"),
        )
}
