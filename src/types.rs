//! Shared types used across modules
//!
//! Data exchanged with the external collaborators and carried in the
//! pipeline state. Kept here so the registry, services and orchestrator
//! modules do not depend on each other for plain data.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Schema complexity as reported by the schema-analysis collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Complexity::Low),
            "medium" | "med" => Ok(Complexity::Medium),
            "high" => Ok(Complexity::High),
            other => Err(format!("unknown complexity '{}' (expected low, medium or high)", other)),
        }
    }
}

/// Requested merge semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    #[default]
    FullOuter,
}

impl std::fmt::Display for JoinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinType::Inner => write!(f, "inner"),
            JoinType::Left => write!(f, "left"),
            JoinType::Right => write!(f, "right"),
            JoinType::FullOuter => write!(f, "full_outer"),
        }
    }
}

impl JoinType {
    /// SQL join keyword
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT OUTER JOIN",
            JoinType::Right => "RIGHT OUTER JOIN",
            JoinType::FullOuter => "FULL OUTER JOIN",
        }
    }
}

impl FromStr for JoinType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full_outer" | "full" | "outer" => Ok(JoinType::FullOuter),
            other => Err(format!("unknown join type '{}'", other)),
        }
    }
}

/// Severity of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Kind of a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    TypeMismatch,
    DuplicateKey,
    SemanticAmbiguity,
    MissingField,
}

impl ConflictKind {
    /// Severity used when the detector did not rate the conflict itself
    pub fn default_severity(&self) -> Severity {
        match self {
            ConflictKind::TypeMismatch => Severity::High,
            ConflictKind::DuplicateKey => Severity::High,
            ConflictKind::SemanticAmbiguity => Severity::Medium,
            ConflictKind::MissingField => Severity::Critical,
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::TypeMismatch => write!(f, "type-mismatch"),
            ConflictKind::DuplicateKey => write!(f, "duplicate-key"),
            ConflictKind::SemanticAmbiguity => write!(f, "semantic-ambiguity"),
            ConflictKind::MissingField => write!(f, "missing-field"),
        }
    }
}

/// Reference to one uploaded input dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Location of the uploaded file, as understood by the ingestion service
    pub path: String,
}

impl DatasetRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Result of ingesting one dataset into the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedTable {
    pub table_ref: String,
    pub row_count: u64,
    pub column_count: u32,
    /// Complexity detected during ingestion (nested/variant columns), if any
    #[serde(default)]
    pub complexity_hint: Option<Complexity>,
}

/// One column of an analysed table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Schema of an ingested table as understood by the schema-analysis service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_ref: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub complexity_hint: Complexity,
}

/// A proposed or approved column mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub confidence: f64,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>, confidence: f64) -> Self {
        Self {
            source_field: source.into(),
            target_field: target.into(),
            confidence,
        }
    }
}

/// Conflict reported by the conflict-detection collaborator, before classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCandidate {
    pub source_field: String,
    pub target_field: String,
    pub kind: ConflictKind,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default = "default_candidate_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

fn default_candidate_confidence() -> f64 {
    1.0
}

/// Result of executing the merge in the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub output_table_ref: String,
    pub row_count: u64,
}

/// Result of validating the merged table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Request to run one pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub session_id: String,
    pub dataset_a: DatasetRef,
    pub dataset_b: DatasetRef,
    #[serde(default)]
    pub join_type: JoinType,
    /// Mappings fixed by a human ahead of time; they win over proposals for the same source field
    #[serde(default)]
    pub mapping_overrides: Vec<FieldMapping>,
}

impl PipelineRequest {
    pub fn new(session_id: impl Into<String>, dataset_a: DatasetRef, dataset_b: DatasetRef) -> Self {
        Self {
            session_id: session_id.into(),
            dataset_a,
            dataset_b,
            join_type: JoinType::default(),
            mapping_overrides: Vec::new(),
        }
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn with_overrides(mut self, overrides: Vec<FieldMapping>) -> Self {
        self.mapping_overrides = overrides;
        self
    }
}
