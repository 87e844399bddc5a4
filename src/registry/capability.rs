//! Capability tag set
//!
//! Capabilities are a closed set: adding one means adding a variant here.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A category of work an agent can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Load an uploaded file into the warehouse
    DataIngestion,
    /// Describe the columns of an ingested table
    SchemaAnalysis,
    /// Propose column mappings between two schemas
    SchemaMapping,
    /// Report conflicts between two schemas and a mapping set
    ConflictDetection,
    /// Produce merge SQL
    SqlGeneration,
    /// Run the merge in the warehouse
    MergeExecution,
    /// Validate a merged table
    DataQuality,
    /// Open an escalation ticket for human review
    Ticketing,
}

impl Capability {
    /// Every capability, in declaration order
    pub const ALL: [Capability; 8] = [
        Capability::DataIngestion,
        Capability::SchemaAnalysis,
        Capability::SchemaMapping,
        Capability::ConflictDetection,
        Capability::SqlGeneration,
        Capability::MergeExecution,
        Capability::DataQuality,
        Capability::Ticketing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DataIngestion => "data-ingestion",
            Capability::SchemaAnalysis => "schema-analysis",
            Capability::SchemaMapping => "schema-mapping",
            Capability::ConflictDetection => "conflict-detection",
            Capability::SqlGeneration => "sql-generation",
            Capability::MergeExecution => "merge-execution",
            Capability::DataQuality => "data-quality",
            Capability::Ticketing => "ticketing",
        }
    }

    /// One-line description for listings
    pub fn description(&self) -> &'static str {
        match self {
            Capability::DataIngestion => "Ingest an uploaded dataset into the warehouse",
            Capability::SchemaAnalysis => "Analyse the schema of an ingested table",
            Capability::SchemaMapping => "Propose column mappings between two schemas",
            Capability::ConflictDetection => "Detect conflicts between mapped schemas",
            Capability::SqlGeneration => "Generate merge SQL",
            Capability::MergeExecution => "Execute a merge in the warehouse",
            Capability::DataQuality => "Validate a merged table",
            Capability::Ticketing => "Escalate conflicts for human review",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}
