//! Pipeline state
//!
//! Stages of the dataset-merge workflow, the forward-only transition rules
//! between them and the snapshot the orchestrator publishes for each run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::orchestrator::allocation::ResourceAllocationDecision;
use crate::orchestrator::escalation::ConflictRecord;
use crate::types::{
    FieldMapping, IngestedTable, MergeOutcome, PipelineRequest, QualityReport, TableSchema,
};

/// Stage of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Uploaded,
    AnalyzingSchema,
    ProposingMapping,
    ConflictReview,
    /// Sub-state of conflict review: paused until a human approves
    AwaitingApproval,
    Merging,
    Validating,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Uploaded => "uploaded",
            PipelineStage::AnalyzingSchema => "analyzing_schema",
            PipelineStage::ProposingMapping => "proposing_mapping",
            PipelineStage::ConflictReview => "conflict_review",
            PipelineStage::AwaitingApproval => "awaiting_approval",
            PipelineStage::Merging => "merging",
            PipelineStage::Validating => "validating",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed)
    }

    /// Terminal, or paused waiting for an external decision
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == PipelineStage::AwaitingApproval
    }

    /// Whether the state machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Uploaded, AnalyzingSchema)
                | (AnalyzingSchema, ProposingMapping)
                | (ProposingMapping, ConflictReview)
                | (ConflictReview, AwaitingApproval)
                | (ConflictReview, Merging)
                | (AwaitingApproval, Merging)
                | (Merging, Validating)
                | (Validating, Completed)
        )
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only step log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub seq: u32,
    pub stage: PipelineStage,
    /// Agent that did the work, absent for stage transitions
    pub agent_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub detail: String,
}

/// Artifacts produced along the way
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineArtifacts {
    pub tables: Vec<IngestedTable>,
    pub schemas: Vec<TableSchema>,
    /// Working mapping set; replaced by the approved set after escalation
    pub mappings: Vec<FieldMapping>,
    pub conflicts: Vec<ConflictRecord>,
    /// Merge statement generated for the working mapping set
    #[serde(default)]
    pub proposed_sql: Option<String>,
    pub escalation_ticket: Option<String>,
    pub merge: Option<MergeOutcome>,
    pub quality: Option<QualityReport>,
}

impl PipelineArtifacts {
    pub fn output_table_ref(&self) -> Option<&str> {
        self.merge.as_ref().map(|m| m.output_table_ref.as_str())
    }
}

/// Why a run ended in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Stage that was running when the error surfaced
    pub stage: PipelineStage,
    pub kind: ErrorKind,
    pub message: String,
}

/// Snapshot of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub session_id: String,
    pub stage: PipelineStage,
    pub request: PipelineRequest,
    pub steps: Vec<StepRecord>,
    pub artifacts: PipelineArtifacts,
    pub allocation: Option<ResourceAllocationDecision>,
    /// Non-blocking quality findings
    pub warnings: Vec<String>,
    pub failure: Option<FailureReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(pipeline_id: impl Into<String>, request: PipelineRequest) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            session_id: request.session_id.clone(),
            stage: PipelineStage::Uploaded,
            request,
            steps: Vec::new(),
            artifacts: PipelineArtifacts::default(),
            allocation: None,
            warnings: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, logging the transition. Returns the previous stage.
    pub fn transition(&mut self, next: PipelineStage) -> Result<PipelineStage> {
        let from = self.stage;
        if !from.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition { from, to: next });
        }
        self.stage = next;
        self.push_step(None, 0, format!("{} -> {}", from, next));
        Ok(from)
    }

    /// Log work done by an agent in the current stage
    pub fn record_step(
        &mut self,
        agent_id: Option<String>,
        duration_ms: u64,
        detail: impl Into<String>,
    ) {
        self.push_step(agent_id, duration_ms, detail.into());
    }

    /// Move to `failed`, keeping the stage that was running in the report
    pub fn fail(&mut self, error: &OrchestratorError) -> Result<PipelineStage> {
        let stage = match error {
            OrchestratorError::PipelineFailed { stage, .. } => *stage,
            _ => self.stage,
        };
        let message = match error {
            OrchestratorError::PipelineFailed { source, .. } => source.to_string(),
            other => other.to_string(),
        };
        let from = self.transition(PipelineStage::Failed)?;
        self.failure = Some(FailureReport {
            stage,
            kind: error.kind(),
            message,
        });
        Ok(from)
    }

    /// Stages entered so far, in order, starting with `uploaded`
    pub fn visited_stages(&self) -> Vec<PipelineStage> {
        let mut stages = vec![PipelineStage::Uploaded];
        let mut last = PipelineStage::Uploaded;
        for step in &self.steps {
            if step.stage != last {
                stages.push(step.stage);
                last = step.stage;
            }
        }
        stages
    }

    fn push_step(&mut self, agent_id: Option<String>, duration_ms: u64, detail: String) {
        let now = Utc::now();
        self.steps.push(StepRecord {
            seq: self.steps.len() as u32 + 1,
            stage: self.stage,
            agent_id,
            started_at: now,
            duration_ms,
            detail,
        });
        self.updated_at = now;
    }
}
