//! Conflict escalation policy
//!
//! Turns a mapping proposal into classified conflict records and decides
//! whether a human has to approve the mapping set before merging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::types::{ConflictCandidate, ConflictKind, FieldMapping, Severity};

/// Mappings below this confidence are considered highly ambiguous
const LOW_CONFIDENCE: f64 = 0.50;

/// Mapping candidates plus any conflicts the detection service reported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingProposal {
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub candidates: Vec<ConflictCandidate>,
}

/// How a conflict was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    /// Covered by an override supplied with the request
    PreApproved,
    /// Adjudicated through an escalation ticket
    Approved { ticket_id: String },
}

/// A classified conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub source_field: String,
    pub target_field: String,
    pub kind: ConflictKind,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    fn touches(&self, field: &str) -> bool {
        self.source_field == field
    }
}

/// Count of conflicts per severity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeveritySummary {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}

/// Escalation rules
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub confidence_threshold: f64,
    /// Severities that always need approval
    pub escalate_severities: Vec<Severity>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            escalate_severities: vec![Severity::Critical, Severity::High],
        }
    }
}

impl EscalationPolicy {
    pub fn new(confidence_threshold: f64, escalate_severities: Vec<Severity>) -> Self {
        Self {
            confidence_threshold,
            escalate_severities,
        }
    }

    /// Classify a proposal into conflict records
    pub fn classify(&self, proposal: &MappingProposal) -> Vec<ConflictRecord> {
        let mut records = Vec::new();

        for candidate in &proposal.candidates {
            let severity = candidate
                .severity
                .unwrap_or_else(|| candidate.kind.default_severity());
            push_record(
                &mut records,
                &candidate.source_field,
                &candidate.target_field,
                candidate.kind,
                severity,
                candidate.confidence,
                candidate.description.clone(),
            );
        }

        for mapping in &proposal.mappings {
            if mapping.confidence < self.confidence_threshold {
                let severity = if mapping.confidence < LOW_CONFIDENCE {
                    Severity::High
                } else {
                    Severity::Medium
                };
                push_record(
                    &mut records,
                    &mapping.source_field,
                    &mapping.target_field,
                    ConflictKind::SemanticAmbiguity,
                    severity,
                    mapping.confidence,
                    format!(
                        "mapping {} -> {} has confidence {:.2}",
                        mapping.source_field, mapping.target_field, mapping.confidence
                    ),
                );
            }
        }

        let mut first_source: HashMap<&str, &str> = HashMap::new();
        for mapping in &proposal.mappings {
            match first_source.get(mapping.target_field.as_str()).copied() {
                Some(first) => push_record(
                    &mut records,
                    &mapping.source_field,
                    &mapping.target_field,
                    ConflictKind::DuplicateKey,
                    Severity::High,
                    mapping.confidence,
                    format!(
                        "{} and {} both map to {}",
                        first, mapping.source_field, mapping.target_field
                    ),
                ),
                None => {
                    first_source.insert(&mapping.target_field, &mapping.source_field);
                }
            }
        }

        debug!("Classified {} conflicts", records.len());
        records
    }

    /// Whether any unresolved conflict needs human approval
    pub fn requires_approval(&self, conflicts: &[ConflictRecord]) -> bool {
        conflicts.iter().any(|c| self.needs_approval(c))
    }

    /// Unresolved conflicts that need approval
    pub fn pending<'a>(&self, conflicts: &'a [ConflictRecord]) -> Vec<&'a ConflictRecord> {
        conflicts.iter().filter(|c| self.needs_approval(c)).collect()
    }

    fn needs_approval(&self, conflict: &ConflictRecord) -> bool {
        !conflict.is_resolved()
            && (conflict.confidence < self.confidence_threshold
                || self.escalate_severities.contains(&conflict.severity))
    }
}

fn push_record(
    records: &mut Vec<ConflictRecord>,
    source_field: &str,
    target_field: &str,
    kind: ConflictKind,
    severity: Severity,
    confidence: f64,
    description: String,
) {
    records.push(ConflictRecord {
        id: format!("conflict-{:03}", records.len() + 1),
        source_field: source_field.to_string(),
        target_field: target_field.to_string(),
        kind,
        severity,
        confidence,
        description,
        resolution: None,
    });
}

/// Reject confidences that are not finite or fall outside `[0, 1]`
pub fn check_confidences(
    mappings: &[FieldMapping],
    candidates: &[ConflictCandidate],
) -> std::result::Result<(), String> {
    let mappings = mappings
        .iter()
        .map(|m| ("mapping", &m.source_field, &m.target_field, m.confidence));
    let candidates = candidates
        .iter()
        .map(|c| ("conflict", &c.source_field, &c.target_field, c.confidence));

    for (what, source, target, confidence) in mappings.chain(candidates) {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!(
                "{what} {source} -> {target} has confidence {confidence} outside [0, 1]"
            ));
        }
    }
    Ok(())
}

/// Apply request overrides: each replaces the proposed mapping for the same
/// source field (or is appended) and pre-approves conflicts on that field.
pub fn apply_overrides(
    mappings: &mut Vec<FieldMapping>,
    conflicts: &mut [ConflictRecord],
    overrides: &[FieldMapping],
) {
    for mapping in overrides {
        match mappings
            .iter()
            .position(|m| m.source_field == mapping.source_field)
        {
            Some(index) => mappings[index] = mapping.clone(),
            None => mappings.push(mapping.clone()),
        }

        for conflict in conflicts.iter_mut() {
            if conflict.touches(&mapping.source_field) && !conflict.is_resolved() {
                conflict.resolution = Some(Resolution::PreApproved);
            }
        }
    }
}

/// Mark every unresolved conflict as approved under `ticket_id`
pub fn approve_all(conflicts: &mut [ConflictRecord], ticket_id: &str) -> usize {
    let mut approved = 0;
    for conflict in conflicts.iter_mut().filter(|c| !c.is_resolved()) {
        conflict.resolution = Some(Resolution::Approved {
            ticket_id: ticket_id.to_string(),
        });
        approved += 1;
    }
    approved
}

/// Count conflicts per severity
pub fn summarize(conflicts: &[ConflictRecord]) -> SeveritySummary {
    let mut summary = SeveritySummary::default();
    for conflict in conflicts {
        match conflict.severity {
            Severity::Critical => summary.critical += 1,
            Severity::High => summary.high += 1,
            Severity::Medium => summary.medium += 1,
            Severity::Low => summary.low += 1,
        }
    }
    summary
}
