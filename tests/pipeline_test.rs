//! End-to-end pipeline runs against fixture collaborators

use async_trait::async_trait;
use data_integrator::orchestrator::{
    AllocationPolicy, DatasetProfile, EventKind, Resolution, WarehouseTier,
};
use data_integrator::services::{DataQualityService, SchemaAnalysisService};
use data_integrator::types::{
    Complexity, ConflictCandidate, ConflictKind, DatasetRef, FieldMapping, PipelineRequest,
    QualityReport, Severity, TableSchema,
};
use data_integrator::{
    Collaborators, Config, ErrorKind, Fixture, FixtureServices, MasterOrchestrator, PipelineStage,
};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(fixture: Fixture) -> MasterOrchestrator {
    let services = Arc::new(FixtureServices::new(fixture));
    MasterOrchestrator::new(Config::default(), Collaborators::from_fixture(services)).unwrap()
}

fn confident() -> Fixture {
    let mut fixture = Fixture::demo();
    for mapping in &mut fixture.mappings {
        mapping.confidence = 0.95;
    }
    fixture
}

/// Describes every table except the ones whose reference contains `broken`
struct FlakySchemas {
    inner: Arc<FixtureServices>,
    broken: &'static str,
}

#[async_trait]
impl SchemaAnalysisService for FlakySchemas {
    async fn analyze_schema(&self, table_ref: &str) -> anyhow::Result<TableSchema> {
        if table_ref.contains(self.broken) {
            anyhow::bail!("warehouse rejected DESCRIBE on {}", table_ref);
        }
        self.inner.analyze_schema(table_ref).await
    }
}

/// Takes longer than any sensible invocation timeout
struct StalledQuality;

#[async_trait]
impl DataQualityService for StalledQuality {
    async fn validate(&self, _table_ref: &str) -> anyhow::Result<QualityReport> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(QualityReport {
            passed: true,
            issues: Vec::new(),
        })
    }
}

/// Crashes on the first call
struct CrashingQuality;

#[async_trait]
impl DataQualityService for CrashingQuality {
    async fn validate(&self, table_ref: &str) -> anyhow::Result<QualityReport> {
        panic!("quality engine crashed on {}", table_ref);
    }
}

fn request() -> PipelineRequest {
    PipelineRequest::new(
        "session-e2e",
        DatasetRef::new("uploads/customers_a.csv"),
        DatasetRef::new("uploads/customers_b.csv"),
    )
}

#[tokio::test]
async fn test_demo_pauses_then_completes_after_approval() -> anyhow::Result<()> {
    let orchestrator = orchestrator(Fixture::demo());

    let id = orchestrator.start_pipeline(request())?;
    let paused = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(paused.stage, PipelineStage::AwaitingApproval);
    assert_eq!(paused.artifacts.escalation_ticket.as_deref(), Some("DI-1"));
    let pending: Vec<_> = paused
        .artifacts
        .conflicts
        .iter()
        .filter(|c| !c.is_resolved())
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_field, "region");
    assert_eq!(pending[0].kind, ConflictKind::SemanticAmbiguity);

    let allocation = paused.allocation.expect("allocation decided at upload");
    assert_eq!(allocation.schema_agents, 1);
    assert_eq!(allocation.merge_agents, 1);
    assert_eq!(allocation.warehouse_tier, WarehouseTier::Small);

    // nothing runs while parked
    assert!(orchestrator.pool_status().iter().all(|p| p.terminated));

    // the statement under review is recorded before anyone approves it
    let sql = paused
        .artifacts
        .proposed_sql
        .as_deref()
        .expect("merge SQL proposed before escalation");
    assert!(sql.contains("FULL OUTER JOIN"));
    assert!(sql.contains("ON a.customer_id = b.cust_id"));

    orchestrator.approve_escalation(&id, Vec::new())?;
    let done = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(done.stage, PipelineStage::Completed);
    assert!(done.failure.is_none());
    assert!(done.artifacts.output_table_ref().is_some());
    assert!(done.artifacts.conflicts.iter().all(|c| matches!(
        &c.resolution,
        Some(Resolution::Approved { ticket_id }) if ticket_id == "DI-1"
    )));
    assert_eq!(
        done.visited_stages(),
        vec![
            PipelineStage::Uploaded,
            PipelineStage::AnalyzingSchema,
            PipelineStage::ProposingMapping,
            PipelineStage::ConflictReview,
            PipelineStage::AwaitingApproval,
            PipelineStage::Merging,
            PipelineStage::Validating,
            PipelineStage::Completed,
        ]
    );
    assert_eq!(orchestrator.registry_status().total_agents, 6);

    let history = orchestrator.events().history(1000);
    let escalations = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::EscalationRaised { .. }))
        .count();
    assert_eq!(escalations, 1);

    let calls: Vec<_> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::AgentCall { requester, .. } => Some(requester.as_deref()),
            _ => None,
        })
        .collect();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|r| *r == Some("master-orchestrator")));

    Ok(())
}

#[tokio::test]
async fn test_critical_conflict_always_needs_approval() -> anyhow::Result<()> {
    let mut fixture = Fixture::demo();
    for mapping in &mut fixture.mappings {
        mapping.confidence = 0.99;
    }
    fixture.conflicts.push(ConflictCandidate {
        source_field: "customer_id".to_string(),
        target_field: "cust_id".to_string(),
        kind: ConflictKind::DuplicateKey,
        severity: Some(Severity::Critical),
        confidence: 0.99,
        description: "ids overlap with different customers".to_string(),
    });
    let orchestrator = orchestrator(fixture);

    let id = orchestrator.start_pipeline(request())?;
    let state = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(state.stage, PipelineStage::AwaitingApproval);
    assert!(state
        .artifacts
        .conflicts
        .iter()
        .any(|c| c.severity == Severity::Critical && !c.is_resolved()));
    assert!(state.artifacts.merge.is_none());

    Ok(())
}

#[tokio::test]
async fn test_approval_with_replacement_mappings() -> anyhow::Result<()> {
    let orchestrator = orchestrator(Fixture::demo());

    let id = orchestrator.start_pipeline(request())?;
    orchestrator.wait_until_settled(&id).await?;

    let resolved = vec![
        FieldMapping::new("customer_id", "cust_id", 1.0),
        FieldMapping::new("email", "email_address", 1.0),
    ];
    orchestrator.approve_escalation(&id, resolved.clone())?;
    let done = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(done.stage, PipelineStage::Completed);
    assert_eq!(done.artifacts.mappings, resolved);
    // regenerated for the replaced set, so the dropped region column is gone
    let sql = done.artifacts.proposed_sql.as_deref().unwrap_or_default();
    assert!(!sql.contains("region"));
    assert!(sql.contains("email_address"));

    // a second approval is refused once the run has moved on
    assert!(orchestrator.approve_escalation(&id, Vec::new()).is_err());

    Ok(())
}

#[tokio::test]
async fn test_concurrent_pipelines_are_independent() -> anyhow::Result<()> {
    let orchestrator = orchestrator(Fixture::demo());

    let first = orchestrator.start_pipeline(request())?;
    let second = orchestrator.start_pipeline(
        request().with_overrides(vec![FieldMapping::new("region", "territory", 1.0)]),
    )?;
    assert_ne!(first, second);

    let (a, b) = tokio::join!(
        orchestrator.wait_until_settled(&first),
        orchestrator.wait_until_settled(&second)
    );
    assert_eq!(a?.stage, PipelineStage::AwaitingApproval);
    assert_eq!(b?.stage, PipelineStage::Completed);
    assert_eq!(orchestrator.list_pipelines().len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_schema_failure_on_second_table_fails_run() -> anyhow::Result<()> {
    let services = Arc::new(FixtureServices::new(confident()));
    let collaborators = Collaborators::from_fixture(services.clone()).with_schema_analysis(
        Arc::new(FlakySchemas {
            inner: services,
            broken: "CUSTOMERS_B",
        }),
    );
    let orchestrator = MasterOrchestrator::new(Config::default(), collaborators)?;

    let id = orchestrator.start_pipeline(request())?;
    let state = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(state.stage, PipelineStage::Failed);
    let failure = state.failure.expect("failure report");
    assert_eq!(failure.stage, PipelineStage::AnalyzingSchema);
    assert_eq!(failure.kind, ErrorKind::Invocation);
    assert!(failure.message.contains("DESCRIBE"));
    assert!(state.artifacts.schemas.is_empty());

    // the schema pool is gone and only the singletons are left
    assert!(!orchestrator.pool_status().is_empty());
    assert!(orchestrator.pool_status().iter().all(|p| p.terminated));
    assert_eq!(orchestrator.registry_status().total_agents, 6);

    Ok(())
}

#[tokio::test]
async fn test_stalled_collaborator_times_out_the_run() -> anyhow::Result<()> {
    let mut config = Config::default();
    config.orchestrator.invocation_timeout_secs = 1;
    let services = Arc::new(FixtureServices::new(confident()));
    let collaborators = Collaborators::from_fixture(services).with_quality(Arc::new(StalledQuality));
    let orchestrator = MasterOrchestrator::new(config, collaborators)?;

    let id = orchestrator.start_pipeline(request())?;
    let state = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(state.stage, PipelineStage::Failed);
    let failure = state.failure.expect("failure report");
    assert_eq!(failure.stage, PipelineStage::Validating);
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert!(failure.message.contains("1000ms"));
    assert!(state.artifacts.merge.is_some());

    Ok(())
}

#[tokio::test]
async fn test_crashing_collaborator_fails_run_instead_of_hanging() -> anyhow::Result<()> {
    let services = Arc::new(FixtureServices::new(confident()));
    let collaborators = Collaborators::from_fixture(services).with_quality(Arc::new(CrashingQuality));
    let orchestrator = MasterOrchestrator::new(Config::default(), collaborators)?;

    let id = orchestrator.start_pipeline(request())?;
    let state = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_until_settled(&id))
        .await??;

    assert_eq!(state.stage, PipelineStage::Failed);
    let failure = state.failure.expect("failure report");
    assert_eq!(failure.stage, PipelineStage::Validating);
    assert_eq!(failure.kind, ErrorKind::Internal);
    assert!(failure.message.contains("quality engine crashed"));

    // the orchestrator keeps serving other runs
    let next = orchestrator.start_pipeline(request())?;
    let state = orchestrator.wait_until_settled(&next).await?;
    assert_eq!(state.stage, PipelineStage::Failed);
    assert_eq!(orchestrator.list_pipelines().len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_row_count_overflow_fails_at_upload() -> anyhow::Result<()> {
    let mut fixture = confident();
    for dataset in fixture.datasets.values_mut() {
        dataset.rows = u64::MAX;
    }
    let orchestrator = orchestrator(fixture);

    let id = orchestrator.start_pipeline(request())?;
    let state = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(state.stage, PipelineStage::Failed);
    let failure = state.failure.expect("failure report");
    assert_eq!(failure.stage, PipelineStage::Uploaded);
    assert_eq!(failure.kind, ErrorKind::Allocation);
    assert!(state.allocation.is_none());
    assert!(orchestrator.pool_status().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_out_of_range_confidence_is_rejected() -> anyhow::Result<()> {
    let mut fixture = confident();
    fixture.mappings[0].confidence = 1.5;
    let orchestrator = orchestrator(fixture);

    let id = orchestrator.start_pipeline(request())?;
    let state = orchestrator.wait_until_settled(&id).await?;

    assert_eq!(state.stage, PipelineStage::Failed);
    let failure = state.failure.expect("failure report");
    assert_eq!(failure.stage, PipelineStage::ProposingMapping);
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert!(failure.message.contains("outside [0, 1]"));

    Ok(())
}

#[tokio::test]
async fn test_finished_runs_can_be_forgotten() -> anyhow::Result<()> {
    let orchestrator = orchestrator(confident());

    let id = orchestrator.start_pipeline(request())?;
    orchestrator.wait_until_settled(&id).await?;
    assert_eq!(orchestrator.list_pipelines().len(), 1);

    let last = orchestrator.forget_pipeline(&id)?;
    assert_eq!(last.stage, PipelineStage::Completed);
    assert!(orchestrator.list_pipelines().is_empty());
    assert!(orchestrator.forget_pipeline(&id).is_err());

    Ok(())
}

#[test]
fn test_allocation_reference_points() {
    let policy = AllocationPolicy::default();
    let decide = |rows, complexity| {
        policy
            .decide(DatasetProfile {
                row_count: rows,
                column_count: 10,
                complexity,
            })
            .unwrap()
    };

    let small = decide(5_000, Complexity::Low);
    assert_eq!((small.schema_agents, small.merge_agents), (1, 1));
    assert_eq!(small.warehouse_tier, WarehouseTier::Small);

    let mid = decide(50_000, Complexity::High);
    assert_eq!((mid.schema_agents, mid.merge_agents), (2, 5));
    assert_eq!(mid.warehouse_tier, WarehouseTier::Large);

    let huge = decide(5_000_000, Complexity::Low);
    assert_eq!((huge.schema_agents, huge.merge_agents), (3, 10));
    assert_eq!(huge.warehouse_tier, WarehouseTier::XLarge);
}
