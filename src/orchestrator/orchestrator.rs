//! Master orchestrator
//!
//! Drives each pipeline run through its stages on a background task. The
//! task owns the run state and is its only writer; callers see snapshots
//! published on a `watch` channel. A run that needs human approval parks
//! itself and is picked up again by [`MasterOrchestrator::approve_escalation`].

use futures::future::try_join;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::allocation::{AllocationPolicy, DatasetProfile};
use crate::orchestrator::bus::{EventBus, EventKind};
use crate::orchestrator::escalation::{
    self, apply_overrides, approve_all, summarize, EscalationPolicy, MappingProposal,
};
use crate::orchestrator::pipeline::{PipelineStage, PipelineState};
use crate::orchestrator::pool::{AgentPoolManager, PoolHandle, PoolStatus};
use crate::orchestrator::router::{CallContext, ToolOutcome, ToolRouter};
use crate::registry::{Capability, CapabilityRegistry, RegistryStatus};
use crate::services::agents::{
    self, ConflictInput, IngestInput, MappingInput, TableInput, MERGE_AGENT, SCHEMA_AGENT,
};
use crate::services::{
    Collaborators, EscalationRequest, MergeRequest, ProposedSql, SqlRequest, TicketReceipt,
};
use crate::types::{
    ConflictCandidate, FieldMapping, IngestedTable, MergeOutcome, PipelineRequest, QualityReport,
    TableSchema,
};

/// Requester id the orchestrator puts on its agent calls
const ORCHESTRATOR_ID: &str = "master-orchestrator";

/// Working set of one run, owned by whoever is driving it
struct PipelineRun {
    state: PipelineState,
    tx: watch::Sender<PipelineState>,
    /// Detector output waiting for classification
    candidates: Vec<ConflictCandidate>,
    /// Pools that must be torn down if the run fails
    pools: Vec<PoolHandle>,
}

impl PipelineRun {
    fn publish(&self) {
        self.tx.send_replace(self.state.clone());
    }
}

struct RunSlot {
    status: watch::Receiver<PipelineState>,
    /// Present while the run is parked in `awaiting_approval`
    suspended: Option<PipelineRun>,
}

/// Decoded tool output plus who produced it
struct Invoked<T> {
    value: T,
    agent_id: String,
    tool: String,
    duration_ms: u64,
}

impl<T: DeserializeOwned> Invoked<T> {
    fn from_outcome(outcome: ToolOutcome) -> Result<Self> {
        Ok(Self {
            value: outcome.parse()?,
            agent_id: outcome.agent_id,
            tool: outcome.tool,
            duration_ms: outcome.duration_ms,
        })
    }
}

struct Inner {
    config: Config,
    router: Arc<ToolRouter>,
    pools: AgentPoolManager,
    collaborators: Collaborators,
    allocation: AllocationPolicy,
    escalation: EscalationPolicy,
    runs: RwLock<HashMap<String, RunSlot>>,
}

/// Entry point for pipeline runs
#[derive(Clone)]
pub struct MasterOrchestrator {
    inner: Arc<Inner>,
}

impl MasterOrchestrator {
    /// Create an orchestrator with a fresh registry
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        Self::with_registry(config, collaborators, Arc::new(CapabilityRegistry::new()))
    }

    /// Create an orchestrator on an existing registry and register the
    /// singleton agents for ingestion, mapping, conflict detection, SQL
    /// generation, quality and ticketing.
    pub fn with_registry(
        config: Config,
        collaborators: Collaborators,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self> {
        let events = Arc::new(EventBus::new(config.events.history_limit));
        let router = Arc::new(ToolRouter::new(
            registry.clone(),
            events,
            Duration::from_secs(config.orchestrator.invocation_timeout_secs),
        ));

        registry.register(agents::ingestion_agent(
            &singleton_id(agents::INGESTION_AGENT),
            collaborators.ingestion.clone(),
        ))?;
        registry.register(agents::mapping_agent(
            &singleton_id(agents::MAPPING_AGENT),
            collaborators.mapping.clone(),
        ))?;
        if let Some(detector) = &collaborators.conflict_detection {
            registry.register(agents::conflict_agent(
                &singleton_id(agents::CONFLICT_AGENT),
                detector.clone(),
            ))?;
        }
        registry.register(agents::sql_agent(
            &singleton_id(agents::SQL_AGENT),
            collaborators.sql_generation.clone(),
        ))?;
        registry.register(agents::quality_agent(
            &singleton_id(agents::QUALITY_AGENT),
            collaborators.quality.clone(),
        ))?;
        registry.register(agents::ticketing_agent(
            &singleton_id(agents::TICKETING_AGENT),
            collaborators.ticketing.clone(),
        ))?;

        let allocation = AllocationPolicy::new(
            config.orchestrator.max_schema_agents,
            config.orchestrator.max_merge_agents,
        );
        let escalation = EscalationPolicy::new(
            config.escalation.confidence_threshold,
            config.escalation.escalate_severities.clone(),
        );

        info!("Orchestrator ready with {} agents", registry.status().total_agents);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pools: AgentPoolManager::new(router.clone()),
                router,
                collaborators,
                allocation,
                escalation,
                runs: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Start a run in the background and return its id
    pub fn start_pipeline(&self, request: PipelineRequest) -> Result<String> {
        let pipeline_id = format!("pipe-{}", Uuid::new_v4().simple());
        let state = PipelineState::new(&pipeline_id, request);
        let (tx, rx) = watch::channel(state.clone());

        self.inner.write_runs().insert(
            pipeline_id.clone(),
            RunSlot {
                status: rx,
                suspended: None,
            },
        );
        info!("Started pipeline {} for session {}", pipeline_id, state.session_id);

        let run = PipelineRun {
            state,
            tx,
            candidates: Vec::new(),
            pools: Vec::new(),
        };
        tokio::spawn(drive(self.inner.clone(), run));
        Ok(pipeline_id)
    }

    /// Latest snapshot of a run
    pub fn get_pipeline_status(&self, pipeline_id: &str) -> Result<PipelineState> {
        let runs = self.inner.read_runs();
        let slot = runs.get(pipeline_id).ok_or_else(|| unknown(pipeline_id))?;
        let state = slot.status.borrow().clone();
        Ok(state)
    }

    /// Snapshots of every run, oldest first
    pub fn list_pipelines(&self) -> Vec<PipelineState> {
        let mut states: Vec<PipelineState> = self
            .inner
            .read_runs()
            .values()
            .map(|slot| slot.status.borrow().clone())
            .collect();
        states.sort_by_key(|s| s.created_at);
        states
    }

    /// Wait until the run completes, fails or pauses for approval
    pub async fn wait_until_settled(&self, pipeline_id: &str) -> Result<PipelineState> {
        let mut rx = {
            let runs = self.inner.read_runs();
            runs.get(pipeline_id)
                .ok_or_else(|| unknown(pipeline_id))?
                .status
                .clone()
        };

        let settled = rx
            .wait_for(|state| state.stage.is_settled())
            .await
            .map(|state| state.clone());
        match settled {
            Ok(state) => Ok(state),
            Err(_) => {
                // The driving task is gone; only a settled snapshot is an answer.
                let state = rx.borrow().clone();
                if state.stage.is_settled() {
                    Ok(state)
                } else {
                    Err(OrchestratorError::Internal {
                        message: format!(
                            "pipeline {} stopped in {} before settling",
                            pipeline_id, state.stage
                        ),
                    })
                }
            }
        }
    }

    /// Drop a completed or failed run and return its final snapshot
    pub fn forget_pipeline(&self, pipeline_id: &str) -> Result<PipelineState> {
        let mut runs = self.inner.write_runs();
        let state = runs
            .get(pipeline_id)
            .ok_or_else(|| unknown(pipeline_id))?
            .status
            .borrow()
            .clone();
        if !state.stage.is_terminal() {
            return Err(OrchestratorError::PipelineActive {
                pipeline_id: pipeline_id.to_string(),
                stage: state.stage,
            });
        }
        runs.remove(pipeline_id);
        debug!("Forgot pipeline {}", pipeline_id);
        Ok(state)
    }

    /// Resume a parked run with the human-adjudicated mapping set.
    ///
    /// Every unresolved conflict is marked approved under the escalation
    /// ticket. An empty `resolved_mappings` keeps the current working set.
    pub fn approve_escalation(
        &self,
        pipeline_id: &str,
        resolved_mappings: Vec<FieldMapping>,
    ) -> Result<()> {
        let mut run = {
            let mut runs = self.inner.write_runs();
            let slot = runs.get_mut(pipeline_id).ok_or_else(|| unknown(pipeline_id))?;
            match slot.suspended.take() {
                Some(run) => run,
                None => {
                    return Err(OrchestratorError::NotAwaitingApproval {
                        pipeline_id: pipeline_id.to_string(),
                        stage: slot.status.borrow().stage,
                    })
                }
            }
        };

        let ticket_id = run
            .state
            .artifacts
            .escalation_ticket
            .clone()
            .unwrap_or_else(|| "manual".to_string());
        let approved = approve_all(&mut run.state.artifacts.conflicts, &ticket_id);
        if !resolved_mappings.is_empty() {
            run.state.artifacts.mappings = resolved_mappings;
            // Written for the replaced set; regenerated before merging.
            run.state.artifacts.proposed_sql = None;
        }
        run.state.record_step(
            None,
            0,
            format!("{} conflicts approved under {}", approved, ticket_id),
        );
        info!("Pipeline {} approved under {}", pipeline_id, ticket_id);

        if let Err(err) = self.inner.advance(&mut run, PipelineStage::Merging) {
            // Put it back so the caller can inspect it.
            self.inner.park(run);
            return Err(err);
        }
        tokio::spawn(drive(self.inner.clone(), run));
        Ok(())
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.inner.router.registry()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.inner.router.events()
    }

    pub fn registry_status(&self) -> RegistryStatus {
        self.registry().status()
    }

    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.inner.pools.status()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Terminate every pool still alive
    pub fn shutdown(&self) {
        self.inner.pools.shutdown();
    }
}

fn singleton_id(agent_type: &str) -> String {
    format!("{}-001", agent_type)
}

fn unknown(pipeline_id: &str) -> OrchestratorError {
    OrchestratorError::UnknownPipeline {
        pipeline_id: pipeline_id.to_string(),
    }
}

/// Run stages until the pipeline settles. A panicking stage fails the run
/// instead of taking the task down with it.
async fn drive(inner: Arc<Inner>, mut run: PipelineRun) {
    loop {
        let stage = run.state.stage;
        let step = match stage {
            PipelineStage::AwaitingApproval => {
                inner.park(run);
                return;
            }
            PipelineStage::Completed | PipelineStage::Failed => {
                inner.finish(run);
                return;
            }
            _ => AssertUnwindSafe(inner.step(&mut run, stage))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(OrchestratorError::Internal {
                        message: panic_message(payload.as_ref()),
                    })
                }),
        };

        if let Err(err) = step {
            inner.fail(&mut run, err.at_stage(stage));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("stage panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("stage panicked: {}", message)
    } else {
        "stage panicked".to_string()
    }
}

/// References of the two ingested tables, in request order
fn table_refs(tables: &[IngestedTable]) -> Result<(String, String)> {
    match tables {
        [a, b] => Ok((a.table_ref.clone(), b.table_ref.clone())),
        other => Err(OrchestratorError::Allocation {
            message: format!("expected two ingested tables, found {}", other.len()),
        }),
    }
}

impl Inner {
    fn read_runs(&self) -> RwLockReadGuard<'_, HashMap<String, RunSlot>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_runs(&self) -> RwLockWriteGuard<'_, HashMap<String, RunSlot>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn events(&self) -> &EventBus {
        self.router.events()
    }

    fn context(&self) -> CallContext {
        CallContext::from_requester(ORCHESTRATOR_ID)
    }

    async fn step(&self, run: &mut PipelineRun, stage: PipelineStage) -> Result<()> {
        match stage {
            PipelineStage::Uploaded => self.ingest(run).await,
            PipelineStage::AnalyzingSchema => self.analyze_schemas(run).await,
            PipelineStage::ProposingMapping => self.propose_mappings(run).await,
            PipelineStage::ConflictReview => self.review_conflicts(run).await,
            PipelineStage::Merging => self.merge(run).await,
            PipelineStage::Validating => self.validate(run).await,
            settled => Err(OrchestratorError::InvalidTransition {
                from: settled,
                to: settled,
            }),
        }
    }

    /// Transition and publish. Settled stages are published by `park` or `finish`.
    fn advance(&self, run: &mut PipelineRun, next: PipelineStage) -> Result<()> {
        let from = run.state.transition(next)?;
        info!("Pipeline {}: {} -> {}", run.state.pipeline_id, from, next);
        self.events().emit(EventKind::StageChanged {
            pipeline_id: run.state.pipeline_id.clone(),
            from,
            to: next,
        });
        if !next.is_settled() {
            run.publish();
        }
        Ok(())
    }

    fn fail(&self, run: &mut PipelineRun, err: OrchestratorError) {
        warn!("Pipeline {} failed: {}", run.state.pipeline_id, err);
        for handle in run.pools.drain(..) {
            if let Err(e) = self.pools.terminate_pool(&handle) {
                debug!("Pool {} already gone: {}", handle.pool_id, e);
            }
        }
        match run.state.fail(&err) {
            Ok(from) => self.events().emit(EventKind::StageChanged {
                pipeline_id: run.state.pipeline_id.clone(),
                from,
                to: PipelineStage::Failed,
            }),
            Err(e) => warn!("Could not mark pipeline {} failed: {}", run.state.pipeline_id, e),
        }
    }

    /// Publish the paused snapshot and keep the run for `approve_escalation`.
    /// Both happen under the runs lock so an approval never sees one without the other.
    fn park(&self, run: PipelineRun) {
        let pipeline_id = run.state.pipeline_id.clone();
        let stage = run.state.stage;
        let mut runs = self.write_runs();
        run.publish();
        if let Some(slot) = runs.get_mut(&pipeline_id) {
            slot.suspended = Some(run);
        }
        drop(runs);

        info!("Pipeline {} waiting for approval", pipeline_id);
        self.events().emit(EventKind::PipelineSettled { pipeline_id, stage });
    }

    fn finish(&self, run: PipelineRun) {
        run.publish();
        info!("Pipeline {} settled in {}", run.state.pipeline_id, run.state.stage);
        self.events().emit(EventKind::PipelineSettled {
            pipeline_id: run.state.pipeline_id.clone(),
            stage: run.state.stage,
        });
    }

    async fn call<P, R>(&self, capability: Capability, input: &P) -> Result<Invoked<R>>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = encode(capability.as_str(), input)?;
        let outcome = self
            .router
            .invoke_capability_with(capability, params, &self.context())
            .await?;
        Invoked::from_outcome(outcome)
    }

    async fn call_pool<P, R>(&self, handle: &PoolHandle, input: &P) -> Result<Invoked<R>>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = encode(&handle.pool_type, input)?;
        let outcome = self
            .pools
            .invoke_on_pool_with(handle, params, &self.context())
            .await?;
        Invoked::from_outcome(outcome)
    }

    fn release(&self, run: &mut PipelineRun, handle: &PoolHandle) {
        run.pools.retain(|h| h != handle);
        if let Err(e) = self.pools.terminate_pool(handle) {
            warn!("Failed to terminate pool {}: {}", handle.pool_id, e);
        }
    }

    /// uploaded: ingest both datasets, decide the allocation, spawn the schema pool
    async fn ingest(&self, run: &mut PipelineRun) -> Result<()> {
        let request = &run.state.request;
        let input_a = IngestInput {
            file_path: request.dataset_a.path.clone(),
            session_id: request.session_id.clone(),
        };
        let input_b = IngestInput {
            file_path: request.dataset_b.path.clone(),
            session_id: request.session_id.clone(),
        };

        let (a, b): (Invoked<IngestedTable>, Invoked<IngestedTable>) = try_join(
            self.call(Capability::DataIngestion, &input_a),
            self.call(Capability::DataIngestion, &input_b),
        )
        .await?;

        for table in [a, b] {
            run.state.record_step(
                Some(table.agent_id),
                table.duration_ms,
                format!(
                    "{} ingested {} ({} rows, {} columns)",
                    table.tool, table.value.table_ref, table.value.row_count, table.value.column_count
                ),
            );
            run.state.artifacts.tables.push(table.value);
        }

        let profile = DatasetProfile::from_tables(&run.state.artifacts.tables)?;
        let decision = self.allocation.decide(profile)?;
        run.state.allocation = Some(decision);
        run.state.record_step(
            None,
            0,
            format!(
                "allocated {} schema agents, {} merge agents, {} warehouse",
                decision.schema_agents, decision.merge_agents, decision.warehouse_tier
            ),
        );

        let handle = self.pools.spawn_pool(
            SCHEMA_AGENT,
            decision.schema_agents,
            agents::schema_agent_factory(self.collaborators.schema_analysis.clone()),
        )?;
        run.pools.push(handle);

        self.advance(run, PipelineStage::AnalyzingSchema)
    }

    /// analyzing_schema: one batch over the schema pool, a task per dataset
    async fn analyze_schemas(&self, run: &mut PipelineRun) -> Result<()> {
        let handle = run
            .pools
            .iter()
            .find(|h| h.pool_type == SCHEMA_AGENT)
            .cloned()
            .ok_or_else(|| OrchestratorError::no_provider("schema-analysis pool"))?;
        let (ref_a, ref_b) = table_refs(&run.state.artifacts.tables)?;
        let tasks = vec![
            encode(SCHEMA_AGENT, &TableInput { table_ref: ref_a })?,
            encode(SCHEMA_AGENT, &TableInput { table_ref: ref_b })?,
        ];

        let result = self
            .pools
            .invoke_batch_on_pool(&handle, tasks, &self.context())
            .await;
        self.release(run, &handle);

        for outcome in result? {
            let schema: Invoked<TableSchema> = Invoked::from_outcome(outcome)?;
            run.state.record_step(
                Some(schema.agent_id),
                schema.duration_ms,
                format!(
                    "{} described {} ({} columns)",
                    schema.tool,
                    schema.value.table_ref,
                    schema.value.columns.len()
                ),
            );
            run.state.artifacts.schemas.push(schema.value);
        }

        self.advance(run, PipelineStage::ProposingMapping)
    }

    /// proposing_mapping: ask for mappings, then for conflicts if a detector is registered
    async fn propose_mappings(&self, run: &mut PipelineRun) -> Result<()> {
        let (schema_a, schema_b) = match run.state.artifacts.schemas.as_slice() {
            [a, b] => (a.clone(), b.clone()),
            other => {
                return Err(OrchestratorError::no_provider(format!(
                    "mapping input ({} schemas)",
                    other.len()
                )))
            }
        };

        let mapping_input = MappingInput { schema_a, schema_b };
        let mappings: Invoked<Vec<FieldMapping>> =
            self.call(Capability::SchemaMapping, &mapping_input).await?;
        check_confidences(&mappings.tool, &mappings.value, &[])?;
        run.state.record_step(
            Some(mappings.agent_id),
            mappings.duration_ms,
            format!("{} proposed {} mappings", mappings.tool, mappings.value.len()),
        );

        let has_detector = !self
            .router
            .registry()
            .discover_tools(Capability::ConflictDetection)
            .is_empty();
        if has_detector {
            let conflict_input = ConflictInput {
                schema_a: mapping_input.schema_a,
                schema_b: mapping_input.schema_b,
                mappings: mappings.value.clone(),
            };
            let candidates: Invoked<Vec<ConflictCandidate>> =
                self.call(Capability::ConflictDetection, &conflict_input).await?;
            check_confidences(&candidates.tool, &[], &candidates.value)?;
            run.state.record_step(
                Some(candidates.agent_id),
                candidates.duration_ms,
                format!("{} reported {} conflicts", candidates.tool, candidates.value.len()),
            );
            run.candidates = candidates.value;
        }

        run.state.artifacts.mappings = mappings.value;
        self.advance(run, PipelineStage::ConflictReview)
    }

    /// conflict_review: classify, apply overrides, escalate if needed
    async fn review_conflicts(&self, run: &mut PipelineRun) -> Result<()> {
        let proposal = MappingProposal {
            mappings: run.state.artifacts.mappings.clone(),
            candidates: std::mem::take(&mut run.candidates),
        };
        let mut conflicts = self.escalation.classify(&proposal);
        apply_overrides(
            &mut run.state.artifacts.mappings,
            &mut conflicts,
            &run.state.request.mapping_overrides,
        );

        let summary = summarize(&conflicts);
        run.state.record_step(
            None,
            0,
            format!(
                "{} conflicts ({} critical, {} high, {} medium, {} low)",
                summary.total(),
                summary.critical,
                summary.high,
                summary.medium,
                summary.low
            ),
        );

        self.propose_sql(run).await?;

        let needs_approval = self.escalation.requires_approval(&conflicts);
        let pending: Vec<_> = self
            .escalation
            .pending(&conflicts)
            .into_iter()
            .cloned()
            .collect();
        run.state.artifacts.conflicts = conflicts;

        if !needs_approval {
            return self.advance(run, PipelineStage::Merging);
        }

        let request = EscalationRequest {
            pipeline_id: run.state.pipeline_id.clone(),
            session_id: run.state.session_id.clone(),
            project_key: self.config.escalation.ticket_project_key.clone(),
            conflicts: pending,
            summary,
            proposed_sql: run.state.artifacts.proposed_sql.clone(),
        };
        let receipt: Invoked<TicketReceipt> = self.call(Capability::Ticketing, &request).await?;
        let ticket_id = receipt.value.ticket_id;

        run.state.record_step(
            Some(receipt.agent_id),
            receipt.duration_ms,
            format!("escalated {} conflicts as {}", request.conflicts.len(), ticket_id),
        );
        run.state.artifacts.escalation_ticket = Some(ticket_id.clone());
        info!(
            "Pipeline {} escalated {} conflicts as {}",
            run.state.pipeline_id,
            request.conflicts.len(),
            ticket_id
        );
        self.events().emit(EventKind::EscalationRaised {
            pipeline_id: run.state.pipeline_id.clone(),
            ticket_id,
            conflicts: request.conflicts.len(),
        });

        self.advance(run, PipelineStage::AwaitingApproval)
    }

    /// Generate the merge statement for the working mapping set
    async fn propose_sql(&self, run: &mut PipelineRun) -> Result<String> {
        let (table_a, table_b) = table_refs(&run.state.artifacts.tables)?;
        let request = SqlRequest {
            table_a,
            table_b,
            mappings: run.state.artifacts.mappings.clone(),
            join_type: run.state.request.join_type,
        };
        let proposed: Invoked<ProposedSql> =
            self.call(Capability::SqlGeneration, &request).await?;
        run.state.record_step(
            Some(proposed.agent_id),
            proposed.duration_ms,
            format!(
                "{} wrote merge SQL for {} mappings",
                proposed.tool,
                request.mappings.len()
            ),
        );
        run.state.artifacts.proposed_sql = Some(proposed.value.sql.clone());
        Ok(proposed.value.sql)
    }

    /// merging: spawn the merge pool sized by the allocation and run the merge once
    async fn merge(&self, run: &mut PipelineRun) -> Result<()> {
        let decision = run.state.allocation.ok_or_else(|| OrchestratorError::Allocation {
            message: "no allocation recorded for this run".to_string(),
        })?;
        let sql = match run.state.artifacts.proposed_sql.clone() {
            Some(sql) => sql,
            None => self.propose_sql(run).await?,
        };
        let (table_a, table_b) = table_refs(&run.state.artifacts.tables)?;
        let request = MergeRequest {
            table_a,
            table_b,
            mappings: run.state.artifacts.mappings.clone(),
            join_type: run.state.request.join_type,
            warehouse_tier: decision.warehouse_tier,
            sql,
        };

        let handle = self.pools.spawn_pool(
            MERGE_AGENT,
            decision.merge_agents,
            agents::merge_agent_factory(self.collaborators.merge.clone()),
        )?;
        run.pools.push(handle.clone());

        let result: Result<Invoked<MergeOutcome>> = self.call_pool(&handle, &request).await;
        self.release(run, &handle);
        let merged = result?;

        run.state.record_step(
            Some(merged.agent_id),
            merged.duration_ms,
            format!(
                "{} wrote {} ({} rows, {} join)",
                merged.tool, merged.value.output_table_ref, merged.value.row_count, request.join_type
            ),
        );
        run.state.artifacts.merge = Some(merged.value);

        self.advance(run, PipelineStage::Validating)
    }

    /// validating: warnings are kept, a failed check fails the run
    async fn validate(&self, run: &mut PipelineRun) -> Result<()> {
        let table_ref = run
            .state
            .artifacts
            .output_table_ref()
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::no_provider("merged table"))?;

        let report: Invoked<QualityReport> = self
            .call(Capability::DataQuality, &TableInput { table_ref })
            .await?;
        run.state.record_step(
            Some(report.agent_id),
            report.duration_ms,
            format!(
                "{} {} with {} issues",
                report.tool,
                if report.value.passed { "passed" } else { "rejected" },
                report.value.issues.len()
            ),
        );
        run.state.artifacts.quality = Some(report.value.clone());

        if !report.value.passed {
            return Err(OrchestratorError::Invocation {
                tool: report.tool,
                message: format!("quality check failed: {}", report.value.issues.join("; ")),
            });
        }

        run.state.warnings = report.value.issues;
        self.advance(run, PipelineStage::Completed)
    }
}

/// Confidences from collaborators must be probabilities
fn check_confidences(
    tool: &str,
    mappings: &[FieldMapping],
    candidates: &[ConflictCandidate],
) -> Result<()> {
    escalation::check_confidences(mappings, candidates).map_err(|message| {
        OrchestratorError::Validation {
            tool: tool.to_string(),
            message,
        }
    })
}

fn encode<P: Serialize + ?Sized>(target: &str, input: &P) -> Result<serde_json::Value> {
    serde_json::to_value(input).map_err(|e| OrchestratorError::Validation {
        tool: target.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Fixture, FixtureServices, MockTicketingService};
    use crate::types::DatasetRef;

    fn request() -> PipelineRequest {
        PipelineRequest::new(
            "session-1",
            DatasetRef::new("customers_a.csv"),
            DatasetRef::new("customers_b.csv"),
        )
    }

    fn orchestrator(fixture: Fixture) -> MasterOrchestrator {
        let services = Arc::new(FixtureServices::new(fixture));
        MasterOrchestrator::new(Config::default(), Collaborators::from_fixture(services)).unwrap()
    }

    #[test]
    fn test_singletons_registered() {
        let orchestrator = orchestrator(Fixture::demo());
        let status = orchestrator.registry_status();
        assert_eq!(status.total_agents, 6);
        assert!(status.agents.contains(&"ingestion-agent-001".to_string()));
        assert!(status.agents.contains(&"sql-agent-001".to_string()));
    }

    #[tokio::test]
    async fn test_confident_run_completes_without_approval() {
        let mut fixture = Fixture::demo();
        for mapping in &mut fixture.mappings {
            mapping.confidence = 0.95;
        }
        let orchestrator = orchestrator(fixture);

        let id = orchestrator.start_pipeline(request()).unwrap();
        let state = orchestrator.wait_until_settled(&id).await.unwrap();

        assert_eq!(state.stage, PipelineStage::Completed);
        assert!(!state.visited_stages().contains(&PipelineStage::AwaitingApproval));
        assert_eq!(state.artifacts.schemas.len(), 2);
        assert!(state.artifacts.output_table_ref().is_some());
        assert_eq!(orchestrator.inner.pools.active_pools(), 0);
        // only the singletons remain registered
        assert_eq!(orchestrator.registry_status().total_agents, 6);
        let sql = state.artifacts.proposed_sql.unwrap();
        assert!(sql.contains("FULL OUTER JOIN"));
    }

    #[tokio::test]
    async fn test_override_pre_approves_ambiguous_mapping() {
        let orchestrator = orchestrator(Fixture::demo());
        let request =
            request().with_overrides(vec![FieldMapping::new("region", "territory", 1.0)]);

        let id = orchestrator.start_pipeline(request).unwrap();
        let state = orchestrator.wait_until_settled(&id).await.unwrap();

        assert_eq!(state.stage, PipelineStage::Completed);
        assert_eq!(state.artifacts.conflicts.len(), 1);
        assert!(state.artifacts.conflicts[0].is_resolved());
    }

    #[tokio::test]
    async fn test_ticketing_failure_fails_run() {
        let mut ticketing = MockTicketingService::new();
        ticketing
            .expect_create_escalation()
            .returning(|_| Err(anyhow::anyhow!("tracker offline")));

        let services = Arc::new(FixtureServices::new(Fixture::demo()));
        let collaborators =
            Collaborators::from_fixture(services).with_ticketing(Arc::new(ticketing));
        let orchestrator = MasterOrchestrator::new(Config::default(), collaborators).unwrap();

        let id = orchestrator.start_pipeline(request()).unwrap();
        let state = orchestrator.wait_until_settled(&id).await.unwrap();

        assert_eq!(state.stage, PipelineStage::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.stage, PipelineStage::ConflictReview);
        assert_eq!(failure.kind, crate::error::ErrorKind::Invocation);
    }

    #[tokio::test]
    async fn test_approve_requires_pause() {
        let mut fixture = Fixture::demo();
        for mapping in &mut fixture.mappings {
            mapping.confidence = 0.95;
        }
        let orchestrator = orchestrator(fixture);

        let err = orchestrator.approve_escalation("pipe-missing", vec![]).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPipeline { .. }));

        let id = orchestrator.start_pipeline(request()).unwrap();
        orchestrator.wait_until_settled(&id).await.unwrap();
        let err = orchestrator.approve_escalation(&id, vec![]).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotAwaitingApproval { .. }));
    }

    #[tokio::test]
    async fn test_quality_failure_fails_run() {
        let mut fixture = Fixture::demo();
        for mapping in &mut fixture.mappings {
            mapping.confidence = 0.95;
        }
        fixture.quality = QualityReport {
            passed: false,
            issues: vec!["duplicate primary keys".to_string()],
        };
        let orchestrator = orchestrator(fixture);

        let id = orchestrator.start_pipeline(request()).unwrap();
        let state = orchestrator.wait_until_settled(&id).await.unwrap();

        assert_eq!(state.stage, PipelineStage::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.stage, PipelineStage::Validating);
        assert!(failure.message.contains("duplicate primary keys"));
    }

    #[tokio::test]
    async fn test_unknown_dataset_fails_in_uploaded() {
        let orchestrator = orchestrator(Fixture::demo());
        let request = PipelineRequest::new(
            "session-1",
            DatasetRef::new("customers_a.csv"),
            DatasetRef::new("nope.csv"),
        );

        let id = orchestrator.start_pipeline(request).unwrap();
        let state = orchestrator.wait_until_settled(&id).await.unwrap();

        assert_eq!(state.stage, PipelineStage::Failed);
        assert_eq!(state.failure.unwrap().stage, PipelineStage::Uploaded);
        assert!(state.allocation.is_none());
    }

    #[tokio::test]
    async fn test_forget_only_finished_runs() {
        let orchestrator = orchestrator(Fixture::demo());
        let err = orchestrator.forget_pipeline("pipe-missing").unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPipeline { .. }));

        let id = orchestrator.start_pipeline(request()).unwrap();
        let paused = orchestrator.wait_until_settled(&id).await.unwrap();
        assert_eq!(paused.stage, PipelineStage::AwaitingApproval);
        let err = orchestrator.forget_pipeline(&id).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PipelineActive {
                stage: PipelineStage::AwaitingApproval,
                ..
            }
        ));

        orchestrator.approve_escalation(&id, vec![]).unwrap();
        orchestrator.wait_until_settled(&id).await.unwrap();
        let last = orchestrator.forget_pipeline(&id).unwrap();
        assert_eq!(last.stage, PipelineStage::Completed);
        assert!(orchestrator.list_pipelines().is_empty());
        assert!(orchestrator.get_pipeline_status(&id).is_err());
    }

    #[tokio::test]
    async fn test_wait_reports_run_that_never_settled() {
        let orchestrator = orchestrator(Fixture::demo());
        let state = PipelineState::new("pipe-orphan", request());
        let (tx, rx) = watch::channel(state);
        orchestrator.inner.write_runs().insert(
            "pipe-orphan".to_string(),
            RunSlot {
                status: rx,
                suspended: None,
            },
        );
        drop(tx);

        let err = orchestrator.wait_until_settled("pipe-orphan").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Internal { .. }));
        assert!(err.to_string().contains("before settling"));
    }

    #[test]
    fn test_panic_message_reads_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "stage panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new(format!("row {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "stage panicked: row 7");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "stage panicked");
    }
}
