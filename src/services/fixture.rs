//! In-memory collaborators
//!
//! A fixture describes the uploaded datasets, the mappings the inference
//! service would propose and the verdict of the quality check. It backs the
//! CLI demo and the tests; no warehouse is touched.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{
    ConflictDetectionService, DataQualityService, EscalationRequest, IngestionService,
    MappingService, MergeExecutionService, MergeRequest, SchemaAnalysisService,
    SqlGenerationService, SqlRequest, TicketingService,
};
use crate::types::{
    ColumnInfo, Complexity, ConflictCandidate, ConflictKind, DatasetRef, FieldMapping,
    IngestedTable, JoinType, MergeOutcome, QualityReport, TableSchema,
};

/// One uploaded dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFixture {
    pub rows: u64,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    pub columns: Vec<ColumnInfo>,
}

/// Canned collaborator behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Keyed by file path or file name
    pub datasets: BTreeMap<String, DatasetFixture>,
    /// Proposed mappings; same-name columns are matched when empty
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    /// Extra conflicts reported by the detector
    #[serde(default)]
    pub conflicts: Vec<ConflictCandidate>,
    #[serde(default = "passing_report")]
    pub quality: QualityReport,
    /// Simulated latency of every call
    #[serde(default)]
    pub latency_ms: u64,
}

fn passing_report() -> QualityReport {
    QualityReport {
        passed: true,
        issues: Vec::new(),
    }
}

impl Fixture {
    /// Load from a JSON or YAML file, chosen by extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yaml::from_str(&content).context("Failed to parse fixture YAML")
        } else {
            serde_json::from_str(&content).context("Failed to parse fixture JSON")
        }
    }

    /// Two eight-column customer extracts, one mapping the inference
    /// service is unsure about
    pub fn demo() -> Self {
        let columns_a = [
            ("customer_id", "integer"),
            ("first_name", "string"),
            ("last_name", "string"),
            ("email", "string"),
            ("phone", "string"),
            ("region", "string"),
            ("signup_date", "date"),
            ("lifetime_value", "float"),
        ];
        let columns_b = [
            ("cust_id", "integer"),
            ("given_name", "string"),
            ("family_name", "string"),
            ("email_address", "string"),
            ("phone_number", "string"),
            ("territory", "string"),
            ("created_on", "date"),
            ("total_spend", "float"),
        ];

        let to_columns = |cols: &[(&str, &str)]| {
            cols.iter()
                .map(|(name, ty)| ColumnInfo::new(*name, *ty))
                .collect::<Vec<_>>()
        };

        let mappings = columns_a
            .iter()
            .zip(columns_b.iter())
            .map(|((a, _), (b, _))| {
                let confidence = if *a == "region" { 0.60 } else { 0.95 };
                FieldMapping::new(*a, *b, confidence)
            })
            .collect();

        let mut datasets = BTreeMap::new();
        datasets.insert(
            "customers_a.csv".to_string(),
            DatasetFixture {
                rows: 10,
                complexity: Some(Complexity::Low),
                columns: to_columns(&columns_a),
            },
        );
        datasets.insert(
            "customers_b.csv".to_string(),
            DatasetFixture {
                rows: 8,
                complexity: None,
                columns: to_columns(&columns_b),
            },
        );

        Self {
            datasets,
            mappings,
            conflicts: Vec::new(),
            quality: passing_report(),
            latency_ms: 0,
        }
    }

    fn dataset(&self, path: &str) -> Option<(&str, &DatasetFixture)> {
        if let Some((key, dataset)) = self.datasets.get_key_value(path) {
            return Some((key.as_str(), dataset));
        }
        let file_name = Path::new(path).file_name()?.to_str()?;
        self.datasets
            .get_key_value(file_name)
            .map(|(key, dataset)| (key.as_str(), dataset))
    }
}

/// Fixture-backed implementation of every collaborator
pub struct FixtureServices {
    fixture: Fixture,
    /// table_ref -> dataset key
    tables: Mutex<HashMap<String, String>>,
    merges: AtomicU32,
    tickets: AtomicU32,
}

impl FixtureServices {
    pub fn new(fixture: Fixture) -> Self {
        Self {
            fixture,
            tables: Mutex::new(HashMap::new()),
            merges: AtomicU32::new(0),
            tickets: AtomicU32::new(0),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(Fixture::load(path)?))
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    async fn simulate_latency(&self) {
        if self.fixture.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.fixture.latency_ms)).await;
        }
    }

    fn table(&self, table_ref: &str) -> Result<&DatasetFixture> {
        let key = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table_ref)
            .cloned();
        match key.and_then(|k| self.fixture.datasets.get(&k)) {
            Some(dataset) => Ok(dataset),
            None => bail!("unknown table {}", table_ref),
        }
    }
}

fn table_ref_for(key: &str, session_id: &str) -> String {
    let stem = Path::new(key)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(key);
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    let session: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("RAW_{}_{}", stem, session.to_ascii_uppercase())
}

fn normalize_type(data_type: &str) -> &'static str {
    match data_type.to_ascii_lowercase().as_str() {
        "int" | "integer" | "bigint" | "smallint" | "number" | "float" | "double" | "decimal"
        | "numeric" | "real" => "numeric",
        "date" | "datetime" | "timestamp" => "temporal",
        "bool" | "boolean" => "boolean",
        _ => "text",
    }
}

#[async_trait]
impl IngestionService for FixtureServices {
    async fn ingest(&self, dataset: &DatasetRef, session_id: &str) -> Result<IngestedTable> {
        self.simulate_latency().await;
        let Some((key, fixture)) = self.fixture.dataset(&dataset.path) else {
            bail!("dataset not found: {}", dataset.path);
        };

        let table_ref = table_ref_for(key, session_id);
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table_ref.clone(), key.to_string());
        debug!("Ingested {} as {}", dataset.path, table_ref);

        Ok(IngestedTable {
            table_ref,
            row_count: fixture.rows,
            column_count: fixture.columns.len() as u32,
            complexity_hint: fixture.complexity,
        })
    }
}

#[async_trait]
impl SchemaAnalysisService for FixtureServices {
    async fn analyze_schema(&self, table_ref: &str) -> Result<TableSchema> {
        self.simulate_latency().await;
        let dataset = self.table(table_ref)?;
        Ok(TableSchema {
            table_ref: table_ref.to_string(),
            columns: dataset.columns.clone(),
            complexity_hint: dataset.complexity.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl MappingService for FixtureServices {
    async fn propose_mappings(
        &self,
        schema_a: &TableSchema,
        schema_b: &TableSchema,
    ) -> Result<Vec<FieldMapping>> {
        self.simulate_latency().await;
        if !self.fixture.mappings.is_empty() {
            return Ok(self.fixture.mappings.clone());
        }

        Ok(schema_a
            .columns
            .iter()
            .filter_map(|a| {
                schema_b
                    .columns
                    .iter()
                    .find(|b| b.name.eq_ignore_ascii_case(&a.name))
                    .map(|b| FieldMapping::new(a.name.clone(), b.name.clone(), 1.0))
            })
            .collect())
    }
}

#[async_trait]
impl ConflictDetectionService for FixtureServices {
    async fn detect_conflicts(
        &self,
        schema_a: &TableSchema,
        schema_b: &TableSchema,
        mappings: &[FieldMapping],
    ) -> Result<Vec<ConflictCandidate>> {
        self.simulate_latency().await;
        let mut candidates = self.fixture.conflicts.clone();

        for mapping in mappings {
            let source = schema_a.columns.iter().find(|c| c.name == mapping.source_field);
            let target = schema_b.columns.iter().find(|c| c.name == mapping.target_field);

            match (source, target) {
                (Some(source), Some(target))
                    if normalize_type(&source.data_type) != normalize_type(&target.data_type) =>
                {
                    candidates.push(ConflictCandidate {
                        source_field: mapping.source_field.clone(),
                        target_field: mapping.target_field.clone(),
                        kind: ConflictKind::TypeMismatch,
                        severity: None,
                        confidence: mapping.confidence,
                        description: format!(
                            "{} is {} but {} is {}",
                            source.name, source.data_type, target.name, target.data_type
                        ),
                    });
                }
                (Some(_), Some(_)) => {}
                _ => candidates.push(ConflictCandidate {
                    source_field: mapping.source_field.clone(),
                    target_field: mapping.target_field.clone(),
                    kind: ConflictKind::MissingField,
                    severity: None,
                    confidence: mapping.confidence,
                    description: format!(
                        "{} -> {} references a column that does not exist",
                        mapping.source_field, mapping.target_field
                    ),
                }),
            }
        }

        Ok(candidates)
    }
}

/// `SELECT` over both tables joined on the most confident mapping
fn merge_statement(request: &SqlRequest) -> Result<String> {
    let key = request
        .mappings
        .iter()
        .min_by(|a, b| b.confidence.total_cmp(&a.confidence))
        .context("no mapped columns to join on")?;

    let columns = request
        .mappings
        .iter()
        .map(|m| {
            format!(
                "    COALESCE(a.{}, b.{}) AS {}",
                m.source_field, m.target_field, m.source_field
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    Ok(format!(
        "SELECT\n{}\nFROM {} a\n{} {} b\n  ON a.{} = b.{}",
        columns,
        request.table_a,
        request.join_type.sql_keyword(),
        request.table_b,
        key.source_field,
        key.target_field
    ))
}

#[async_trait]
impl SqlGenerationService for FixtureServices {
    async fn generate_merge_sql(&self, request: &SqlRequest) -> Result<String> {
        self.simulate_latency().await;
        merge_statement(request)
    }
}

#[async_trait]
impl MergeExecutionService for FixtureServices {
    async fn execute_merge(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        self.simulate_latency().await;
        if request.sql.trim().is_empty() {
            bail!("refusing to run an empty merge statement");
        }
        let rows_a = self.table(&request.table_a)?.rows;
        let rows_b = self.table(&request.table_b)?.rows;

        let row_count = match request.join_type {
            JoinType::Inner => rows_a.min(rows_b),
            JoinType::Left => rows_a,
            JoinType::Right => rows_b,
            JoinType::FullOuter => rows_a.max(rows_b),
        };
        let n = self.merges.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(MergeOutcome {
            output_table_ref: format!("MERGED_{:04}", n),
            row_count,
        })
    }
}

#[async_trait]
impl DataQualityService for FixtureServices {
    async fn validate(&self, _table_ref: &str) -> Result<QualityReport> {
        self.simulate_latency().await;
        Ok(self.fixture.quality.clone())
    }
}

#[async_trait]
impl TicketingService for FixtureServices {
    async fn create_escalation(&self, request: &EscalationRequest) -> Result<String> {
        self.simulate_latency().await;
        let n = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-{}", request.project_key, n))
    }
}
