//! Resource allocation policy
//!
//! Deterministic lookup from workload size and schema complexity to the
//! number of schema-analysis and merge agents and the warehouse tier.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::types::{Complexity, IngestedTable};

const SMALL_ROWS: u64 = 10_000;
const MEDIUM_ROWS: u64 = 100_000;
const LARGE_ROWS: u64 = 1_000_000;

/// Warehouse size classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarehouseTier {
    Small,
    Medium,
    Large,
    XLarge,
}

impl std::fmt::Display for WarehouseTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WarehouseTier::Small => "small",
            WarehouseTier::Medium => "medium",
            WarehouseTier::Large => "large",
            WarehouseTier::XLarge => "x-large",
        };
        f.write_str(s)
    }
}

/// Workload characteristics the decision is made from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetProfile {
    /// Combined rows of both datasets
    pub row_count: u64,
    /// Narrowest dataset's column count
    pub column_count: u32,
    pub complexity: Complexity,
}

impl DatasetProfile {
    /// Combine the ingested tables: rows are summed, the highest complexity
    /// hint wins and a missing hint counts as low.
    pub fn from_tables(tables: &[IngestedTable]) -> Result<Self> {
        let row_count = tables
            .iter()
            .try_fold(0u64, |total, t| total.checked_add(t.row_count))
            .ok_or_else(|| OrchestratorError::Allocation {
                message: "combined row count overflows".to_string(),
            })?;
        Ok(Self {
            row_count,
            column_count: tables.iter().map(|t| t.column_count).min().unwrap_or(0),
            complexity: tables
                .iter()
                .filter_map(|t| t.complexity_hint)
                .max()
                .unwrap_or_default(),
        })
    }
}

/// Resources granted to a run; fixed once computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocationDecision {
    pub schema_agents: usize,
    pub merge_agents: usize,
    pub warehouse_tier: WarehouseTier,
}

/// Allocation policy with configurable caps
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    pub max_schema_agents: usize,
    pub max_merge_agents: usize,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            max_schema_agents: 3,
            max_merge_agents: 10,
        }
    }
}

impl AllocationPolicy {
    pub fn new(max_schema_agents: usize, max_merge_agents: usize) -> Self {
        Self {
            max_schema_agents: max_schema_agents.max(1),
            max_merge_agents: max_merge_agents.max(1),
        }
    }

    /// Decide the allocation for a workload
    pub fn decide(&self, profile: DatasetProfile) -> Result<ResourceAllocationDecision> {
        if profile.column_count == 0 {
            return Err(OrchestratorError::Allocation {
                message: "dataset reports zero columns".to_string(),
            });
        }

        use Complexity as C;
        use WarehouseTier as T;

        let rows = profile.row_count;
        let (schema_agents, merge_agents, warehouse_tier) = match profile.complexity {
            _ if rows < SMALL_ROWS => (1, 1, T::Small),
            _ if rows > LARGE_ROWS => (3, 10, T::XLarge),
            C::Low if rows <= MEDIUM_ROWS => (1, 2, T::Small),
            C::Medium if rows <= MEDIUM_ROWS => (2, 3, T::Medium),
            C::High if rows <= MEDIUM_ROWS => (2, 5, T::Large),
            C::Low => (2, 3, T::Medium),
            C::Medium => (2, 5, T::Large),
            C::High => (3, 7, T::XLarge),
        };

        Ok(ResourceAllocationDecision {
            schema_agents: schema_agents.min(self.max_schema_agents),
            merge_agents: merge_agents.min(self.max_merge_agents),
            warehouse_tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(row_count: u64, complexity: Complexity) -> DatasetProfile {
        DatasetProfile {
            row_count,
            column_count: 8,
            complexity,
        }
    }

    fn decide(rows: u64, complexity: Complexity) -> (usize, usize, WarehouseTier) {
        let d = AllocationPolicy::default()
            .decide(profile(rows, complexity))
            .unwrap();
        (d.schema_agents, d.merge_agents, d.warehouse_tier)
    }

    #[test]
    fn test_reference_points() {
        assert_eq!(decide(5_000, Complexity::Low), (1, 1, WarehouseTier::Small));
        assert_eq!(decide(50_000, Complexity::Medium), (2, 3, WarehouseTier::Medium));
        assert_eq!(decide(500_000, Complexity::High), (3, 7, WarehouseTier::XLarge));
        assert_eq!(decide(2_000_000, Complexity::Low), (3, 10, WarehouseTier::XLarge));
        assert_eq!(decide(2_000_000, Complexity::High), (3, 10, WarehouseTier::XLarge));
    }

    #[test]
    fn test_monotonic_in_rows() {
        let rows = [0, 9_999, 10_000, 100_000, 100_001, 1_000_000, 1_000_001, 50_000_000];
        for complexity in [Complexity::Low, Complexity::Medium, Complexity::High] {
            let decisions: Vec<_> = rows.iter().map(|r| decide(*r, complexity)).collect();
            for pair in decisions.windows(2) {
                assert!(pair[0].0 <= pair[1].0, "{:?}", pair);
                assert!(pair[0].1 <= pair[1].1, "{:?}", pair);
                assert!(pair[0].2 <= pair[1].2, "{:?}", pair);
                assert!(pair[1].1 <= 10);
            }
        }
    }

    #[test]
    fn test_caps_apply() {
        let policy = AllocationPolicy::new(2, 4);
        let d = policy.decide(profile(5_000_000, Complexity::High)).unwrap();
        assert_eq!(d.schema_agents, 2);
        assert_eq!(d.merge_agents, 4);
    }

    #[test]
    fn test_zero_columns_rejected() {
        let err = AllocationPolicy::default()
            .decide(DatasetProfile {
                row_count: 10,
                column_count: 0,
                complexity: Complexity::Low,
            })
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Allocation { .. }));
    }

    #[test]
    fn test_profile_from_tables() {
        let tables = vec![
            IngestedTable {
                table_ref: "RAW_A".to_string(),
                row_count: 10,
                column_count: 8,
                complexity_hint: None,
            },
            IngestedTable {
                table_ref: "RAW_B".to_string(),
                row_count: 8,
                column_count: 6,
                complexity_hint: Some(Complexity::Medium),
            },
        ];
        let profile = DatasetProfile::from_tables(&tables).unwrap();
        assert_eq!(profile.row_count, 18);
        assert_eq!(profile.column_count, 6);
        assert_eq!(profile.complexity, Complexity::Medium);
    }

    #[test]
    fn test_profile_rejects_row_overflow() {
        let table = |rows| IngestedTable {
            table_ref: "RAW".to_string(),
            row_count: rows,
            column_count: 4,
            complexity_hint: None,
        };
        let err = DatasetProfile::from_tables(&[table(u64::MAX), table(1)]).unwrap_err();
        assert!(matches!(err, OrchestratorError::Allocation { .. }));
        assert!(err.to_string().contains("overflows"));

        let profile = DatasetProfile::from_tables(&[table(u64::MAX - 1), table(1)]).unwrap();
        assert_eq!(profile.row_count, u64::MAX);
    }

    #[test]
    fn test_tier_serializes_kebab_case() {
        assert_eq!(serde_json::to_value(WarehouseTier::XLarge).unwrap(), "x-large");
        assert_eq!(WarehouseTier::XLarge.to_string(), "x-large");
    }
}
