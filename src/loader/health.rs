//! Diagnostics and Health Reporting
//!
//! Read-only views derived from the registry: a load report with counts and
//! timings, and a coarse health status used to decide whether to run the
//! recovery flow.

use serde::Serialize;

use super::cache::ModuleRegistry;
use super::deps::DependencyTable;

/// Snapshot of the registry's load results.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub loaded_count: usize,
    pub failed_ids: Vec<String>,
    pub fallback_ids: Vec<String>,
    pub avg_load_time_ms: f64,
}

impl LoadReport {
    pub fn from_registry(registry: &ModuleRegistry) -> Self {
        let times = registry.load_times();
        let avg_load_time_ms = if times.is_empty() {
            0.0
        } else {
            times.iter().map(|t| t.as_secs_f64() * 1000.0).sum::<f64>() / times.len() as f64
        };

        Self {
            loaded_count: registry.loaded_count(),
            failed_ids: registry.failed_ids().map(|id| id.to_string()).collect(),
            fallback_ids: registry
                .fallback_ids()
                .into_iter()
                .map(|id| id.to_string())
                .collect(),
            avg_load_time_ms,
        }
    }
}

/// Coarse health of the module set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Nothing failed.
    Ok,
    /// Some modules failed or run on fallbacks, none of them critical.
    Warning,
    /// A module from the critical order failed.
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub failed: Vec<String>,
    pub fallback: Vec<String>,
}

impl HealthReport {
    pub fn from_registry(registry: &ModuleRegistry, table: &DependencyTable) -> Self {
        let critical_failed = registry.failed_ids().any(|id| table.is_critical(id));
        let report = LoadReport::from_registry(registry);

        let status = if critical_failed {
            HealthStatus::Critical
        } else if !report.failed_ids.is_empty() || !report.fallback_ids.is_empty() {
            HealthStatus::Warning
        } else {
            HealthStatus::Ok
        };

        Self {
            status,
            failed: report.failed_ids,
            fallback: report.fallback_ids,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}
