/// Projected scan results
///
/// `get_scan_results` reads the persisted native export, projects it with
/// the requested profile (or custom field set), applies the typed filters,
/// paginates, and returns the line-delimited JSON stream as one string.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use scanhive_shared::error::{CoreError, CoreResult};
use scanhive_shared::models::TaskStatus;
use scanhive_shared::report::{parse_report, project, ProjectionParams, SchemaProfile};

use super::ScanService;

/// Query half of `get_scan_results`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsQuery {
    /// 1-based page; 0 selects the full filtered set
    #[serde(default = "default_page")]
    pub page: u32,

    /// Page size, clamped to [10, 100]
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// `minimal`, `summary`, `brief` (default) or `full`
    #[serde(default)]
    pub schema_profile: Option<String>,

    /// Exact fields to project; mutually exclusive with a non-default
    /// profile
    #[serde(default)]
    pub custom_fields: Option<Vec<String>>,

    /// Field filters, AND across keys
    #[serde(default)]
    pub filters: Option<BTreeMap<String, String>>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    40
}

impl Default for ResultsQuery {
    fn default() -> Self {
        ResultsQuery {
            page: default_page(),
            page_size: default_page_size(),
            schema_profile: None,
            custom_fields: None,
            filters: None,
        }
    }
}

impl ScanService {
    /// Returns a completed task's results as line-delimited JSON.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such task
    /// - `NotReady`: the task has not completed
    /// - `InvalidArgument`: unknown profile, or profile/custom conflict
    pub async fn get_scan_results(&self, task_id: &str, query: ResultsQuery) -> CoreResult<String> {
        let task = self.tasks.get(task_id).await?;
        if task.status != TaskStatus::Completed {
            return Err(CoreError::NotReady(format!(
                "task {} is {}, results require completed",
                task_id, task.status
            )));
        }
        // The artifact fields land one write after the terminal transition.
        let artifact_path = task.artifact_path.as_deref().ok_or_else(|| {
            CoreError::NotReady(format!("task {} artifact is not recorded yet", task_id))
        })?;

        let profile = match query.schema_profile.as_deref() {
            None => SchemaProfile::default(),
            Some(raw) => SchemaProfile::parse(raw).ok_or_else(|| {
                CoreError::InvalidArgument(format!("unknown schema_profile: {}", raw))
            })?,
        };
        let params = ProjectionParams::new(
            profile,
            query.custom_fields,
            query.filters.unwrap_or_default(),
            query.page,
            query.page_size,
        )?;

        let bytes = tokio::fs::read(artifact_path).await.map_err(|e| {
            CoreError::Internal(format!(
                "cannot read artifact {}: {}",
                artifact_path, e
            ))
        })?;
        let report = parse_report(&bytes)
            .map_err(|e| CoreError::Internal(format!("corrupt artifact for {}: {}", task_id, e)))?;

        Ok(project(&report, &params))
    }
}
