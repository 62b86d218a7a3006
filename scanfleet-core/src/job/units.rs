use serde_json::{Map, Value};

use crate::error::{CoordinationError, Result};
use crate::partition::PartitionPlan;
use crate::types::UnitId;

use super::model::{JobRecord, JobUnit};

/// Materialises one [`JobUnit`] per planned chunk.
///
/// Each unit receives a copy of the job config with `target`, `subTaskIndex` and `subTaskTotal`
/// overwritten; every other field is carried over untouched. `resume_state`, when present, is
/// injected as `resumeState`.
pub fn build_units(
    job: &JobRecord,
    plan: &PartitionPlan,
    resume_state: Option<&Value>,
) -> Result<Vec<JobUnit>> {
    let base = match &job.config {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(CoordinationError::validation(format!(
                "job {} config must be a JSON object, got {}",
                job.id,
                json_kind(other)
            )));
        }
    };

    let total = plan.len();
    let eligible_workers = job.eligible_workers();

    Ok(plan
        .chunks
        .iter()
        .map(|chunk| {
            let mut config = base.clone();
            config.insert("target".into(), Value::String(chunk.targets.clone()));
            config.insert("subTaskIndex".into(), Value::from(chunk.index));
            config.insert("subTaskTotal".into(), Value::from(total));
            if let Some(state) = resume_state {
                config.insert("resumeState".into(), state.clone());
            }

            JobUnit {
                unit_id: UnitId::for_index(job.id, chunk.index, total),
                job_id: job.id,
                workspace_id: job.workspace_id.clone(),
                name: job.name.clone(),
                index: chunk.index,
                config: Value::Object(config),
                priority: job.priority,
                eligible_workers: eligible_workers.clone(),
                required_capabilities: job.required_capabilities.clone(),
                attempt: 0,
            }
        })
        .collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
