//! Target partitioning.
//!
//! A target spec is a newline separated list of hosts, ranges or URLs. Partitioning slices the
//! non-empty trimmed lines into consecutive groups bounded by [`ChunkConfig`]; concatenating the
//! groups in order always reproduces the original line sequence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoordinationError, Result};

/// Seconds of scan time budgeted per target before module multipliers apply.
pub const SECONDS_PER_TARGET: f64 = 30.0;

/// Scan modules that lengthen the per-target estimate when enabled in a job config.
const MODULE_COST: &[(&str, f64)] = &[
    ("portscan", 0.5),
    ("fingerprint", 0.3),
    ("pocscan", 1.0),
    ("dirscan", 0.8),
];

/// Partition bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Preferred number of targets per unit.
    pub max_targets_per_chunk: usize,
    /// Lower bound for a unit; inputs at or below it are never split.
    pub min_chunk_size: usize,
    /// Upper bound for a unit.
    pub max_chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_targets_per_chunk: 30,
            min_chunk_size: 10,
            max_chunk_size: 100,
        }
    }
}

/// Rejects bounds that cannot be satisfied. Values are never clamped.
pub fn validate_chunk_config(config: &ChunkConfig) -> Result<()> {
    if config.min_chunk_size == 0 {
        return Err(CoordinationError::validation("min_chunk_size must be positive"));
    }
    if config.max_chunk_size == 0 {
        return Err(CoordinationError::validation("max_chunk_size must be positive"));
    }
    if config.max_targets_per_chunk == 0 {
        return Err(CoordinationError::validation("max_targets_per_chunk must be positive"));
    }
    if config.min_chunk_size > config.max_chunk_size {
        return Err(CoordinationError::validation(format!(
            "min_chunk_size ({}) exceeds max_chunk_size ({})",
            config.min_chunk_size, config.max_chunk_size
        )));
    }
    if config.max_targets_per_chunk > config.max_chunk_size {
        return Err(CoordinationError::validation(format!(
            "max_targets_per_chunk ({}) exceeds max_chunk_size ({})",
            config.max_targets_per_chunk, config.max_chunk_size
        )));
    }
    Ok(())
}

/// Splits a target spec into its trimmed, non-empty lines.
pub fn tokenize(spec: &str) -> Vec<&str> {
    spec.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Size the heuristic settles on for `total` targets, ignoring the no-split shortcut.
fn bounded_chunk_size(total: usize, config: &ChunkConfig) -> usize {
    let preferred = if total > 1000 {
        config.max_chunk_size
    } else if total > 500 {
        (config.max_targets_per_chunk + config.max_chunk_size) / 2
    } else {
        config.max_targets_per_chunk
    };
    preferred.clamp(config.min_chunk_size, config.max_chunk_size)
}

/// Number of targets placed in each unit. Assumes `config` is valid.
pub fn chunk_size_for(total: usize, config: &ChunkConfig) -> usize {
    if total <= config.min_chunk_size {
        return total;
    }
    bounded_chunk_size(total, config).min(total)
}

/// Splits `spec` into ordered, disjoint groups of target lines.
///
/// An empty spec yields no partitions. When no split is needed the input is returned untouched.
pub fn partition(spec: &str, config: &ChunkConfig) -> Result<Vec<String>> {
    validate_chunk_config(config)?;
    let lines = tokenize(spec);
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let size = chunk_size_for(lines.len(), config);
    if size >= lines.len() {
        return Ok(vec![spec.to_string()]);
    }

    Ok(lines.chunks(size).map(|group| group.join("\n")).collect())
}

/// One planned unit with scheduling hints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub index: usize,
    pub targets: String,
    pub target_count: usize,
    /// Relative urgency hint: small and early chunks rank higher.
    pub priority_hint: i32,
    pub estimated_secs: u64,
}

/// Partition result enriched with per-unit metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub chunk_size: usize,
    pub chunks: Vec<ChunkPlan>,
}

impl PartitionPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_targets(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.target_count).sum()
    }
}

/// Partitions `spec` and annotates every group with a priority hint and a duration estimate
/// derived from the scan modules enabled in `scan_config`.
pub fn plan(spec: &str, config: &ChunkConfig, scan_config: &Value) -> Result<PartitionPlan> {
    let groups = partition(spec, config)?;
    let multiplier = module_multiplier(scan_config);
    let chunk_size = chunk_size_for(tokenize(spec).len(), config);

    let chunks = groups
        .into_iter()
        .enumerate()
        .map(|(index, targets)| {
            let target_count = tokenize(&targets).len();
            ChunkPlan {
                index,
                priority_hint: chunk_priority(target_count, index, config),
                estimated_secs: estimate_secs(target_count, multiplier),
                target_count,
                targets,
            }
        })
        .collect();

    Ok(PartitionPlan { chunk_size, chunks })
}

fn chunk_priority(target_count: usize, index: usize, config: &ChunkConfig) -> i32 {
    let mut priority = 1;
    if target_count <= config.min_chunk_size {
        priority += 2;
    } else if target_count <= config.max_targets_per_chunk {
        priority += 1;
    }
    if index < 3 {
        priority += 1;
    }
    priority
}

/// Cost factor for the scan modules switched on in a job config (`{"<module>": {"enable": true}}`).
pub fn module_multiplier(scan_config: &Value) -> f64 {
    MODULE_COST
        .iter()
        .filter(|(module, _)| {
            scan_config
                .get(*module)
                .and_then(|section| section.get("enable"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .fold(1.0, |acc, (_, cost)| acc + cost)
}

fn estimate_secs(targets: usize, multiplier: f64) -> u64 {
    (targets as f64 * SECONDS_PER_TARGET * multiplier).round() as u64
}

/// What starting a job with this target spec would produce, computed without side effects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionPreview {
    pub total_targets: usize,
    pub will_split: bool,
    pub chunk_count: usize,
    pub chunk_size: usize,
    pub recommended_chunk_size: usize,
    pub estimated_secs: u64,
    pub estimated_memory_mb: u64,
    pub recommended_parallelism: usize,
}

pub fn preview(spec: &str, config: &ChunkConfig, scan_config: &Value) -> Result<PartitionPreview> {
    validate_chunk_config(config)?;
    let total = tokenize(spec).len();
    let chunk_size = chunk_size_for(total, config);
    let chunk_count = if total == 0 { 0 } else { total.div_ceil(chunk_size) };

    Ok(PartitionPreview {
        total_targets: total,
        will_split: chunk_count > 1,
        chunk_count,
        chunk_size,
        recommended_chunk_size: bounded_chunk_size(total, config),
        estimated_secs: estimate_secs(total, module_multiplier(scan_config)),
        estimated_memory_mb: (total as u64 / 1024).max(1),
        recommended_parallelism: recommended_parallelism(chunk_count),
    })
}

fn recommended_parallelism(chunk_count: usize) -> usize {
    match chunk_count {
        0..=5 => chunk_count,
        6..=20 => 5,
        _ => 10,
    }
}
