//! Identifier newtypes shared across the coordination layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoordinationError;

/// Unique identifier for a logical scan job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoordinationError::validation(format!("invalid job id '{s}': {e}")))
    }
}

/// Identifier of one claimable slice of a job.
///
/// Single-unit jobs reuse the job id; multi-unit jobs append the unit index.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn for_index(job_id: JobId, index: usize, total: usize) -> Self {
        if total <= 1 {
            Self(job_id.to_string())
        } else {
            Self(format!("{job_id}-{index}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a recurring or one-shot job definition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CronId(pub Uuid);

impl Default for CronId {
    fn default() -> Self {
        Self::new()
    }
}

impl CronId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for CronId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CronId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| CoordinationError::validation(format!("invalid cron id '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_unit_reuses_job_id() {
        let job = JobId::new();
        assert_eq!(UnitId::for_index(job, 0, 1).as_str(), job.to_string());
    }

    #[test]
    fn multi_unit_ids_carry_index() {
        let job = JobId::new();
        assert_eq!(UnitId::for_index(job, 2, 3).0, format!("{job}-2"));
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let job = JobId::new();
        let parsed: JobId = job.to_string().parse().expect("parse job id");
        assert_eq!(parsed, job);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn ids_are_time_ordered_v7() {
        let first = JobId::new();
        let second = JobId::new();
        assert_eq!(first.0.get_version_num(), 7);
        assert_eq!(CronId::new().0.get_version_num(), 7);
        assert!(first.0 < second.0);
    }
}
