use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoordinationError, Result};
use crate::job::JobRecord;
use crate::types::CronId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Once,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronStatus {
    Enable,
    Disable,
}

/// The job a definition clones every time it fires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub workspace_id: String,
    pub target: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl JobTemplate {
    pub fn new(workspace_id: impl Into<String>, target: impl Into<String>, config: Value) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            target: target.into(),
            config,
            priority: 0,
            required_capabilities: Vec::new(),
        }
    }

    /// Fresh `CREATED` job carrying the template's fields.
    pub fn instantiate(&self, name: String) -> JobRecord {
        JobRecord::new(
            self.workspace_id.clone(),
            name,
            self.target.clone(),
            self.config.clone(),
        )
        .with_priority(self.priority)
        .with_required_capabilities(self.required_capabilities.iter().cloned())
    }
}

/// A recurring or one-shot job definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronDefinition {
    pub id: CronId,
    pub name: String,
    pub schedule_type: ScheduleType,
    /// Six-field expression with a leading seconds field.
    #[serde(default)]
    pub cron_spec: Option<String>,
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
    pub template: JobTemplate,
    pub status: CronStatus,
    #[serde(default)]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronDefinition {
    pub fn cron(name: impl Into<String>, spec: impl Into<String>, template: JobTemplate) -> Self {
        Self::blank(name.into(), ScheduleType::Cron, Some(spec.into()), None, template)
    }

    pub fn once(name: impl Into<String>, at: DateTime<Utc>, template: JobTemplate) -> Self {
        Self::blank(name.into(), ScheduleType::Once, None, Some(at), template)
    }

    fn blank(
        name: String,
        schedule_type: ScheduleType,
        cron_spec: Option<String>,
        schedule_time: Option<DateTime<Utc>>,
        template: JobTemplate,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CronId::new(),
            name,
            schedule_type,
            cron_spec,
            schedule_time,
            template,
            status: CronStatus::Enable,
            next_run_time: None,
            last_run_time: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.status = CronStatus::Disable;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == CronStatus::Enable
    }

    /// Rejects definitions that could never fire correctly.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoordinationError::validation("cron name must not be empty"));
        }
        if self.template.target.trim().is_empty() {
            return Err(CoordinationError::validation("cron template target must not be empty"));
        }
        match self.schedule_type {
            ScheduleType::Cron => {
                parse_cron_spec(self.cron_spec.as_deref().unwrap_or_default())?;
            }
            ScheduleType::Once => {
                let at = self.schedule_time.ok_or_else(|| {
                    CoordinationError::validation("once schedule requires a schedule time")
                })?;
                if self.is_enabled() && at <= now {
                    return Err(CoordinationError::validation(format!(
                        "schedule time {at} is in the past"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Recomputes `next_run_time` from scratch; disabled definitions have none.
    pub fn refresh_next_run(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.next_run_time = if !self.is_enabled() {
            None
        } else {
            match self.schedule_type {
                ScheduleType::Cron => {
                    let schedule = parse_cron_spec(self.cron_spec.as_deref().unwrap_or_default())?;
                    schedule.after(&now).next()
                }
                ScheduleType::Once => self.schedule_time.filter(|at| *at > now),
            }
        };
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled() && self.next_run_time.is_some_and(|next| next <= now)
    }

    /// Advances bookkeeping after a scheduled fire at `at`.
    ///
    /// `once` definitions disable themselves. `cron` definitions move to the first slot after
    /// both `at` and the slot that just fired, so `next_run_time` strictly increases.
    pub fn record_fire(&mut self, at: DateTime<Utc>) -> Result<()> {
        let fired_slot = self.next_run_time;
        self.last_run_time = Some(at);
        self.run_count += 1;
        self.updated_at = at;
        match self.schedule_type {
            ScheduleType::Once => {
                self.status = CronStatus::Disable;
                self.next_run_time = None;
            }
            ScheduleType::Cron => {
                let schedule = parse_cron_spec(self.cron_spec.as_deref().unwrap_or_default())?;
                let from = fired_slot.map_or(at, |slot| slot.max(at));
                self.next_run_time = schedule.after(&from).next();
            }
        }
        Ok(())
    }

    /// Bookkeeping for an operator-triggered run; the schedule is left alone.
    pub fn record_manual_run(&mut self, at: DateTime<Utc>) {
        self.last_run_time = Some(at);
        self.run_count += 1;
        self.updated_at = at;
    }

    /// Name given to the job a fire at `at` creates.
    pub fn job_name(&self, at: DateTime<Utc>) -> String {
        format!("{} @ {}", self.name, at.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Parses a six-field expression (`sec min hour day-of-month month day-of-week`).
pub fn parse_cron_spec(spec: &str) -> Result<Schedule> {
    let fields = spec.split_whitespace().count();
    if fields != 6 {
        return Err(CoordinationError::validation(format!(
            "cron expression '{spec}' must have 6 fields, found {fields}"
        )));
    }
    Schedule::from_str(spec).map_err(|err| {
        CoordinationError::validation(format!("invalid cron expression '{spec}': {err}"))
    })
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (read as UTC).
pub fn parse_schedule_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| CoordinationError::validation(format!("invalid schedule time '{raw}'")))
}
