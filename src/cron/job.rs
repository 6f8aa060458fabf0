//! Timer job definition, normalization, and validation.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CronError;

/// How a job is triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Fires on every match of a cron expression.
    #[default]
    #[serde(alias = "recurring")]
    Cron,
    /// Fires once at an absolute timestamp, then removes itself.
    #[serde(alias = "oneshot", alias = "one_shot")]
    At,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron => write!(f, "cron"),
            Self::At => write!(f, "at"),
        }
    }
}

/// A scheduled task that wakes a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerJob {
    pub id: String,
    #[serde(default)]
    pub kind: JobKind,
    /// Cron expression (5, 6, or 7 fields, or an `@daily`-style shorthand).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_time: Option<DateTime<Utc>>,
    pub task: String,
    /// Persona override for the woken thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Session to wake; blank means the default session.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wake_session: String,
    /// Suppress delivery of the woken turn's output.
    #[serde(default, skip_serializing_if = "is_false")]
    pub silent: bool,
    /// Wake the target as a resumed sleep rather than a cron task.
    #[serde(default, skip_serializing_if = "is_false")]
    pub direct_wake: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Outcome of checking a job read back from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredCheck {
    Keep,
    /// Malformed entry; dropped without rewriting the store.
    Invalid,
    /// Enabled one-shot whose time has passed; dropped and the store resaved.
    Expired,
}

impl TimerJob {
    /// Build an enabled recurring job.
    pub fn recurring(
        id: impl Into<String>,
        expr: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: JobKind::Cron,
            expr: expr.into(),
            at_time: None,
            task: task.into(),
            agent: None,
            wake_session: String::new(),
            silent: false,
            direct_wake: false,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Build an enabled one-shot job.
    pub fn one_shot(id: impl Into<String>, at: DateTime<Utc>, task: impl Into<String>) -> Self {
        Self {
            kind: JobKind::At,
            expr: String::new(),
            at_time: Some(at),
            ..Self::recurring(id, "", task)
        }
    }

    /// Set the session woken when the job fires.
    pub fn with_wake_session(mut self, session_key: impl Into<String>) -> Self {
        self.wake_session = session_key.into();
        self
    }

    /// Trim fields and infer a missing kind.
    pub fn normalize(mut self) -> Self {
        self.id = self.id.trim().to_string();
        self.expr = self.expr.trim().to_string();
        self.task = self.task.trim().to_string();
        self.wake_session = self.wake_session.trim().to_string();
        self.agent = self
            .agent
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        if self.kind == JobKind::Cron && self.expr.is_empty() && self.at_time.is_some() {
            self.kind = JobKind::At;
        }
        self
    }

    /// Check that the schedule fields required by the kind are present and valid.
    pub fn validate_schedule(&self) -> Result<(), CronError> {
        match self.kind {
            JobKind::Cron => {
                if self.expr.is_empty() {
                    return Err(CronError::MissingField { field: "expr" });
                }
                parse_schedule(&self.expr).map(|_| ())
            }
            JobKind::At => match self.at_time {
                Some(_) => Ok(()),
                None => Err(CronError::MissingField { field: "at_time" }),
            },
        }
    }

    /// Validate a job about to be added.
    pub fn validate_new(
        &self,
        existing: &HashMap<String, TimerJob>,
        now: DateTime<Utc>,
    ) -> Result<(), CronError> {
        if self.id.is_empty() {
            return Err(CronError::MissingField { field: "id" });
        }
        if self.task.is_empty() {
            return Err(CronError::MissingField { field: "task" });
        }
        if existing.contains_key(&self.id) {
            return Err(CronError::Duplicate {
                id: self.id.clone(),
            });
        }
        self.validate_schedule()?;
        if let (JobKind::At, Some(at)) = (self.kind, self.at_time) {
            if at <= now {
                return Err(CronError::AtTimeInPast);
            }
        }
        Ok(())
    }

    /// Check a job read from the store.
    pub fn check_stored(&self, now: DateTime<Utc>) -> StoredCheck {
        if self.id.is_empty() || self.task.is_empty() {
            return StoredCheck::Invalid;
        }
        if self.validate_schedule().is_err() {
            return StoredCheck::Invalid;
        }
        match (self.kind, self.at_time) {
            (JobKind::At, Some(at)) if self.enabled && at <= now => StoredCheck::Expired,
            _ => StoredCheck::Keep,
        }
    }

    /// Next firing time strictly after `after`, if any.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.kind {
            JobKind::Cron => {
                let schedule = parse_schedule(&self.expr).ok()?;
                let local = after.with_timezone(&Local);
                schedule
                    .after(&local)
                    .next()
                    .map(|t| t.with_timezone(&Utc))
            }
            JobKind::At => self.at_time.filter(|at| *at > after),
        }
    }
}

/// Parse a cron expression, accepting the common 5-field form.
///
/// The `cron` crate wants `sec min hour dom month dow [year]`, so 5-field
/// expressions get a leading `0` seconds field and a trailing `*` year.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, CronError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        match trimmed.split_whitespace().count() {
            5 => format!("0 {} *", trimmed),
            _ => trimmed.to_string(),
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_parse_schedule_field_counts() {
        assert!(parse_schedule("*/30 * * * *").is_ok());
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        assert!(parse_schedule("@daily").is_ok());
        assert!(matches!(
            parse_schedule("every tuesday"),
            Err(CronError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_normalize_infers_at_kind() {
        let raw: TimerJob = serde_json::from_str(
            r#"{"id":" wake ","at_time":"2030-01-01T00:00:00Z","task":" ping "}"#,
        )
        .unwrap();
        let job = raw.normalize();
        assert_eq!(job.kind, JobKind::At);
        assert_eq!(job.id, "wake");
        assert_eq!(job.task, "ping");
        assert!(job.enabled);
    }

    #[test]
    fn test_validate_new_rules() {
        let now = Utc::now();
        let mut existing = HashMap::new();

        let no_expr = TimerJob::recurring("a", "", "task");
        assert!(matches!(
            no_expr.validate_new(&existing, now),
            Err(CronError::MissingField { field: "expr" })
        ));

        let past = TimerJob::one_shot("b", now - Duration::seconds(1), "task");
        assert!(matches!(
            past.validate_new(&existing, now),
            Err(CronError::AtTimeInPast)
        ));

        let ok = TimerJob::recurring("c", "0 9 * * *", "task");
        assert!(ok.validate_new(&existing, now).is_ok());
        existing.insert("c".to_string(), ok.clone());
        assert!(matches!(
            ok.validate_new(&existing, now),
            Err(CronError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_check_stored_expired_only_when_enabled() {
        let now = Utc::now();
        let mut job = TimerJob::one_shot("x", now - Duration::minutes(5), "ping");
        assert_eq!(job.check_stored(now), StoredCheck::Expired);

        job.enabled = false;
        assert_eq!(job.check_stored(now), StoredCheck::Keep);

        let broken = TimerJob::recurring("y", "not a cron", "ping");
        assert_eq!(broken.check_stored(now), StoredCheck::Invalid);
    }

    #[test]
    fn test_next_fire_after() {
        let now = Utc::now();
        let every_minute = TimerJob::recurring("m", "* * * * *", "tick");
        let next = every_minute.next_fire_after(now).unwrap();
        assert!(next > now && next <= now + Duration::seconds(61));

        let at = TimerJob::one_shot("o", now + Duration::seconds(30), "ping");
        assert_eq!(at.next_fire_after(now), at.at_time);
        assert_eq!(at.next_fire_after(now + Duration::minutes(1)), None);
    }

    #[test]
    fn test_serialization_skips_defaults() {
        let job = TimerJob::recurring("daily", "0 9 * * *", "brief");
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("silent").is_none());
        assert!(json.get("at_time").is_none());
        assert_eq!(json["kind"], "cron");
    }
}
