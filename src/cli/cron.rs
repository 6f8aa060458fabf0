//! `ironwake cron` subcommands.
//!
//! These edit the job store file directly. A running agent picks the change
//! up on its next reload.

use std::path::Path;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};

use crate::cron::{TimerJob, store};
use crate::tools::builtin::format_list;

#[derive(Subcommand, Debug, Clone)]
pub enum CronCommand {
    /// List stored jobs
    List,

    /// Add a recurring job
    Add {
        /// Unique job id
        id: String,

        /// Cron expression, e.g. "0 9 * * *"
        expr: String,

        /// Task text handed to the woken session
        task: String,

        #[command(flatten)]
        options: JobArgs,
    },

    /// Add a one-shot job
    AddAt {
        /// Unique job id
        id: String,

        /// RFC 3339 time, e.g. "2026-01-01T09:00:00Z"
        at: String,

        /// Task text handed to the woken session
        task: String,

        #[command(flatten)]
        options: JobArgs,
    },

    /// Remove a job
    Remove {
        /// Job id
        id: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    /// Persona for the woken thread
    #[arg(long)]
    pub agent: Option<String>,

    /// Session to wake (default: main)
    #[arg(long, default_value = "")]
    pub session: String,

    /// Do not deliver the turn's output
    #[arg(long)]
    pub silent: bool,
}

impl JobArgs {
    fn apply(self, mut job: TimerJob) -> TimerJob {
        job.agent = self.agent;
        job.wake_session = self.session;
        job.silent = self.silent;
        job
    }
}

/// Run a cron command against the store at `store_path`.
pub fn run_cron_command(cmd: CronCommand, store_path: &Path) -> anyhow::Result<()> {
    match cmd {
        CronCommand::List => {
            let mut jobs = store::read_jobs(store_path)?;
            jobs.sort_by(|a, b| a.id.cmp(&b.id));
            println!("{}", format_list(&jobs));
        }
        CronCommand::Add {
            id,
            expr,
            task,
            options,
        } => {
            let job = options.apply(TimerJob::recurring(id, expr, task));
            let job = store::add_to_file(store_path, job)?;
            println!("Added cron job {} ({})", job.id, job.expr);
        }
        CronCommand::AddAt {
            id,
            at,
            task,
            options,
        } => {
            let at = parse_at(&at)?;
            let job = options.apply(TimerJob::one_shot(id, at, task));
            let job = store::add_to_file(store_path, job)?;
            println!("Added one-shot job {} at {}", job.id, at.to_rfc3339());
        }
        CronCommand::Remove { id } => {
            store::remove_from_file(store_path, &id)?;
            println!("Removed job {}", id.trim());
        }
    }
    Ok(())
}

fn parse_at(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid time '{}': {}", raw, e))?;
    Ok(at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::JobKind;

    #[test]
    fn test_add_and_remove_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.jsonl");

        run_cron_command(
            CronCommand::Add {
                id: "daily".to_string(),
                expr: "0 9 * * *".to_string(),
                task: "brief me".to_string(),
                options: JobArgs {
                    session: "telegram:42".to_string(),
                    silent: true,
                    ..JobArgs::default()
                },
            },
            &path,
        )
        .unwrap();

        let at = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        run_cron_command(
            CronCommand::AddAt {
                id: "once".to_string(),
                at,
                task: "ping".to_string(),
                options: JobArgs::default(),
            },
            &path,
        )
        .unwrap();

        let jobs = store::read_jobs(&path).unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["daily", "once"]);
        assert_eq!(jobs[0].wake_session, "telegram:42");
        assert!(jobs[0].silent);
        assert_eq!(jobs[1].kind, JobKind::At);

        run_cron_command(CronCommand::Remove { id: "daily".to_string() }, &path).unwrap();
        let jobs = store::read_jobs(&path).unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.jsonl");

        let bad_expr = CronCommand::Add {
            id: "x".to_string(),
            expr: "not a schedule".to_string(),
            task: "t".to_string(),
            options: JobArgs::default(),
        };
        assert!(run_cron_command(bad_expr, &path).is_err());

        let past = CronCommand::AddAt {
            id: "y".to_string(),
            at: "2000-01-01T00:00:00Z".to_string(),
            task: "t".to_string(),
            options: JobArgs::default(),
        };
        assert!(run_cron_command(past, &path).is_err());

        assert!(run_cron_command(CronCommand::Remove { id: "nope".to_string() }, &path).is_err());
    }
}
