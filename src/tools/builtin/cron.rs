//! The `manage_cron` tool.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

use crate::cron::{JobKind, TimerJob};
use crate::thread::{JobScheduler, Thread};
use crate::tools::builtin::thread::bound;
use crate::tools::tool::{optional_str, require_str};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput};

/// Add, remove, and list timer jobs on behalf of the model.
///
/// New jobs wake the session that created them unless `silent` is set.
pub struct ManageCronTool {
    thread: Weak<Thread>,
}

impl ManageCronTool {
    pub fn new(thread: Weak<Thread>) -> Self {
        Self { thread }
    }

    fn scheduler(&self) -> Result<Arc<dyn JobScheduler>, ToolError> {
        bound(&self.thread)?
            .manager()
            .and_then(|m| m.job_scheduler())
            .ok_or_else(|| ToolError::Unavailable("job scheduler not configured".to_string()))
    }
}

fn format_schedule(job: &TimerJob) -> String {
    match (job.kind, job.at_time) {
        (JobKind::At, Some(at)) => format!("at:{}", at.with_timezone(&Local).to_rfc3339()),
        (JobKind::At, None) => "at".to_string(),
        (JobKind::Cron, _) => job.expr.clone(),
    }
}

pub(crate) fn format_list(jobs: &[TimerJob]) -> String {
    if jobs.is_empty() {
        return "(no cron jobs)".to_string();
    }
    let mut out = String::from("Cron jobs:\n");
    for job in jobs {
        out.push_str(&format!(
            "- {} | {} | {} | mode={}",
            job.id,
            format_schedule(job),
            if job.enabled { "enabled" } else { "disabled" },
            if job.silent { "silent" } else { "wake_creator" },
        ));
        if let Some(agent) = &job.agent {
            out.push_str(&format!(" | agent={}", agent));
        }
        if !job.wake_session.is_empty() {
            out.push_str(&format!(" | creator={}", job.wake_session));
        }
        out.push_str(&format!("\n  task: {}\n", job.task));
    }
    out.trim_end().to_string()
}

#[async_trait]
impl Tool for ManageCronTool {
    fn name(&self) -> &str {
        "manage_cron"
    }

    fn description(&self) -> &str {
        "Manage scheduled jobs: add a recurring job (cron expression) or a one-time job \
         (RFC3339 at_time), remove a job, or list jobs. Jobs wake the creating session unless \
         silent."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let now = Local::now();
        serde_json::json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["add", "remove", "list"],
                    "description": "The operation to perform"
                },
                "id": {
                    "type": "string",
                    "description": "Job id. Required for add and remove."
                },
                "expr": {
                    "type": "string",
                    "description": "Cron expression for recurring jobs, e.g. '0 9 * * *'. \
                                    Use either expr or at_time."
                },
                "at_time": {
                    "type": "string",
                    "description": format!(
                        "One-time schedule in RFC3339 with an explicit offset. Server time is {}.",
                        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
                    )
                },
                "task": {
                    "type": "string",
                    "description": "Task prompt delivered when the job fires. Required for add."
                },
                "silent": {
                    "type": "boolean",
                    "description": "Run without delivering the result. Default false."
                },
                "agent": {
                    "type": "string",
                    "description": "Optional persona name from agents/*.md"
                }
            },
            "required": ["operation"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let operation = require_str(&params, "operation")?.to_lowercase();
        let jobs = self.scheduler()?;

        let text = match operation.as_str() {
            "add" => {
                let id = require_str(&params, "id")?;
                let task = require_str(&params, "task")?;
                let expr = optional_str(&params, "expr");
                let at_time = optional_str(&params, "at_time");
                let silent = params
                    .get("silent")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let mut job = match (expr, at_time) {
                    (Some(expr), None) => TimerJob::recurring(id, expr, task),
                    (None, Some(raw)) => {
                        let at = DateTime::parse_from_rfc3339(raw).map_err(|_| {
                            ToolError::InvalidParameters(
                                "at_time must be RFC3339 with an offset, e.g. \
                                 2026-02-07T15:04:05+08:00"
                                    .to_string(),
                            )
                        })?;
                        TimerJob::one_shot(id, at.with_timezone(&Utc), task)
                    }
                    (Some(_), Some(_)) => {
                        return Err(ToolError::InvalidParameters(
                            "use either expr or at_time, not both".to_string(),
                        ));
                    }
                    (None, None) => {
                        return Err(ToolError::InvalidParameters(
                            "either expr or at_time is required for add".to_string(),
                        ));
                    }
                }
                .with_wake_session(ctx.session_key.as_str());
                job.agent = optional_str(&params, "agent").map(str::to_string);
                job.silent = silent;

                let job = jobs.add_job(job).await?;
                format!(
                    "Job added: {} ({})\nmode: {}\ncreator_session_key: {}\nserver_timezone: UTC{}",
                    job.id,
                    format_schedule(&job),
                    if job.silent { "silent" } else { "wake_creator" },
                    job.wake_session,
                    Local::now().format("%:z"),
                )
            }
            "remove" => {
                let id = require_str(&params, "id")?;
                jobs.remove_job(id).await?;
                format!("Job removed: {}", id)
            }
            "list" => format_list(&jobs.list_jobs().await),
            other => {
                return Err(ToolError::InvalidParameters(format!(
                    "operation must be one of add, remove, list (got '{}')",
                    other
                )));
            }
        };

        Ok(ToolOutput::text(text, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingJobs, ScriptedProvider};
    use crate::thread::{Manager, ThreadDeps};

    async fn setup() -> (Manager, Arc<RecordingJobs>, Arc<Thread>) {
        let m = Manager::new(ThreadDeps::new(Arc::new(ScriptedProvider::new())));
        let jobs = Arc::new(RecordingJobs::default());
        m.set_job_scheduler(jobs.clone());
        let thread = m.get_or_create("discord:7", None).await;
        (m, jobs, thread)
    }

    #[tokio::test]
    async fn test_add_uses_creator_session() {
        let (_m, jobs, thread) = setup().await;
        let tool = ManageCronTool::new(Arc::downgrade(&thread));
        let ctx = ToolContext::new(thread.id(), "discord:7");

        let out = tool
            .execute(
                serde_json::json!({
                    "operation": "add",
                    "id": "standup",
                    "expr": "0 9 * * 1-5",
                    "task": "remind me about standup",
                    "agent": "coder"
                }),
                &ctx,
            )
            .await
            .unwrap()
            .into_text();
        assert!(out.contains("creator_session_key: discord:7"));

        let added = jobs.jobs();
        assert_eq!(added[0].wake_session, "discord:7");
        assert_eq!(added[0].agent.as_deref(), Some("coder"));
        assert!(!added[0].silent);
    }

    #[tokio::test]
    async fn test_add_argument_errors() {
        let (_m, _jobs, thread) = setup().await;
        let tool = ManageCronTool::new(Arc::downgrade(&thread));
        let ctx = ToolContext::default();

        for params in [
            serde_json::json!({"operation": "add", "id": "x", "task": "t"}),
            serde_json::json!({"operation": "add", "id": "x", "task": "t",
                               "expr": "* * * * *", "at_time": "2030-01-01T00:00:00Z"}),
            serde_json::json!({"operation": "add", "id": "x", "task": "t",
                               "at_time": "tomorrow"}),
            serde_json::json!({"operation": "pause"}),
        ] {
            let err = tool.execute(params.clone(), &ctx).await.unwrap_err();
            assert!(matches!(err, ToolError::InvalidParameters(_)), "{params}");
        }
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let (_m, jobs, thread) = setup().await;
        let tool = ManageCronTool::new(Arc::downgrade(&thread));
        let ctx = ToolContext::default();

        let empty = tool
            .execute(serde_json::json!({"operation": "list"}), &ctx)
            .await
            .unwrap()
            .into_text();
        assert_eq!(empty, "(no cron jobs)");

        let mut job = TimerJob::recurring("digest", "0 8 * * *", "send digest");
        job.silent = true;
        jobs.add_job(job).await.unwrap();
        let listed = tool
            .execute(serde_json::json!({"operation": "list"}), &ctx)
            .await
            .unwrap()
            .into_text();
        assert!(listed.contains("- digest | 0 8 * * * | enabled | mode=silent"));

        tool.execute(serde_json::json!({"operation": "remove", "id": "digest"}), &ctx)
            .await
            .unwrap();
        assert!(jobs.jobs().is_empty());
    }
}
