//! JSONL persistence for timer jobs.
//!
//! One job per line, sorted by id. Writes go to a sibling `.tmp` file that is
//! renamed over the store, so readers only ever see a complete snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::cron::TimerJob;
use crate::error::CronError;

/// Read all jobs from a JSONL file.
///
/// A missing file is an empty store.
pub fn read_jobs(path: &Path) -> Result<Vec<TimerJob>, CronError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CronError::ReadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };

    let mut jobs = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let job: TimerJob = serde_json::from_str(line).map_err(|e| CronError::ReadFailed {
            path: path.display().to_string(),
            reason: format!("line {}: {}", lineno + 1, e),
        })?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Write jobs atomically, sorted by id.
pub fn write_jobs(path: &Path, jobs: &[TimerJob]) -> Result<(), CronError> {
    let persist_err = |reason: String| CronError::PersistFailed {
        path: path.display().to_string(),
        reason,
    };

    let mut sorted: Vec<&TimerJob> = jobs.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut buf = String::new();
    for job in sorted {
        let line = serde_json::to_string(job).map_err(|e| persist_err(e.to_string()))?;
        buf.push_str(&line);
        buf.push('\n');
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
        }
    }

    let tmp = tmp_path(path);
    std::fs::write(&tmp, buf.as_bytes()).map_err(|e| persist_err(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| persist_err(e.to_string()))?;

    tracing::debug!(count = jobs.len(), path = %path.display(), "Persisted timer jobs");
    Ok(())
}

/// Add a job straight to the store file.
///
/// Used by the `cron` CLI; a running scheduler picks the change up on its
/// next reload.
pub fn add_to_file(path: &Path, job: TimerJob) -> Result<TimerJob, CronError> {
    let job = job.normalize();
    let mut jobs = read_jobs(path)?;
    let existing: HashMap<String, TimerJob> =
        jobs.iter().map(|j| (j.id.clone(), j.clone())).collect();
    job.validate_new(&existing, Utc::now())?;
    jobs.push(job.clone());
    write_jobs(path, &jobs)?;
    Ok(job)
}

/// Remove a job straight from the store file.
pub fn remove_from_file(path: &Path, id: &str) -> Result<(), CronError> {
    let id = id.trim();
    let mut jobs = read_jobs(path)?;
    let before = jobs.len();
    jobs.retain(|j| j.id.trim() != id);
    if jobs.len() == before {
        return Err(CronError::NotFound { id: id.to_string() });
    }
    write_jobs(path, &jobs)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
