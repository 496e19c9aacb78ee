//! Cron-like scheduler: evaluates configured jobs against a point in
//! time, computing a slot key per job and enqueuing a task exactly once
//! per slot. Re-running `enqueue_due_jobs` for the same instant is a
//! no-op for jobs already recorded in `lastSlots`.

use crate::layout::Layout;
use crate::tasks::queue::{enqueue_task, EnqueueOptions};
use crate::storage;
use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::{json, Value};

fn default_jobs() -> Value {
    json!({"version": 1, "jobs": []})
}

fn default_state() -> Value {
    json!({"version": 1, "lastSlots": {}})
}

pub fn read_jobs(layout: &Layout) -> Result<Value> {
    storage::read_json(&layout.automation_jobs_path(), default_jobs())
}

pub fn write_jobs(layout: &Layout, doc: &Value) -> Result<Value> {
    let jobs = doc.get("jobs").and_then(|v| v.as_array()).ok_or_else(|| anyhow::anyhow!("jobs must be a list"))?;
    for row in jobs {
        let id = row.get("id").and_then(|v| v.as_str()).unwrap_or("").trim();
        if id.is_empty() {
            anyhow::bail!("each job requires id");
        }
        let task_type = row.get("task").and_then(|t| t.get("type")).and_then(|v| v.as_str()).unwrap_or("").trim();
        if task_type.is_empty() {
            anyhow::bail!("job {} requires task.type", id);
        }
    }
    let out = json!({"version": doc.get("version").and_then(|v| v.as_i64()).unwrap_or(1), "jobs": jobs});
    storage::write_json(&layout.automation_jobs_path(), &out)?;
    Ok(out)
}

fn load_state(layout: &Layout) -> Result<Value> {
    let mut state = storage::read_json(&layout.automation_state_path(), default_state())?;
    if !state.get("lastSlots").map(|v| v.is_object()).unwrap_or(false) {
        state["lastSlots"] = json!({});
    }
    Ok(state)
}

fn write_state(layout: &Layout, state: &Value) -> Result<()> {
    storage::write_json(&layout.automation_state_path(), state)
}

fn weekday_name(at: DateTime<Utc>) -> &'static str {
    match at.weekday() {
        chrono::Weekday::Mon => "mon",
        chrono::Weekday::Tue => "tue",
        chrono::Weekday::Wed => "wed",
        chrono::Weekday::Thu => "thu",
        chrono::Weekday::Fri => "fri",
        chrono::Weekday::Sat => "sat",
        chrono::Weekday::Sun => "sun",
    }
}

fn parse_hm(at_hm: &str) -> Option<(u32, u32)> {
    let mut parts = at_hm.splitn(2, ':');
    let hh: u32 = parts.next()?.parse().ok()?;
    let mm: u32 = parts.next()?.parse().ok()?;
    Some((hh, mm))
}

/// Computes the slot key a job occupies at `at`, or `None` if the job
/// is not due yet (its scheduled time this period hasn't arrived).
fn job_slot(job: &Value, at: DateTime<Utc>) -> Option<String> {
    let schedule = job.get("schedule")?;
    let freq = schedule.get("freq").and_then(|v| v.as_str()).unwrap_or("daily").to_lowercase();

    match freq.as_str() {
        "daily" => {
            let at_hm = schedule.get("at").and_then(|v| v.as_str()).unwrap_or("00:00");
            let (hh, mm) = parse_hm(at_hm)?;
            let run_at = at.with_hour(hh)?.with_minute(mm)?.with_second(0)?.with_nanosecond(0)?;
            if at >= run_at {
                Some(format!("daily:{}:{}", at.format("%Y-%m-%d"), at_hm))
            } else {
                None
            }
        }
        "weekly" => {
            let day = schedule.get("day").and_then(|v| v.as_str()).unwrap_or("mon").to_lowercase();
            let at_hm = schedule.get("at").and_then(|v| v.as_str()).unwrap_or("00:00");
            if weekday_name(at) != day {
                return None;
            }
            let (hh, mm) = parse_hm(at_hm)?;
            let run_at = at.with_hour(hh)?.with_minute(mm)?.with_second(0)?.with_nanosecond(0)?;
            if at >= run_at {
                Some(format!("weekly:{}:{}:{}", at.format("%Y-%m-%d"), at_hm, day))
            } else {
                None
            }
        }
        "hourly" => {
            let interval = schedule.get("interval").and_then(|v| v.as_i64()).unwrap_or(1).max(1);
            let slot_hour = at.with_minute(0)?.with_second(0)?.with_nanosecond(0)?;
            if slot_hour.hour() as i64 % interval == 0 {
                Some(format!("hourly:{}:i{}", slot_hour.format("%Y-%m-%dT%H:%M:%SZ"), interval))
            } else {
                None
            }
        }
        _ => None,
    }
}

pub struct EnqueueDueResult {
    pub created_job_ids: Vec<String>,
    pub skipped_job_ids: Vec<String>,
}

/// Evaluates every enabled job against `at` and enqueues one task per
/// job whose slot hasn't already fired, recording the slot so the same
/// window is never enqueued twice.
pub fn enqueue_due_jobs(layout: &Layout, at: Option<DateTime<Utc>>) -> Result<EnqueueDueResult> {
    let now = at.unwrap_or_else(Utc::now);
    let jobs_doc = read_jobs(layout)?;
    let mut state = load_state(layout)?;

    let mut created = Vec::new();
    let mut skipped = Vec::new();

    let empty = Vec::new();
    let jobs = jobs_doc.get("jobs").and_then(|v| v.as_array()).unwrap_or(&empty);

    for job in jobs {
        if !job.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true) {
            continue;
        }
        let job_id = job.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if job_id.is_empty() {
            continue;
        }
        let Some(slot) = job_slot(job, now) else { continue };
        if state["lastSlots"].get(&job_id).and_then(|v| v.as_str()) == Some(slot.as_str()) {
            skipped.push(job_id);
            continue;
        }

        let empty_task = json!({});
        let task = job.get("task").unwrap_or(&empty_task);
        let task_type = task.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if task_type.is_empty() {
            continue;
        }
        let payload = task.get("payload").cloned().unwrap_or_else(|| json!({}));
        let max_retries = task.get("maxRetries").and_then(|v| v.as_i64()).unwrap_or(2);
        let run_at = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        enqueue_task(
            layout,
            &task_type,
            EnqueueOptions {
                payload,
                run_at: Some(&run_at),
                max_retries,
                source: &format!("job:{}", job_id),
            },
        )?;
        state["lastSlots"][&job_id] = json!(slot);
        created.push(job_id);
    }

    write_state(layout, &state)?;
    Ok(EnqueueDueResult { created_job_ids: created, skipped_job_ids: skipped })
}
