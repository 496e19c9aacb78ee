//! The durable task queue: a single JSON document rewritten whole on
//! every state transition. `queued -> running -> {done, failed}`, with
//! `running -> queued` on retry and stale-lease reclaim for crashed
//! workers holding an expired lock.

use crate::layout::Layout;
use crate::{alerts, ids, logging, storage, timeutil};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

fn default_queue() -> Value {
    json!({"version": 1, "tasks": []})
}

fn queue_doc(layout: &Layout) -> Result<Value> {
    let mut doc = storage::read_json(&layout.automation_queue_path(), default_queue())?;
    if !doc.get("tasks").map(|v| v.is_array()).unwrap_or(false) {
        doc["tasks"] = json!([]);
    }
    Ok(doc)
}

fn write_queue(layout: &Layout, doc: &Value) -> Result<()> {
    storage::write_json(&layout.automation_queue_path(), doc)
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    if value.is_empty() {
        return Utc::now();
    }
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn list_tasks(layout: &Layout, limit: i64, status: Option<&str>) -> Result<Vec<Value>> {
    let doc = queue_doc(layout)?;
    let mut items: Vec<Value> = doc["tasks"].as_array().cloned().unwrap_or_default();
    if let Some(status) = status {
        let wanted: Vec<&str> = status.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        items.retain(|t| {
            let st = t.get("status").and_then(|v| v.as_str()).unwrap_or("");
            wanted.contains(&st)
        });
    }
    items.sort_by(|a, b| {
        let ca = a.get("createdAt").and_then(|v| v.as_str()).unwrap_or("");
        let cb = b.get("createdAt").and_then(|v| v.as_str()).unwrap_or("");
        ca.cmp(cb)
    });
    if limit >= 0 && items.len() > limit as usize {
        items = items.split_off(items.len() - limit as usize);
    }
    Ok(items)
}

pub struct EnqueueOptions<'a> {
    pub payload: Value,
    pub run_at: Option<&'a str>,
    pub max_retries: i64,
    pub source: &'a str,
}

impl<'a> Default for EnqueueOptions<'a> {
    fn default() -> Self {
        Self { payload: json!({}), run_at: None, max_retries: 2, source: "manual" }
    }
}

pub fn enqueue_task(layout: &Layout, task_type: &str, opts: EnqueueOptions) -> Result<Value> {
    let mut doc = queue_doc(layout)?;
    let available_at = fmt_ts(opts.run_at.map(parse_ts).unwrap_or_else(Utc::now));
    let now = timeutil::utc_now_iso();
    let task = json!({
        "taskId": ids::new_id("tsk"),
        "taskType": task_type,
        "payload": opts.payload,
        "status": "queued",
        "attempts": 0,
        "maxRetries": opts.max_retries.max(0),
        "availableAt": available_at,
        "createdAt": now,
        "updatedAt": now,
        "source": opts.source,
    });
    doc["tasks"].as_array_mut().unwrap().push(task.clone());
    write_queue(layout, &doc)?;
    Ok(task)
}

fn claim_next_task(layout: &Layout, worker_id: &str, lock_ttl_seconds: i64) -> Result<Option<Value>> {
    let mut doc = queue_doc(layout)?;
    let now = Utc::now();
    let lock_ttl = Duration::seconds(lock_ttl_seconds.max(1));

    let tasks = doc["tasks"].as_array().cloned().unwrap_or_default();
    let is_stale_running = |t: &Value| -> bool {
        if t.get("status").and_then(|v| v.as_str()) != Some("running") {
            return false;
        }
        let locked_at = parse_ts(t.get("lockedAt").and_then(|v| v.as_str()).unwrap_or(""));
        now - locked_at > lock_ttl
    };

    let mut candidates: Vec<&Value> = tasks
        .iter()
        .filter(|t| {
            let status = t.get("status").and_then(|v| v.as_str()).unwrap_or("");
            if status != "queued" && status != "running" {
                return false;
            }
            if status == "running" && !is_stale_running(t) {
                return false;
            }
            let available_at = parse_ts(t.get("availableAt").and_then(|v| v.as_str()).unwrap_or(""));
            available_at <= now
        })
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }
    candidates.sort_by_key(|t| t.get("availableAt").and_then(|v| v.as_str()).unwrap_or("").to_string());
    let task_id = candidates[0].get("taskId").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let mut claimed = None;
    let tasks_mut = doc["tasks"].as_array_mut().unwrap();
    for row in tasks_mut.iter_mut() {
        if row.get("taskId").and_then(|v| v.as_str()) != Some(task_id.as_str()) {
            continue;
        }
        let from_status = row.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let task_type = row.get("taskType").and_then(|v| v.as_str()).unwrap_or("").to_string();
        row["status"] = json!("running");
        row["lockedAt"] = json!(timeutil::utc_now_iso());
        row["workerId"] = json!(worker_id);
        row["updatedAt"] = json!(timeutil::utc_now_iso());
        let attempts = row.get("attempts").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        row["attempts"] = json!(attempts);
        logging::log_task_transition(&task_id, &task_type, &from_status, "running");
        claimed = Some(row.clone());
        break;
    }
    write_queue(layout, &doc)?;
    Ok(claimed)
}

struct FinishOptions<'a> {
    status: &'a str,
    result: Option<Value>,
    error: Option<&'a str>,
    retry_delay_seconds: i64,
}

fn finish_task(layout: &Layout, task_id: &str, opts: FinishOptions) -> Result<Option<Value>> {
    let mut doc = queue_doc(layout)?;
    let mut found = None;
    let tasks_mut = doc["tasks"].as_array_mut().unwrap();
    for row in tasks_mut.iter_mut() {
        if row.get("taskId").and_then(|v| v.as_str()) != Some(task_id) {
            continue;
        }
        let task_type = row.get("taskType").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let from_status = row.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string();
        row["status"] = json!(opts.status);
        row["updatedAt"] = json!(timeutil::utc_now_iso());
        if let Some(result) = &opts.result {
            row["result"] = result.clone();
        }
        if let Some(error) = opts.error {
            row["error"] = json!(error);
        }
        if opts.status == "queued" && opts.retry_delay_seconds > 0 {
            row["availableAt"] = json!(fmt_ts(Utc::now() + Duration::seconds(opts.retry_delay_seconds)));
            if let Some(obj) = row.as_object_mut() {
                obj.remove("lockedAt");
                obj.remove("workerId");
            }
        }
        if opts.status == "done" || opts.status == "failed" {
            row["finishedAt"] = json!(timeutil::utc_now_iso());
        }
        logging::log_task_transition(task_id, &task_type, &from_status, opts.status);
        found = Some(row.clone());
        break;
    }
    write_queue(layout, &doc)?;
    Ok(found)
}

/// Dispatches a claimed task to its executor. Only `alerts.run` is
/// implemented natively; other task types return an error, which the
/// retry/dead-letter machinery handles the same as any other failure.
fn execute_task(layout: &Layout, task_type: &str, payload: &Value) -> Result<Value> {
    match task_type {
        "alerts.run" => {
            let today = timeutil::today_ymd();
            let at = payload.get("at").and_then(|v| v.as_str()).unwrap_or(&today).to_string();
            let commit = payload.get("commit").and_then(|v| v.as_bool()).unwrap_or(true);
            let result = alerts::run_alerts(layout, &at, commit)?;
            Ok(json!({"at": result.at, "eventCount": result.events.len(), "commit": result.commit}))
        }
        other => bail!("unsupported taskType: {}", other),
    }
}

pub struct RunOutcome {
    pub status: String,
    pub task: Option<Value>,
    pub error: Option<String>,
}

/// Claims and runs a single task. Failures are retried up to
/// `maxRetries` with exponential backoff (`2^(attempts-1)` seconds, no
/// jitter); once retries are exhausted the task moves to `failed`.
pub fn run_next_task(layout: &Layout, worker_id: &str, lock_ttl_seconds: i64) -> Result<RunOutcome> {
    let Some(task) = claim_next_task(layout, worker_id, lock_ttl_seconds)? else {
        return Ok(RunOutcome { status: "idle".to_string(), task: None, error: None });
    };

    let task_id = task.get("taskId").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let task_type = task.get("taskType").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let payload = task.get("payload").cloned().unwrap_or_else(|| json!({}));

    match execute_task(layout, &task_type, &payload) {
        Ok(result) => {
            let done = finish_task(layout, &task_id, FinishOptions { status: "done", result: Some(result), error: None, retry_delay_seconds: 0 })?;
            logging::agg_increment("task_done");
            Ok(RunOutcome { status: "done".to_string(), task: done, error: None })
        }
        Err(e) => {
            let attempts = task.get("attempts").and_then(|v| v.as_i64()).unwrap_or(1);
            let max_retries = task.get("maxRetries").and_then(|v| v.as_i64()).unwrap_or(0);
            let err_msg = e.to_string();
            if attempts <= max_retries {
                let delay = 2i64.pow((attempts - 1).max(0) as u32);
                let queued = finish_task(
                    layout,
                    &task_id,
                    FinishOptions { status: "queued", result: None, error: Some(&err_msg), retry_delay_seconds: delay },
                )?;
                logging::agg_increment("task_retried");
                Ok(RunOutcome { status: "retry_scheduled".to_string(), task: queued, error: Some(err_msg) })
            } else {
                let failed = finish_task(layout, &task_id, FinishOptions { status: "failed", result: None, error: Some(&err_msg), retry_delay_seconds: 0 })?;
                logging::agg_increment("task_failed");
                Ok(RunOutcome { status: "failed".to_string(), task: failed, error: Some(err_msg) })
            }
        }
    }
}

pub struct WorkerSummary {
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Runs up to `max_tasks` tasks in sequence, stopping early once the
/// queue goes idle.
pub fn run_worker(layout: &Layout, worker_id: &str, max_tasks: u32) -> Result<WorkerSummary> {
    let mut summary = WorkerSummary { processed: 0, done: 0, failed: 0, retried: 0 };
    for _ in 0..max_tasks.max(1) {
        let outcome = run_next_task(layout, worker_id, 300)?;
        if outcome.status == "idle" {
            break;
        }
        summary.processed += 1;
        match outcome.status.as_str() {
            "done" => summary.done += 1,
            "failed" => summary.failed += 1,
            "retry_scheduled" => summary.retried += 1,
            _ => {}
        }
    }
    Ok(summary)
}

/// Tasks in a terminal `failed` state, for operational inspection.
pub fn dead_letters(layout: &Layout) -> Result<Vec<Value>> {
    let doc = queue_doc(layout)?;
    Ok(doc["tasks"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.get("status").and_then(|v| v.as_str()) == Some("failed"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_claim_transitions_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        enqueue_task(&layout, "alerts.run", EnqueueOptions::default()).unwrap();
        let claimed = claim_next_task(&layout, "w1", 300).unwrap().unwrap();
        assert_eq!(claimed["status"], "running");
        assert_eq!(claimed["attempts"], 1);
    }

    #[test]
    fn unsupported_task_type_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        enqueue_task(&layout, "unknown.task", EnqueueOptions { max_retries: 1, ..EnqueueOptions::default() }).unwrap();

        let first = run_next_task(&layout, "w1", 300).unwrap();
        assert_eq!(first.status, "retry_scheduled");

        // Fast-forward by rewriting availableAt into the past.
        let mut doc = queue_doc(&layout).unwrap();
        doc["tasks"][0]["availableAt"] = json!("2000-01-01T00:00:00Z");
        write_queue(&layout, &doc).unwrap();

        let second = run_next_task(&layout, "w1", 300).unwrap();
        assert_eq!(second.status, "failed");

        let letters = dead_letters(&layout).unwrap();
        assert_eq!(letters.len(), 1);
    }

    #[test]
    fn idle_when_queue_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let outcome = run_next_task(&layout, "w1", 300).unwrap();
        assert_eq!(outcome.status, "idle");
    }

    #[test]
    fn stale_running_lease_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        enqueue_task(&layout, "alerts.run", EnqueueOptions::default()).unwrap();
        claim_next_task(&layout, "w1", 300).unwrap();

        let mut doc = queue_doc(&layout).unwrap();
        doc["tasks"][0]["lockedAt"] = json!("2000-01-01T00:00:00Z");
        write_queue(&layout, &doc).unwrap();

        let reclaimed = claim_next_task(&layout, "w2", 1).unwrap();
        assert!(reclaimed.is_some());
        assert_eq!(reclaimed.unwrap()["workerId"], "w2");
    }
}
