//! Structured logging for the ledger engine.
//!
//! Every subsystem emits machine-parseable JSON lines instead of ad hoc
//! `println!` calls, so failures can be correlated across the reducer,
//! index, task engine, and alerts pipeline from one run's log files.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

/// Log categories, matched against `LOG_DOMAINS` (comma-separated, or `all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ledger,
    Index,
    Tasks,
    Alerts,
    Delivery,
    Auth,
    Audit,
    System,
    Profile,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ledger => "ledger",
            Domain::Index => "index",
            Domain::Tasks => "tasks",
            Domain::Alerts => "alerts",
            Domain::Delivery => "delivery",
            Domain::Auth => "auth",
            Domain::Audit => "audit",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("LEDGERFLOW_RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LEDGERFLOW_LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let events_path = run_dir.join("events.jsonl");
        let trace_path = run_dir.join("trace.jsonl");

        let events = File::create(&events_path).unwrap_or_else(|err| {
            eprintln!("[log] failed to create events log: {}", err);
            File::create("/tmp/ledgerflow-events.jsonl").expect("events fallback")
        });
        let trace = File::create(&trace_path).unwrap_or_else(|err| {
            eprintln!("[log] failed to create trace log: {}", err);
            File::create("/tmp/ledgerflow-trace.jsonl").expect("trace fallback")
        });

        RunContext {
            run_id,
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
        }
    })
}

/// Redact keys that commonly carry secrets before a record is serialized.
fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "x-api-key", "apiKey", "key", "token"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["tx_id", "task_id", "rule_id", "channel_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_ledger_append(kind: &str, tx_id: &str, applied_corrections: Option<u64>) {
    log(
        Level::Info,
        Domain::Ledger,
        "append",
        obj(&[
            ("kind", v_str(kind)),
            ("tx_id", v_str(tx_id)),
            (
                "applied_corrections",
                applied_corrections.map(|n| json!(n)).unwrap_or(Value::Null),
            ),
        ]),
    );
}

pub fn log_index_update_failed(table: &str, key: &str, err: &str) {
    log(
        Level::Warn,
        Domain::Index,
        "update_failed",
        obj(&[("table", v_str(table)), ("key", v_str(key)), ("err", v_str(err))]),
    );
}

pub fn log_task_transition(task_id: &str, task_type: &str, from: &str, to: &str) {
    log(
        Level::Info,
        Domain::Tasks,
        "transition",
        obj(&[
            ("task_id", v_str(task_id)),
            ("task_type", v_str(task_type)),
            ("from", v_str(from)),
            ("to", v_str(to)),
        ]),
    );
}

pub fn log_alert_fired(rule_id: &str, rule_type: &str, period_key: &str) {
    log(
        Level::Info,
        Domain::Alerts,
        "fired",
        obj(&[
            ("rule_id", v_str(rule_id)),
            ("rule_type", v_str(rule_type)),
            ("period_key", v_str(period_key)),
        ]),
    );
}

pub fn log_delivery(channel_id: &str, delivered: u64, failed: u64) {
    log(
        Level::Info,
        Domain::Delivery,
        "run",
        obj(&[
            ("channel_id", v_str(channel_id)),
            ("delivered", json!(delivered)),
            ("failed", json!(failed)),
        ]),
    );
}

pub fn log_auth_denied(reason: &str, path: &str) {
    log(
        Level::Warn,
        Domain::Auth,
        "denied",
        obj(&[("reason", v_str(reason)), ("path", v_str(path))]),
    );
}

// =============================================================================
// Utility functions
// =============================================================================

pub fn params_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut h);
    format!("{:x}", h.finish())
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    domain: Domain,
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            domain: Domain::Profile,
            label,
            context: None,
            started: Instant::now(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            domain: Domain::Profile,
            label,
            context: Some(obj(fields)),
            started: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, self.domain, "profile", fields);
    }
}

// =============================================================================
// Periodic counters, flushed on demand (e.g. end of a worker loop iteration)
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    tasks_done: u64,
    tasks_failed: u64,
    tasks_retried: u64,
    alerts_fired: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            tasks_done: 0,
            tasks_failed: 0,
            tasks_retried: 0,
            alerts_fired: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "task_done" => self.tasks_done += 1,
            "task_failed" => self.tasks_failed += 1,
            "task_retried" => self.tasks_retried += 1,
            "alert_fired" => self.alerts_fired += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<(u64, u64, u64, u64)> {
        if self.last_flush.elapsed().as_secs() >= self.flush_interval_secs {
            let result = (self.tasks_done, self.tasks_failed, self.tasks_retried, self.alerts_fired);
            self.tasks_done = 0;
            self.tasks_failed = 0;
            self.tasks_retried = 0;
            self.alerts_fired = 0;
            self.last_flush = Instant::now();
            Some(result)
        } else {
            None
        }
    }
}

pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some((done, failed, retried, alerts)) = agg.maybe_flush() {
            log(
                Level::Info,
                Domain::System,
                "aggregated_stats",
                obj(&[
                    ("tasks_done", json!(done)),
                    ("tasks_failed", json!(failed)),
                    ("tasks_retried", json!(retried)),
                    ("alerts_fired", json!(alerts)),
                ]),
            );
        }
    }
}

pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn params_hash_deterministic() {
        let h1 = params_hash("test-input");
        let h2 = params_hash("test-input");
        assert_eq!(h1, h2);
    }

    #[test]
    fn params_hash_different_inputs() {
        assert_ne!(params_hash("input-a"), params_hash("input-b"));
    }

    #[test]
    fn obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn sanitize_redacts_known_keys() {
        let fields = obj(&[("x-api-key", v_str("secret-token")), ("tx_id", v_str("tx_1"))]);
        let cleaned = sanitize_fields(fields);
        assert_eq!(cleaned.get("x-api-key").unwrap(), "[REDACTED]");
        assert_eq!(cleaned.get("tx_id").unwrap(), "tx_1");
    }
}
