use anyhow::Result;
use ledgerflow::config::Config;
use ledgerflow::layout::Layout;
use ledgerflow::logging::{self, Domain, Level};
use ledgerflow::{migrations, tasks::queue, tasks::scheduler};
use serde_json::json;
use tokio::time::{sleep, Duration};

/// Starts a worker loop: migrates the data directory to the latest
/// schema, then repeatedly enqueues due scheduled jobs and drains the
/// task queue. Intended to run as a single long-lived process per data
/// directory (see the concurrency model: one writer at a time).
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let layout = Layout::new(&cfg.data_dir);

    let migration = migrations::migrate_to_latest(&layout, None)?;
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        logging::obj(&[
            ("from_version", json!(migration.from_version)),
            ("to_version", json!(migration.to_version)),
            ("applied_steps", json!(migration.applied)),
            ("worker_id", json!(cfg.worker_id)),
        ]),
    );

    loop {
        let due = scheduler::enqueue_due_jobs(&layout, None)?;
        if !due.created_job_ids.is_empty() {
            logging::log(
                Level::Info,
                Domain::Tasks,
                "scheduler_enqueued",
                logging::obj(&[("job_ids", json!(due.created_job_ids))]),
            );
        }

        let summary = queue::run_worker(&layout, &cfg.worker_id, cfg.automation_max_tasks)?;
        if summary.processed > 0 {
            logging::log(
                Level::Info,
                Domain::Tasks,
                "worker_batch",
                logging::obj(&[
                    ("processed", json!(summary.processed)),
                    ("done", json!(summary.done)),
                    ("failed", json!(summary.failed)),
                    ("retried", json!(summary.retried)),
                ]),
            );
        }

        logging::tick_aggregator();
        sleep(Duration::from_millis(cfg.automation_poll_ms)).await;
    }
}
