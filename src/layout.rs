use std::path::{Path, PathBuf};

/// Stable paths within a LedgerFlow data directory. See §6 of the spec for
/// the full directory contract.
#[derive(Clone, Debug)]
pub struct Layout {
    pub data_dir: PathBuf,
}

impl Layout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.data_dir.join("sources")
    }

    pub fn sources_index_path(&self) -> PathBuf {
        self.sources_dir().join("index.json")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn transactions_path(&self) -> PathBuf {
        self.ledger_dir().join("transactions.jsonl")
    }

    pub fn corrections_path(&self) -> PathBuf {
        self.ledger_dir().join("corrections.jsonl")
    }

    pub fn alerts_dir(&self) -> PathBuf {
        self.data_dir.join("alerts")
    }

    pub fn alert_rules_path(&self) -> PathBuf {
        self.alerts_dir().join("alert_rules.json")
    }

    pub fn alert_state_path(&self) -> PathBuf {
        self.alerts_dir().join("state.json")
    }

    pub fn alert_events_path(&self) -> PathBuf {
        self.alerts_dir().join("events.jsonl")
    }

    pub fn alert_outbox_path(&self) -> PathBuf {
        self.alerts_dir().join("outbox.jsonl")
    }

    pub fn alert_delivery_rules_path(&self) -> PathBuf {
        self.alerts_dir().join("alert_delivery_rules.json")
    }

    pub fn alert_delivery_state_path(&self) -> PathBuf {
        self.alerts_dir().join("alert_delivery_state.json")
    }

    pub fn automation_dir(&self) -> PathBuf {
        self.data_dir.join("automation")
    }

    pub fn automation_jobs_path(&self) -> PathBuf {
        self.automation_dir().join("jobs.json")
    }

    pub fn automation_queue_path(&self) -> PathBuf {
        self.automation_dir().join("queue.json")
    }

    pub fn automation_state_path(&self) -> PathBuf {
        self.automation_dir().join("state.json")
    }

    pub fn automation_dead_letters_path(&self) -> PathBuf {
        self.automation_dir().join("dead_letters.jsonl")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.index_dir().join("ledgerflow.db")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    pub fn schema_state_path(&self) -> PathBuf {
        self.meta_dir().join("schema.json")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    pub fn audit_events_path(&self) -> PathBuf {
        self.audit_dir().join("events.jsonl")
    }
}

pub fn layout_for(data_dir: impl AsRef<Path>) -> Layout {
    Layout::new(data_dir.as_ref().to_path_buf())
}
