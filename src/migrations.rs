//! Forward-only schema migrations. `APP_SCHEMA_VERSION` names the latest
//! step; `migrate_to_latest` walks from whatever version is on disk up to
//! a target, applying each step exactly once and recording it in history.

use crate::layout::Layout;
use crate::{index, storage, timeutil};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const APP_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: u32,
    pub note: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaState {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Default for SchemaState {
    fn default() -> Self {
        Self { version: 0, updated_at: None, history: Vec::new() }
    }
}

pub fn get_state(layout: &Layout) -> Result<SchemaState> {
    storage::read_json(&layout.schema_state_path(), SchemaState::default())
}

pub struct Status {
    pub current_version: u32,
    pub latest_version: u32,
    pub pending: u32,
}

pub fn status(layout: &Layout) -> Result<Status> {
    let st = get_state(layout)?;
    Ok(Status {
        current_version: st.version,
        latest_version: APP_SCHEMA_VERSION,
        pending: APP_SCHEMA_VERSION.saturating_sub(st.version),
    })
}

fn append_history(st: &mut SchemaState, step: u32, note: String) {
    st.history.push(HistoryEntry { step, note, at: timeutil::utc_now_iso() });
    st.updated_at = Some(timeutil::utc_now_iso());
}

/// Creates the data directory skeleton and, on first run, seeds default
/// category and alert-rule documents. Idempotent: existing files are
/// never overwritten.
fn init_data_layout(layout: &Layout, write_defaults: bool) -> Result<()> {
    for dir in [
        layout.inbox_dir(),
        layout.sources_dir(),
        layout.ledger_dir(),
        layout.alerts_dir(),
        layout.automation_dir(),
        layout.index_dir(),
        layout.meta_dir(),
        layout.audit_dir(),
    ] {
        storage::ensure_dir(&dir)?;
    }
    let conn = index::connect(&layout.index_db_path())?;
    index::ensure_index_schema(&conn)?;

    if !write_defaults {
        return Ok(());
    }

    if !layout.alert_rules_path().exists() {
        storage::write_json(
            &layout.alert_rules_path(),
            &json!({
                "currency": "USD",
                "rules": [
                    {"id": "groceries_monthly", "type": "category_budget", "categoryId": "groceries", "period": "month", "limit": "600"},
                    {"id": "restaurants_weekly", "type": "category_budget", "categoryId": "restaurants", "period": "week", "limit": "120"},
                    {"id": "new_recurring", "type": "recurring_new", "minOccurrences": 3, "spacingDays": [25, 35]},
                ],
            }),
        )?;
    }

    if !layout.alert_delivery_rules_path().exists() {
        storage::write_json(
            &layout.alert_delivery_rules_path(),
            &json!({"channels": []}),
        )?;
    }

    Ok(())
}

pub struct MigrationResult {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

/// Applies migration steps in order up to `target_version` (or the latest
/// known version). Each step is applied at most once; steps already
/// represented in `version` are skipped.
pub fn migrate_to_latest(layout: &Layout, target_version: Option<u32>) -> Result<MigrationResult> {
    let target = target_version.unwrap_or(APP_SCHEMA_VERSION).min(APP_SCHEMA_VERSION);

    storage::ensure_dir(&layout.meta_dir())?;
    let mut st = get_state(layout)?;
    let from_version = st.version;
    let mut cur = st.version;
    let mut applied = Vec::new();

    while cur < target {
        let next = cur + 1;
        match next {
            1 => {
                init_data_layout(layout, true)?;
                append_history(&mut st, 1, "Initialized data layout and defaults.".to_string());
            }
            2 => {
                init_data_layout(layout, false)?;
                let res = index::rebuild_index(layout)?;
                append_history(
                    &mut st,
                    2,
                    format!(
                        "Rebuilt sqlite index: {} transactions, {} corrections, {} sources.",
                        res.transactions_indexed, res.corrections_indexed, res.sources_indexed
                    ),
                );
            }
            other => bail!("unsupported migration step: {}", other),
        }
        cur = next;
        st.version = cur;
        applied.push(cur);
        storage::write_json(&layout.schema_state_path(), &st)?;
    }

    Ok(MigrationResult { from_version, to_version: cur, applied })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_layout_migrates_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let result = migrate_to_latest(&layout, None).unwrap();
        assert_eq!(result.from_version, 0);
        assert_eq!(result.to_version, APP_SCHEMA_VERSION);
        assert_eq!(result.applied, vec![1, 2]);
        assert!(layout.alert_rules_path().exists());
    }

    #[test]
    fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        migrate_to_latest(&layout, None).unwrap();
        let second = migrate_to_latest(&layout, None).unwrap();
        assert_eq!(second.from_version, APP_SCHEMA_VERSION);
        assert!(second.applied.is_empty());
    }

    #[test]
    fn status_reports_pending_steps() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let st = status(&layout).unwrap();
        assert_eq!(st.current_version, 0);
        assert_eq!(st.pending, APP_SCHEMA_VERSION);
    }
}
