//! Alert delivery pipeline: fans fired alert events out to configured
//! channels (outbox file, stdout, webhook). Each channel tracks its own
//! cursor so delivery is at-least-once and resumable; a failing delivery
//! stops that channel's run without advancing past the failure.

use crate::layout::Layout;
use crate::{ids, logging, storage, timeutil};
use anyhow::{bail, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

fn default_delivery_rules() -> Value {
    json!({"version": 1, "channels": [{"id": "local_outbox", "type": "outbox", "enabled": true}]})
}

fn default_delivery_state() -> Value {
    json!({"version": 1, "channels": {}})
}

pub fn load_delivery_rules(layout: &Layout) -> Result<Value> {
    let mut cfg = storage::read_json(&layout.alert_delivery_rules_path(), default_delivery_rules())?;
    if !cfg.is_object() {
        cfg = default_delivery_rules();
    }
    let mut channels = Vec::new();
    if let Some(raw) = cfg.get("channels").and_then(|v| v.as_array()) {
        for (i, row) in raw.iter().enumerate() {
            let Some(obj) = row.as_object() else { continue };
            let mut channel = obj.clone();
            let id = channel
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| format!("channel{}", i + 1));
            let ty = channel
                .get("type")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_lowercase())
                .unwrap_or_else(|| "outbox".to_string());
            let enabled = channel.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
            channel.insert("id".to_string(), json!(id));
            channel.insert("type".to_string(), json!(ty));
            channel.insert("enabled".to_string(), json!(enabled));
            channels.push(Value::Object(channel));
        }
    }
    cfg["channels"] = json!(channels);
    cfg["version"] = json!(cfg.get("version").and_then(|v| v.as_i64()).unwrap_or(1));
    Ok(cfg)
}

pub fn load_delivery_state(layout: &Layout) -> Result<Value> {
    let mut state = storage::read_json(&layout.alert_delivery_state_path(), default_delivery_state())?;
    if !state.is_object() {
        return Ok(default_delivery_state());
    }
    if !state.get("channels").map(|v| v.is_object()).unwrap_or(false) {
        state["channels"] = json!({});
    }
    state["version"] = json!(state.get("version").and_then(|v| v.as_i64()).unwrap_or(1));
    Ok(state)
}

pub fn save_delivery_state(layout: &Layout, state: &Value) -> Result<()> {
    storage::write_json(&layout.alert_delivery_state_path(), state)
}

pub fn list_outbox_entries(layout: &Layout, limit: usize) -> Result<Vec<Value>> {
    storage::read_jsonl_tail(&layout.alert_outbox_path(), limit)
}

fn to_cursor(value: Option<&Value>, max_value: usize) -> usize {
    let n = value.and_then(|v| v.as_i64()).unwrap_or(0);
    if n < 0 || n as usize > max_value {
        0
    } else {
        n as usize
    }
}

fn delivery_payload(channel: &Value, event: &Value) -> Value {
    json!({
        "deliveryId": ids::new_id("adel"),
        "channelId": channel.get("id").and_then(|v| v.as_str()).unwrap_or(""),
        "channelType": channel.get("type").and_then(|v| v.as_str()).unwrap_or(""),
        "eventId": event.get("eventId").and_then(|v| v.as_str()).unwrap_or(""),
        "deliveredAt": timeutil::utc_now_iso(),
        "event": event,
    })
}

async fn deliver_to_channel(layout: &Layout, client: &Client, channel: &Value, event: &Value) -> Result<()> {
    let channel_type = channel.get("type").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
    let payload = delivery_payload(channel, event);

    match channel_type.as_str() {
        "outbox" => {
            storage::append_jsonl(&layout.alert_outbox_path(), &payload)?;
            Ok(())
        }
        "stdout" => {
            println!("{}", payload);
            Ok(())
        }
        "webhook" => {
            let url = channel.get("url").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            if url.is_empty() {
                bail!("webhook channel requires url");
            }
            let timeout_secs = channel.get("timeoutSeconds").and_then(|v| v.as_f64()).unwrap_or(10.0);
            let mut req = client.post(&url).timeout(Duration::from_secs_f64(timeout_secs)).json(&payload);
            if let Some(headers) = channel.get("headers").and_then(|v| v.as_object()) {
                for (k, v) in headers {
                    if let Some(v) = v.as_str() {
                        req = req.header(k.as_str(), v);
                    }
                }
            }
            let resp = req.send().await?;
            let status = resp.status();
            if !status.is_success() {
                bail!("webhook returned status {}", status.as_u16());
            }
            Ok(())
        }
        other => bail!("unsupported delivery channel type: {}", other),
    }
}

pub struct ChannelResult {
    pub channel_id: String,
    pub channel_type: String,
    pub cursor_before: usize,
    pub cursor_after: usize,
    pub pending: usize,
    pub delivered: usize,
    pub failed: usize,
    pub error: Option<String>,
}

pub struct DeliverOutcome {
    pub dry_run: bool,
    pub event_count: usize,
    pub channel_results: Vec<ChannelResult>,
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers pending alert events to each enabled channel (optionally
/// restricted to `channel_ids`). In dry-run mode, computes what would be
/// delivered but writes nothing.
pub async fn deliver_alert_events(
    layout: &Layout,
    limit: i64,
    channel_ids: Option<&[String]>,
    dry_run: bool,
) -> Result<DeliverOutcome> {
    let cfg = load_delivery_rules(layout)?;
    let mut state = load_delivery_state(layout)?;
    let events = storage::iter_jsonl(&layout.alert_events_path())?;

    let wanted: HashSet<String> = channel_ids
        .map(|ids| ids.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let empty = Vec::new();
    let channels: Vec<&Value> = cfg
        .get("channels")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty)
        .iter()
        .filter(|row| {
            let enabled = row.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
            let id = row.get("id").and_then(|v| v.as_str()).unwrap_or("");
            enabled && (wanted.is_empty() || wanted.contains(id))
        })
        .collect();

    let client = Client::new();
    let mut results = Vec::new();
    let mut total_delivered = 0;
    let mut total_failed = 0;
    let now = timeutil::utc_now_iso();

    for channel in &channels {
        let channel_id = channel.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let channel_type = channel.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let channel_state = state["channels"].get(&channel_id).cloned();
        let cursor_before = to_cursor(channel_state.as_ref().and_then(|c| c.get("cursor")), events.len());

        let pending_all = &events[cursor_before.min(events.len())..];
        let pending: &[Value] = if limit >= 0 {
            &pending_all[..(limit as usize).min(pending_all.len())]
        } else {
            pending_all
        };

        let mut delivered = 0;
        let mut failed = 0;
        let mut error = None;

        for event in pending {
            let result = if dry_run { Ok(()) } else { deliver_to_channel(layout, &client, channel, event).await };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed = 1;
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let cursor_after = cursor_before + delivered;
        total_delivered += delivered;
        total_failed += failed;

        if !dry_run {
            let mut row = channel_state.unwrap_or_else(|| json!({}));
            row["cursor"] = json!(cursor_after);
            row["updatedAt"] = json!(now);
            if delivered > 0 && delivered <= pending.len() {
                row["lastDeliveredEventId"] = json!(pending[delivered - 1].get("eventId").and_then(|v| v.as_str()).unwrap_or(""));
                row["lastDeliveredAt"] = json!(now);
            }
            if let Some(err) = &error {
                row["lastError"] = json!(err);
                row["lastFailedAt"] = json!(now);
            } else {
                row["lastError"] = Value::Null;
            }
            state["channels"][&channel_id] = row;
        }

        logging::log_delivery(&channel_id, delivered as u64, failed as u64);
        results.push(ChannelResult {
            channel_id,
            channel_type,
            cursor_before,
            cursor_after,
            pending: pending.len(),
            delivered,
            failed,
            error,
        });
    }

    if !dry_run {
        state["lastRun"] = json!(now);
        save_delivery_state(layout, &state)?;
    }

    Ok(DeliverOutcome {
        dry_run,
        event_count: events.len(),
        channel_results: results,
        delivered: total_delivered,
        failed: total_failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbox_delivery_advances_cursor_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        storage::append_jsonl(&layout.alert_events_path(), &json!({"eventId": "evt_1"})).unwrap();
        storage::append_jsonl(&layout.alert_events_path(), &json!({"eventId": "evt_2"})).unwrap();
        storage::write_json(
            &layout.alert_delivery_rules_path(),
            &json!({"channels": [{"id": "local_outbox", "type": "outbox", "enabled": true}]}),
        )
        .unwrap();

        let first = deliver_alert_events(&layout, 100, None, false).await.unwrap();
        assert_eq!(first.delivered, 2);
        let outbox = storage::iter_jsonl(&layout.alert_outbox_path()).unwrap();
        assert_eq!(outbox.len(), 2);

        let second = deliver_alert_events(&layout, 100, None, false).await.unwrap();
        assert_eq!(second.delivered, 0);
        let outbox_after = storage::iter_jsonl(&layout.alert_outbox_path()).unwrap();
        assert_eq!(outbox_after.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_does_not_write_or_advance_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        storage::append_jsonl(&layout.alert_events_path(), &json!({"eventId": "evt_1"})).unwrap();
        storage::write_json(
            &layout.alert_delivery_rules_path(),
            &json!({"channels": [{"id": "local_outbox", "type": "outbox", "enabled": true}]}),
        )
        .unwrap();

        let result = deliver_alert_events(&layout, 100, None, true).await.unwrap();
        assert_eq!(result.delivered, 1);
        assert!(!layout.alert_outbox_path().exists());
    }

    #[tokio::test]
    async fn unknown_channel_type_fails_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        storage::append_jsonl(&layout.alert_events_path(), &json!({"eventId": "evt_1"})).unwrap();
        storage::write_json(
            &layout.alert_delivery_rules_path(),
            &json!({"channels": [{"id": "bad", "type": "carrier_pigeon", "enabled": true}]}),
        )
        .unwrap();

        let result = deliver_alert_events(&layout, 100, None, false).await.unwrap();
        assert_eq!(result.delivered, 0);
        assert_eq!(result.failed, 1);
        assert_eq!(result.channel_results[0].cursor_after, 0);
    }
}
