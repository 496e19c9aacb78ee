//! Append-only audit trail of mutating API calls. Every record captures
//! who made the request, what auth decision was reached, and the
//! resulting status code. Append failures are swallowed: auditing must
//! never break request handling.

use crate::layout::Layout;
use crate::{storage, timeutil};
use serde_json::{json, Value};

pub struct AuditEntry<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub status: u16,
    pub client: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub auth_required: bool,
    pub auth_scopes_required: Option<&'a str>,
    pub auth_key_id: Option<&'a str>,
    pub workspace_id: Option<&'a str>,
    pub auth_mode: &'a str,
    pub auth_denied: bool,
    pub auth_deny_reason: Option<&'a str>,
}

/// Returns only on mutating verbs, matching the spec's "every mutating
/// API call" scope (`GET`/`HEAD`/`OPTIONS` are never audited).
fn is_mutating(method: &str) -> bool {
    matches!(method.to_uppercase().as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
}

/// Appends one audit record for a mutating request. Never returns an
/// error: a write failure is logged and otherwise ignored.
pub fn record(layout: &Layout, entry: &AuditEntry) {
    if !is_mutating(entry.method) {
        return;
    }
    let row = json!({
        "at": timeutil::utc_now_iso(),
        "method": entry.method,
        "path": entry.path,
        "query": entry.query,
        "status": entry.status,
        "client": entry.client,
        "userAgent": entry.user_agent,
        "authRequired": entry.auth_required,
        "authScopesRequired": entry.auth_scopes_required,
        "authKeyId": entry.auth_key_id,
        "workspaceId": entry.workspace_id,
        "authMode": entry.auth_mode,
        "authDenied": entry.auth_denied,
        "authDenyReason": entry.auth_deny_reason,
    });
    if let Err(err) = storage::append_jsonl(&layout.audit_events_path(), &row) {
        crate::logging::log_index_update_failed("audit", entry.path, &err.to_string());
    }
}

pub fn recent(layout: &Layout, limit: usize) -> anyhow::Result<Vec<Value>> {
    storage::read_jsonl_tail(&layout.audit_events_path(), limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    #[test]
    fn get_requests_are_never_audited() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        record(
            &layout,
            &AuditEntry {
                method: "GET",
                path: "/api/transactions",
                query: None,
                status: 200,
                client: None,
                user_agent: None,
                auth_required: false,
                auth_scopes_required: None,
                auth_key_id: None,
                workspace_id: None,
                auth_mode: "local_only_no_key",
                auth_denied: false,
                auth_deny_reason: None,
            },
        );
        assert!(!layout.audit_events_path().exists());
    }

    #[test]
    fn post_request_is_recorded_with_status_and_auth_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        record(
            &layout,
            &AuditEntry {
                method: "POST",
                path: "/api/transactions",
                query: Some("dryRun=true"),
                status: 201,
                client: Some("127.0.0.1"),
                user_agent: Some("curl/8.0"),
                auth_required: true,
                auth_scopes_required: Some("write"),
                auth_key_id: Some("legacy"),
                workspace_id: Some("default"),
                auth_mode: "api_key",
                auth_denied: false,
                auth_deny_reason: None,
            },
        );
        let rows = recent(&layout, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], 201);
        assert_eq!(rows[0]["authKeyId"], "legacy");
    }

    #[test]
    fn denied_request_records_deny_reason() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        record(
            &layout,
            &AuditEntry {
                method: "DELETE",
                path: "/api/transactions/tx_1",
                query: None,
                status: 401,
                client: None,
                user_agent: None,
                auth_required: true,
                auth_scopes_required: Some("write"),
                auth_key_id: None,
                workspace_id: None,
                auth_mode: "api_key_scoped",
                auth_denied: true,
                auth_deny_reason: Some("missing_key"),
            },
        );
        let rows = recent(&layout, 10).unwrap();
        assert_eq!(rows[0]["authDenied"], true);
        assert_eq!(rows[0]["authDenyReason"], "missing_key");
    }
}
