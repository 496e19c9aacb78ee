//! API key authentication and scope enforcement.
//!
//! Keys are loaded once from the environment: `LEDGERFLOW_API_KEYS` holds a
//! JSON list or object of scoped keys, `LEDGERFLOW_API_KEY` is a legacy
//! single full-access key. An empty store means `local_only_no_key` mode:
//! every request is allowed, matching a single-user local deployment.

use crate::timeutil;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

const DEFAULT_RW_SCOPES: [&str; 2] = ["read", "write"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Legacy,
    Scoped,
}

#[derive(Clone, Debug)]
pub struct KeyMeta {
    pub id: String,
    pub kind: KeyKind,
    pub scopes: BTreeSet<String>,
    pub enabled: bool,
    pub expires_at: Option<String>,
    pub workspaces: BTreeSet<String>,
}

impl KeyMeta {
    /// `admin` implies every scope; `write` additionally implies `read`.
    pub fn has_scope(&self, required: &str) -> bool {
        if self.scopes.contains("admin") {
            return true;
        }
        if required == "read" && self.scopes.contains("write") {
            return true;
        }
        self.scopes.contains(required)
    }

    pub fn has_scopes(&self, required: &[&str]) -> bool {
        required.iter().all(|s| self.has_scope(s))
    }

    fn is_expired(&self, now_ymd: &str) -> bool {
        match &self.expires_at {
            Some(exp) => exp.as_str() < now_ymd,
            None => false,
        }
    }

    /// Empty allow-list means no workspace restriction.
    fn allows_workspace(&self, workspace: Option<&str>) -> bool {
        if self.workspaces.is_empty() {
            return true;
        }
        workspace.map(|w| self.workspaces.contains(w)).unwrap_or(false)
    }
}

pub type ApiKeyStore = HashMap<String, KeyMeta>;

fn parse_scopes(raw: Option<&str>, fallback: &[&str]) -> BTreeSet<String> {
    let mut scopes: BTreeSet<String> = match raw {
        Some(s) if !s.trim().is_empty() => s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect(),
        _ => fallback.iter().map(|s| s.to_string()).collect(),
    };
    if scopes.contains("admin") {
        scopes.extend(DEFAULT_RW_SCOPES.iter().map(|s| s.to_string()));
    }
    scopes
}

#[derive(Deserialize)]
struct ScopedKeyRow {
    id: Option<String>,
    key: Option<String>,
    scopes: Option<ScopesValue>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(rename = "expiresAt")]
    expires_at: Option<String>,
    #[serde(default)]
    workspaces: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopesValue {
    Csv(String),
    List(Vec<String>),
}

impl ScopesValue {
    fn joined(&self) -> String {
        match self {
            ScopesValue::Csv(s) => s.clone(),
            ScopesValue::List(items) => items.join(","),
        }
    }
}

/// Reads `LEDGERFLOW_API_KEYS` (scoped keys, list or object form) and
/// `LEDGERFLOW_API_KEY` (legacy full-access key) into a token->metadata map.
/// The legacy key is only added if its token is not already present as a
/// scoped key; it always carries `admin`.
pub fn load_api_key_store_from_env() -> ApiKeyStore {
    let mut out: ApiKeyStore = HashMap::new();

    let raw_multi = std::env::var("LEDGERFLOW_API_KEYS").unwrap_or_default();
    if !raw_multi.trim().is_empty() {
        let rows: Vec<ScopedKeyRow> = if let Ok(list) = serde_json::from_str::<Vec<ScopedKeyRow>>(&raw_multi) {
            list
        } else if let Ok(obj) = serde_json::from_str::<HashMap<String, ScopedKeyRow>>(&raw_multi) {
            obj.into_iter()
                .map(|(key_id, mut row)| {
                    if row.id.is_none() {
                        row.id = Some(key_id);
                    }
                    row
                })
                .collect()
        } else {
            Vec::new()
        };

        for (i, item) in rows.into_iter().enumerate() {
            let token = item.key.unwrap_or_default().trim().to_string();
            if token.is_empty() {
                continue;
            }
            let key_id = item.id.unwrap_or_default().trim().to_string();
            let key_id = if key_id.is_empty() { format!("key{}", i + 1) } else { key_id };
            let scopes_csv = item.scopes.as_ref().map(|s| s.joined());
            let mut scopes = parse_scopes(scopes_csv.as_deref(), &DEFAULT_RW_SCOPES);
            if scopes.is_empty() {
                scopes = DEFAULT_RW_SCOPES.iter().map(|s| s.to_string()).collect();
            }
            let workspaces = item.workspaces.unwrap_or_default().into_iter().map(|w| w.trim().to_string()).filter(|w| !w.is_empty()).collect();
            out.insert(
                token,
                KeyMeta {
                    id: key_id,
                    kind: KeyKind::Scoped,
                    scopes,
                    enabled: item.enabled.unwrap_or(true),
                    expires_at: item.expires_at,
                    workspaces,
                },
            );
        }
    }

    let legacy = std::env::var("LEDGERFLOW_API_KEY").unwrap_or_default().trim().to_string();
    if !legacy.is_empty() && !out.contains_key(&legacy) {
        let mut scopes: BTreeSet<String> = DEFAULT_RW_SCOPES.iter().map(|s| s.to_string()).collect();
        scopes.insert("admin".to_string());
        out.insert(
            legacy,
            KeyMeta { id: "legacy".to_string(), kind: KeyKind::Legacy, scopes, enabled: true, expires_at: None, workspaces: BTreeSet::new() },
        );
    }

    out
}

pub fn auth_mode_for_store(store: &ApiKeyStore) -> &'static str {
    if store.is_empty() {
        "local_only_no_key"
    } else if store.values().any(|meta| meta.kind == KeyKind::Scoped) {
        "api_key_scoped"
    } else {
        "api_key"
    }
}

/// Required scopes for a request (in order: base read/write, then any
/// path-specific extras), or `None` if the route needs no auth at all
/// (health checks, CORS preflight, anything outside `/api/`).
pub fn scopes_for_request(method: &str, path: &str) -> Option<Vec<&'static str>> {
    let method = method.to_uppercase();
    if !path.starts_with("/api/") {
        return None;
    }
    if path == "/api/health" || method == "OPTIONS" {
        return None;
    }

    let mut required = vec![if method == "GET" || method == "HEAD" { "read" } else { "write" }];
    if path.starts_with("/api/automation/") {
        required.push("automation");
    }
    if path == "/api/ops/metrics" {
        required.push("ops");
    }
    if path == "/api/auth/keys" || path.starts_with("/api/backup/") {
        required.push("admin");
    }
    Some(required)
}

pub enum DenyReason {
    MissingKey,
    UnknownKey,
    Disabled,
    Expired,
    Scope,
    Workspace,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::MissingKey => "missing_key",
            DenyReason::UnknownKey => "unknown_key",
            DenyReason::Disabled => "key_disabled",
            DenyReason::Expired => "key_expired",
            DenyReason::Scope => "insufficient_scope",
            DenyReason::Workspace => "workspace_denied",
        }
    }

    /// 401 for anything about the key itself, 403 for scope/workspace.
    pub fn http_status(&self) -> u16 {
        match self {
            DenyReason::MissingKey | DenyReason::UnknownKey | DenyReason::Disabled | DenyReason::Expired => 401,
            DenyReason::Scope | DenyReason::Workspace => 403,
        }
    }
}

impl From<DenyReason> for crate::error::LedgerFlowError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::Scope | DenyReason::Workspace => crate::error::LedgerFlowError::forbidden(reason.as_str()),
            _ => crate::error::LedgerFlowError::unauthorized(reason.as_str()),
        }
    }
}

/// Boundary-facing variant of `authorize`: collapses the deny reason into
/// the crate's typed error so external bindings get a single `Result` type
/// to propagate, matching the 401/403 split in the HTTP contract.
pub fn require_authorized(store: &ApiKeyStore, method: &str, path: &str, presented_key: Option<&str>, workspace: Option<&str>) -> crate::error::Result<Option<String>> {
    authorize(store, method, path, presented_key, workspace).map_err(Into::into)
}

/// Decides whether `presented_key` may perform a `method`/`path` request
/// against the given store, honoring an optional workspace header.
/// `Ok(None)` means the route needs no auth or the store is in
/// `local_only_no_key` mode; `Ok(Some(key_id))` means it was granted by
/// that key; `Err(reason)` means it was denied.
pub fn authorize(store: &ApiKeyStore, method: &str, path: &str, presented_key: Option<&str>, workspace: Option<&str>) -> Result<Option<String>, DenyReason> {
    let Some(required) = scopes_for_request(method, path) else { return Ok(None) };
    if store.is_empty() {
        return Ok(None);
    }
    let token = presented_key.ok_or(DenyReason::MissingKey)?;
    let meta = store.get(token).ok_or(DenyReason::UnknownKey)?;
    if !meta.enabled {
        return Err(DenyReason::Disabled);
    }
    if meta.is_expired(&timeutil::today_ymd()) {
        return Err(DenyReason::Expired);
    }
    if !meta.has_scopes(&required) {
        return Err(DenyReason::Scope);
    }
    if !meta.allows_workspace(workspace) {
        return Err(DenyReason::Workspace);
    }
    Ok(Some(meta.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(scopes: &[&str]) -> KeyMeta {
        KeyMeta {
            id: "k".to_string(),
            kind: KeyKind::Scoped,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            enabled: true,
            expires_at: None,
            workspaces: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_store_is_local_only_and_allows_everything() {
        let store = ApiKeyStore::new();
        assert_eq!(auth_mode_for_store(&store), "local_only_no_key");
        assert!(authorize(&store, "POST", "/api/transactions", None, None).is_ok());
    }

    #[test]
    fn scoped_key_without_write_is_denied_on_mutation() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_reader".to_string(), meta(&["read"]));
        assert!(authorize(&store, "GET", "/api/transactions", Some("tok_reader"), None).is_ok());
        let denied = authorize(&store, "POST", "/api/transactions", Some("tok_reader"), None).unwrap_err();
        assert_eq!(denied.as_str(), "insufficient_scope");
        assert_eq!(denied.http_status(), 403);
    }

    #[test]
    fn write_scope_implies_read() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_writer".to_string(), meta(&["write"]));
        assert!(authorize(&store, "GET", "/api/transactions", Some("tok_writer"), None).is_ok());
    }

    #[test]
    fn health_and_options_need_no_key() {
        let store = ApiKeyStore::new();
        assert!(authorize(&store, "GET", "/api/health", None, None).is_ok());
        assert!(authorize(&store, "OPTIONS", "/api/transactions", None, None).is_ok());
    }

    #[test]
    fn unknown_or_missing_key_is_denied_when_store_nonempty() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_real".to_string(), meta(&["read", "write"]));
        assert_eq!(authorize(&store, "GET", "/api/transactions", Some("tok_fake"), None).unwrap_err().as_str(), "unknown_key");
        assert_eq!(authorize(&store, "GET", "/api/transactions", None, None).unwrap_err().as_str(), "missing_key");
    }

    #[test]
    fn admin_scope_grants_everything_including_path_extras() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_admin".to_string(), meta(&["admin"]));
        assert!(authorize(&store, "DELETE", "/api/transactions/tx_1", Some("tok_admin"), None).is_ok());
        assert!(authorize(&store, "POST", "/api/automation/enqueue", Some("tok_admin"), None).is_ok());
        assert!(authorize(&store, "GET", "/api/auth/keys", Some("tok_admin"), None).is_ok());
    }

    #[test]
    fn automation_route_requires_automation_scope_beyond_write() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_writer".to_string(), meta(&["read", "write"]));
        let denied = authorize(&store, "POST", "/api/automation/enqueue", Some("tok_writer"), None).unwrap_err();
        assert_eq!(denied.as_str(), "insufficient_scope");
    }

    #[test]
    fn disabled_key_is_rejected() {
        let mut store = ApiKeyStore::new();
        let mut m = meta(&["admin"]);
        m.enabled = false;
        store.insert("tok_off".to_string(), m);
        assert_eq!(authorize(&store, "GET", "/api/transactions", Some("tok_off"), None).unwrap_err().as_str(), "key_disabled");
    }

    #[test]
    fn expired_key_is_rejected() {
        let mut store = ApiKeyStore::new();
        let mut m = meta(&["admin"]);
        m.expires_at = Some("2000-01-01".to_string());
        store.insert("tok_expired".to_string(), m);
        assert_eq!(authorize(&store, "GET", "/api/transactions", Some("tok_expired"), None).unwrap_err().as_str(), "key_expired");
    }

    #[test]
    fn require_authorized_maps_scope_denial_to_forbidden() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_reader".to_string(), meta(&["read"]));
        let err = require_authorized(&store, "POST", "/api/transactions", Some("tok_reader"), None).unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn require_authorized_maps_missing_key_to_unauthorized() {
        let mut store = ApiKeyStore::new();
        store.insert("tok_real".to_string(), meta(&["read", "write"]));
        let err = require_authorized(&store, "GET", "/api/transactions", None, None).unwrap_err();
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn workspace_allow_list_is_enforced() {
        let mut store = ApiKeyStore::new();
        let mut m = meta(&["read", "write"]);
        m.workspaces = ["team-a".to_string()].into_iter().collect();
        store.insert("tok_scoped_ws".to_string(), m);
        assert!(authorize(&store, "GET", "/api/transactions", Some("tok_scoped_ws"), Some("team-a")).is_ok());
        let denied = authorize(&store, "GET", "/api/transactions", Some("tok_scoped_ws"), Some("team-b")).unwrap_err();
        assert_eq!(denied.as_str(), "workspace_denied");
    }
}
