//! IPC protocol types and validation for the attestation daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_ID_LEN: usize = 128;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Webhook,
    Heartbeat,
    RunSweep,
    GetSession,
    ListSessions,
    GetRecord,
    VerifyRecord,
    DrainOutbox,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// A provider callback as received by the HTTP edge, forwarded verbatim.
///
/// `body` must be the exact byte sequence the provider signed; the daemon
/// recomputes the signature over it before parsing anything.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookParams {
    pub signature: String,
    pub timestamp: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    Active,
    Idle,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatParams {
    pub event_id: String,
    pub session_id: String,
    pub occurred_at: String,
    pub state: HeartbeatState,
    #[serde(default)]
    pub mouse_active: bool,
    #[serde(default)]
    pub keyboard_active: bool,
    #[serde(default)]
    pub tab_focused: bool,
}

impl HeartbeatParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.event_id, "event_id")?;
        require_id(&self.session_id, "session_id")?;
        require_timestamp(&self.occurred_at, "occurred_at")?;
        Ok(())
    }
}

/// Public lookup: exactly one of `record_id` or `card_number`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RecordLookup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_number: Option<String>,
}

impl RecordLookup {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match (&self.record_id, &self.card_number) {
            (Some(id), None) => require_id(id, "record_id"),
            (None, Some(card)) => require_id(card, "card_number"),
            _ => Err(ErrorInfo::new(
                "invalid_params",
                "exactly one of record_id or card_number is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionLookup {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ListParams {
    pub fn effective_limit(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
    }
}

pub fn parse_webhook(params: Value) -> Result<WebhookParams, ErrorInfo> {
    let parsed: WebhookParams = parse_params(params, "webhook")?;
    if parsed.signature.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "signature is required"));
    }
    if parsed.timestamp.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "timestamp is required"));
    }
    if parsed.body.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "body is required"));
    }
    Ok(parsed)
}

pub fn parse_heartbeat(params: Value) -> Result<HeartbeatParams, ErrorInfo> {
    let parsed: HeartbeatParams = parse_params(params, "heartbeat")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_record_lookup(params: Value) -> Result<RecordLookup, ErrorInfo> {
    let parsed: RecordLookup = parse_params(params, "record lookup")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_session_lookup(params: Value) -> Result<SessionLookup, ErrorInfo> {
    let parsed: SessionLookup = parse_params(params, "session lookup")?;
    require_id(&parsed.session_id, "session_id")?;
    Ok(parsed)
}

pub fn parse_list(params: Option<Value>) -> Result<ListParams, ErrorInfo> {
    match params {
        Some(value) => parse_params(value, "list"),
        None => Ok(ListParams::default()),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value, what: &str) -> Result<T, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", what, err),
        )
    })
}

fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_id",
            format!("{} must be {} characters or fewer", field, MAX_ID_LEN),
        ));
    }
    Ok(())
}

fn require_timestamp(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if DateTime::parse_from_rfc3339(value).is_err() {
        return Err(ErrorInfo::new(
            "invalid_timestamp",
            format!("{} must be RFC3339", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_heartbeat() -> HeartbeatParams {
        HeartbeatParams {
            event_id: "hb-1".to_string(),
            session_id: "session-1".to_string(),
            occurred_at: "2026-01-30T12:00:00Z".to_string(),
            state: HeartbeatState::Active,
            mouse_active: true,
            keyboard_active: false,
            tab_focused: true,
        }
    }

    #[test]
    fn validates_heartbeat() {
        assert!(base_heartbeat().validate().is_ok());
    }

    #[test]
    fn rejects_heartbeat_with_bad_timestamp() {
        let mut heartbeat = base_heartbeat();
        heartbeat.occurred_at = "yesterday".to_string();
        let err = heartbeat.validate().expect_err("bad timestamp");
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn rejects_long_session_id() {
        let mut heartbeat = base_heartbeat();
        heartbeat.session_id = "s".repeat(256);
        assert!(heartbeat.validate().is_err());
    }

    #[test]
    fn parse_heartbeat_rejects_unknown_fields() {
        let params = json!({
            "event_id": "hb-1",
            "session_id": "session-1",
            "occurred_at": "2026-01-30T12:00:00Z",
            "state": "active",
            "camera": true
        });
        assert!(parse_heartbeat(params).is_err());
    }

    #[test]
    fn record_lookup_requires_exactly_one_key() {
        assert!(RecordLookup::default().validate().is_err());
        let both = RecordLookup {
            record_id: Some("01J".to_string()),
            card_number: Some("ATT-2026-ABCDEF0123".to_string()),
        };
        assert!(both.validate().is_err());
        let card = parse_record_lookup(json!({ "card_number": "ATT-2026-ABCDEF0123" }))
            .expect("card lookup");
        assert_eq!(card.card_number.as_deref(), Some("ATT-2026-ABCDEF0123"));
    }

    #[test]
    fn webhook_requires_signature_and_body() {
        let missing_sig = json!({ "signature": " ", "timestamp": "1", "body": "{}" });
        assert_eq!(
            parse_webhook(missing_sig).expect_err("signature").code,
            "missing_field"
        );
        let ok = json!({ "signature": "v0=ab", "timestamp": "1", "body": "{}" });
        assert!(parse_webhook(ok).is_ok());
    }

    #[test]
    fn list_limit_is_clamped() {
        let params = parse_list(Some(json!({ "limit": 50_000 }))).expect("list params");
        assert_eq!(params.effective_limit(100), MAX_LIST_LIMIT);
        let default = parse_list(None).expect("default params");
        assert_eq!(default.effective_limit(100), 100);
    }

    #[test]
    fn method_names_are_snake_case() {
        let request: Request = serde_json::from_value(json!({
            "protocol_version": 1,
            "method": "run_sweep"
        }))
        .expect("request");
        assert_eq!(request.method, Method::RunSweep);
    }
}
