//! Provider webhook adapter: signature check, challenge handshake, parsing.
//!
//! The signature is verified over the exact body bytes before anything is
//! parsed. Only after that is the payload treated as a trusted event source.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::IngestionError;
use crate::types::{parse_timestamp, ActivityEvent, ActivityKind, EventPayload, EventSource};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_VERSION: &str = "v0";
const URL_VALIDATION_EVENT: &str = "endpoint.url_validation";

// ═══════════════════════════════════════════════════════════════════════════════
// Signatures
// ═══════════════════════════════════════════════════════════════════════════════

fn mac_for(secret: &str) -> Result<HmacSha256, IngestionError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| IngestionError::SecretNotConfigured)
}

/// Signature header value the provider would send for `body` at `timestamp`.
pub fn compute_signature(secret: &str, timestamp: &str, body: &str) -> Result<String, IngestionError> {
    let mut mac = mac_for(secret)?;
    mac.update(format!("{}:{}:{}", SIGNATURE_VERSION, timestamp, body).as_bytes());
    Ok(format!(
        "{}={}",
        SIGNATURE_VERSION,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a `v0=<hex>` signature and the replay window.
///
/// `timestamp` is the provider's request timestamp in unix seconds.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    body: &str,
    signature: &str,
    now: DateTime<Utc>,
    tolerance_secs: u64,
) -> Result<(), IngestionError> {
    if secret.is_empty() {
        return Err(IngestionError::SecretNotConfigured);
    }
    let sent_at: i64 = timestamp.trim().parse().map_err(|_| {
        IngestionError::MalformedPayload("timestamp must be unix seconds".to_string())
    })?;
    if now.timestamp().abs_diff(sent_at) > tolerance_secs {
        return Err(IngestionError::StaleTimestamp {
            timestamp: timestamp.to_string(),
        });
    }

    let digest = signature
        .strip_prefix("v0=")
        .and_then(|hex_part| hex::decode(hex_part).ok())
        .ok_or(IngestionError::BadSignature)?;
    let mut mac = mac_for(secret)?;
    mac.update(format!("{}:{}:{}", SIGNATURE_VERSION, timestamp.trim(), body).as_bytes());
    mac.verify_slice(&digest)
        .map_err(|_| IngestionError::BadSignature)
}

/// Answer to the provider's endpoint registration handshake.
pub fn challenge_response(secret: &str, plain_token: &str) -> Result<Value, IngestionError> {
    let mut mac = mac_for(secret)?;
    mac.update(plain_token.as_bytes());
    Ok(json!({
        "plainToken": plain_token,
        "encryptedToken": hex::encode(mac.finalize().into_bytes()),
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Body Parsing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    #[serde(default)]
    event_ts: Option<i64>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ValidationPayload {
    #[serde(rename = "plainToken")]
    plain_token: String,
}

#[derive(Debug, Deserialize)]
struct ParticipantPayload {
    object: MeetingObject,
}

#[derive(Debug, Deserialize)]
struct MeetingObject {
    id: Value,
    start_time: String,
    duration: u32,
    participant: ParticipantObject,
}

#[derive(Debug, Deserialize)]
struct ParticipantObject {
    user_id: Value,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    join_time: Option<String>,
    #[serde(default)]
    leave_time: Option<String>,
    #[serde(default)]
    date_time: Option<String>,
    #[serde(default)]
    duration: Option<u64>,
}

/// A participant activity event addressed to one attendance session.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantEvent {
    pub event_id: String,
    pub kind: ActivityKind,
    pub occurred_at: DateTime<Utc>,
    pub participant_id: String,
    pub meeting_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_duration_min: u32,
    pub reported_duration_secs: Option<u64>,
}

impl ParticipantEvent {
    pub fn session_id(&self) -> String {
        session_id_for(&self.participant_id, &self.meeting_id, self.scheduled_start)
    }

    pub fn to_activity_event(&self) -> ActivityEvent {
        ActivityEvent {
            event_id: self.event_id.clone(),
            kind: self.kind,
            occurred_at: self.occurred_at,
            source: EventSource::Webhook,
            sequence: 0,
            payload: EventPayload {
                reported_duration_secs: self.reported_duration_secs,
                ..EventPayload::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookMessage {
    UrlValidation { plain_token: String },
    Participant(ParticipantEvent),
    /// A well-formed event this service does not track.
    Ignored { event: String },
}

fn kind_for_event(event: &str) -> Option<ActivityKind> {
    match event {
        "meeting.participant_joined" => Some(ActivityKind::Join),
        "meeting.participant_rejoined" => Some(ActivityKind::Rejoin),
        "meeting.participant_left" => Some(ActivityKind::Leave),
        "meeting.participant_video_on" => Some(ActivityKind::VideoOn),
        "meeting.participant_video_off" => Some(ActivityKind::VideoOff),
        "meeting.participant_audio_on" => Some(ActivityKind::AudioOn),
        "meeting.participant_audio_off" => Some(ActivityKind::AudioOff),
        _ => None,
    }
}

/// Provider ids arrive as strings or numbers; both map to the same text.
fn id_text(value: &Value, field: &str) -> Result<String, IngestionError> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    };
    if text.is_empty() {
        return Err(IngestionError::MalformedPayload(format!("{} is required", field)));
    }
    Ok(text)
}

fn timestamp_field(value: &str, field: &str) -> Result<DateTime<Utc>, IngestionError> {
    parse_timestamp(value)
        .ok_or_else(|| IngestionError::MalformedPayload(format!("{} must be RFC3339", field)))
}

pub fn parse_webhook_body(body: &str) -> Result<WebhookMessage, IngestionError> {
    let parsed: WebhookBody = serde_json::from_str(body)
        .map_err(|err| IngestionError::MalformedPayload(format!("webhook body: {}", err)))?;

    if parsed.event == URL_VALIDATION_EVENT {
        let payload: ValidationPayload = serde_json::from_value(parsed.payload).map_err(|err| {
            IngestionError::MalformedPayload(format!("url validation payload: {}", err))
        })?;
        return Ok(WebhookMessage::UrlValidation {
            plain_token: payload.plain_token,
        });
    }

    let Some(kind) = kind_for_event(&parsed.event) else {
        return Ok(WebhookMessage::Ignored {
            event: parsed.event,
        });
    };

    let payload: ParticipantPayload = serde_json::from_value(parsed.payload).map_err(|err| {
        IngestionError::MalformedPayload(format!("participant payload: {}", err))
    })?;
    let object = payload.object;
    let participant = object.participant;

    let meeting_id = id_text(&object.id, "object.id")?;
    let participant_id = id_text(&participant.user_id, "participant.user_id")?;
    let scheduled_start = timestamp_field(&object.start_time, "object.start_time")?;

    let occurrence = match kind {
        ActivityKind::Join | ActivityKind::Rejoin => participant.join_time.as_deref(),
        ActivityKind::Leave => participant.leave_time.as_deref(),
        _ => participant.date_time.as_deref(),
    };
    let occurred_at = match (occurrence, parsed.event_ts) {
        (Some(text), _) => timestamp_field(text, "participant occurrence time")?,
        (None, Some(millis)) => Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
            IngestionError::MalformedPayload("event_ts is out of range".to_string())
        })?,
        (None, None) => {
            return Err(IngestionError::MalformedPayload(
                "event has no occurrence time".to_string(),
            ))
        }
    };

    let event_id = match participant.event_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => derived_event_id(&parsed.event, &meeting_id, &participant_id, occurred_at),
    };

    Ok(WebhookMessage::Participant(ParticipantEvent {
        event_id,
        kind,
        occurred_at,
        participant_id,
        meeting_id,
        scheduled_start,
        scheduled_duration_min: object.duration,
        reported_duration_secs: if kind == ActivityKind::Leave {
            participant.duration
        } else {
            None
        },
    }))
}

/// Stable id for provider events that carry none, so redelivery deduplicates.
fn derived_event_id(
    event: &str,
    meeting_id: &str,
    participant_id: &str,
    occurred_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.as_bytes());
    hasher.update(b"|");
    hasher.update(meeting_id.as_bytes());
    hasher.update(b"|");
    hasher.update(participant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(occurred_at.timestamp_millis().to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("wh-{}", &digest[..32])
}

/// Session key: one participant in one scheduled meeting instance.
pub fn session_id_for(
    participant_id: &str,
    meeting_id: &str,
    scheduled_start: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(participant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(meeting_id.as_bytes());
    hasher.update(b"|");
    hasher.update(scheduled_start.timestamp_millis().to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("ses-{}", &digest[..24])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec-test";

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_442_000, 0).single().expect("now")
    }

    fn joined_body() -> String {
        json!({
            "event": "meeting.participant_joined",
            "event_ts": 1_772_442_000_000i64,
            "payload": {
                "object": {
                    "id": 8_812_345,
                    "start_time": "2026-03-02T09:00:00Z",
                    "duration": 60,
                    "participant": {
                        "user_id": "u-42",
                        "join_time": "2026-03-02T09:01:30Z"
                    }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn accepts_valid_signature_within_tolerance() {
        let body = joined_body();
        let timestamp = now().timestamp().to_string();
        let signature = compute_signature(SECRET, &timestamp, &body).expect("sign");
        assert!(signature.starts_with("v0="));
        verify_signature(SECRET, &timestamp, &body, &signature, now(), 300).expect("valid");
    }

    #[test]
    fn rejects_tampered_body_and_stale_timestamp() {
        let body = joined_body();
        let timestamp = now().timestamp().to_string();
        let signature = compute_signature(SECRET, &timestamp, &body).expect("sign");
        let tampered = body.replace("u-42", "u-43");
        assert_eq!(
            verify_signature(SECRET, &timestamp, &tampered, &signature, now(), 300),
            Err(IngestionError::BadSignature)
        );

        let later = now() + chrono::Duration::seconds(301);
        assert!(matches!(
            verify_signature(SECRET, &timestamp, &body, &signature, later, 300),
            Err(IngestionError::StaleTimestamp { .. })
        ));
        assert_eq!(
            verify_signature(SECRET, &timestamp, &body, "sha256=abc", now(), 300),
            Err(IngestionError::BadSignature)
        );
    }

    #[test]
    fn empty_secret_is_not_configured() {
        assert_eq!(
            verify_signature("", "1", "{}", "v0=00", now(), 300),
            Err(IngestionError::SecretNotConfigured)
        );
    }

    #[test]
    fn parses_participant_join() {
        let message = parse_webhook_body(&joined_body()).expect("parse");
        let WebhookMessage::Participant(event) = message else {
            panic!("expected participant event");
        };
        assert_eq!(event.kind, ActivityKind::Join);
        assert_eq!(event.meeting_id, "8812345");
        assert_eq!(event.participant_id, "u-42");
        assert_eq!(event.scheduled_duration_min, 60);
        assert!(event.event_id.starts_with("wh-"));
        assert_eq!(
            parse_webhook_body(&joined_body()).expect("reparse"),
            WebhookMessage::Participant(event.clone())
        );
        assert!(event.session_id().starts_with("ses-"));
    }

    #[test]
    fn leave_carries_provider_duration() {
        let body = json!({
            "event": "meeting.participant_left",
            "payload": { "object": {
                "id": "m-1",
                "start_time": "2026-03-02T09:00:00Z",
                "duration": 60,
                "participant": {
                    "user_id": "u-1",
                    "event_id": "evt-9",
                    "leave_time": "2026-03-02T10:00:00Z",
                    "duration": 3600
                }
            }}
        })
        .to_string();
        let WebhookMessage::Participant(event) = parse_webhook_body(&body).expect("parse") else {
            panic!("expected participant event");
        };
        assert_eq!(event.event_id, "evt-9");
        assert_eq!(event.reported_duration_secs, Some(3600));
        assert_eq!(
            event.to_activity_event().payload.reported_duration_secs,
            Some(3600)
        );
    }

    #[test]
    fn url_validation_and_unknown_events() {
        let body = json!({
            "event": "endpoint.url_validation",
            "payload": { "plainToken": "tok-1" }
        })
        .to_string();
        assert_eq!(
            parse_webhook_body(&body).expect("parse"),
            WebhookMessage::UrlValidation {
                plain_token: "tok-1".to_string()
            }
        );
        let response = challenge_response(SECRET, "tok-1").expect("challenge");
        assert_eq!(response["plainToken"], "tok-1");
        assert_eq!(response["encryptedToken"].as_str().map(str::len), Some(64));

        let ignored = json!({ "event": "meeting.started", "payload": {} }).to_string();
        assert!(matches!(
            parse_webhook_body(&ignored).expect("parse"),
            WebhookMessage::Ignored { .. }
        ));
    }

    #[test]
    fn missing_participant_id_is_malformed() {
        let body = json!({
            "event": "meeting.participant_joined",
            "payload": { "object": {
                "id": "m-1",
                "start_time": "2026-03-02T09:00:00Z",
                "duration": 60,
                "participant": { "user_id": "", "join_time": "2026-03-02T09:00:00Z" }
            }}
        })
        .to_string();
        assert!(matches!(
            parse_webhook_body(&body),
            Err(IngestionError::MalformedPayload(_))
        ));
    }
}
