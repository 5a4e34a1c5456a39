//! Binary push protocol for the vehicle telemetry backend.
//!
//! A single persistent WebSocket carries MessagePack-encoded envelopes in both
//! directions. Inbound [`PushMessage`]s are decoded into a closed set of
//! [`PushEvent`] kinds; outbound [`ClientMessage`]s are acknowledgment
//! envelopes and command requests.
//!
//! Sequenced inbound kinds (telemetry batches, command status updates) must be
//! acknowledged or the backend stops delivering further updates. [`ack_for`]
//! builds the matching acknowledgment for a decoded event.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Envelope action constants
// ---------------------------------------------------------------------------

pub mod action {
    // Inbound (backend → client)
    pub const DEBUG_MESSAGE: i32 = 1;
    pub const COMMAND_STATUS: i32 = 2;
    pub const ASSIGNED_VEHICLES: i32 = 3;
    pub const PENDING_COMMAND: i32 = 4;
    pub const TELEMETRY: i32 = 5;

    // Outbound (client → backend)
    pub const ACK_COMMAND_STATUS: i32 = 20;
    pub const ACK_ASSIGNED_VEHICLES: i32 = 21;
    pub const ACK_TELEMETRY: i32 = 22;
    pub const COMMAND: i32 = 23;
}

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(String),

    #[error("envelope action {action} missing its payload")]
    MissingPayload { action: i32 },
}

// ---------------------------------------------------------------------------
// Wire envelope types (MessagePack)
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86

/// Inbound envelope. Exactly one payload field matches `action`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PushMessage {
    pub action: i32,
    pub debug_message: Option<DebugMessage>,
    pub command_status: Option<CommandStatusUpdate>,
    pub assigned_vehicles: Option<AssignedVehicles>,
    pub pending_command: Option<PendingCommandRequest>,
    pub telemetry: Option<TelemetryBatch>,
}

/// Outbound envelope: an acknowledgment or a command request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: i32,
    pub sequence_number: Option<i32>,
    pub command: Option<CommandRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugMessage {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub sequence_number: i32,
    /// Status updates per vin, each keyed to the request id of the command
    /// they answer.
    pub updates: BTreeMap<String, Vec<CommandStatus>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandStatus {
    pub request_id: Option<String>,
    pub status: Option<String>,
    pub errors: Vec<CommandError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AssignedVehicles {
    pub vins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PendingCommandRequest {
    pub request_id: Option<String>,
}

/// One batch of attribute updates, keyed by vin. Sequenced: must be
/// acknowledged with [`ClientMessage::ack_telemetry`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryBatch {
    pub sequence_number: i32,
    pub updates: BTreeMap<String, VehicleUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct VehicleUpdate {
    pub attributes: BTreeMap<String, Attribute>,
}

/// A single telemetry attribute. The backend sends attributes as a loose
/// field bag; at most one of the `*_value` fields is populated.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Attribute {
    pub display_value: Option<String>,
    pub status: Option<i32>,
    /// False when the backend is resending an unchanged value in bulk.
    pub changed: Option<bool>,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp: Option<i64>,
    pub bool_value: Option<bool>,
    pub int_value: Option<i64>,
    pub double_value: Option<f64>,
    pub string_value: Option<String>,
    pub nil_value: Option<bool>,
    pub unsupported_value: Option<bool>,
}

/// Typed projection of an [`Attribute`]'s value field.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Nil,
    Unsupported,
}

impl Attribute {
    /// The populated value field, if any.
    pub fn value(&self) -> Option<AttrValue> {
        if let Some(b) = self.bool_value {
            Some(AttrValue::Bool(b))
        } else if let Some(i) = self.int_value {
            Some(AttrValue::Int(i))
        } else if let Some(d) = self.double_value {
            Some(AttrValue::Double(d))
        } else if let Some(ref s) = self.string_value {
            Some(AttrValue::Str(s.clone()))
        } else if self.nil_value == Some(true) {
            Some(AttrValue::Nil)
        } else if self.unsupported_value == Some(true) {
            Some(AttrValue::Unsupported)
        } else {
            None
        }
    }

    /// All populated fields under their wire names, in publish order.
    pub fn fields(&self) -> Vec<(&'static str, serde_json::Value)> {
        let mut out = Vec::new();
        if let Some(ref v) = self.display_value {
            out.push(("displayValue", serde_json::Value::from(v.clone())));
        }
        if let Some(v) = self.status {
            out.push(("status", serde_json::Value::from(v)));
        }
        if let Some(v) = self.changed {
            out.push(("changed", serde_json::Value::from(v)));
        }
        if let Some(v) = self.timestamp {
            out.push(("timestamp", serde_json::Value::from(v)));
        }
        if let Some(v) = self.bool_value {
            out.push(("boolValue", serde_json::Value::from(v)));
        }
        if let Some(v) = self.int_value {
            out.push(("intValue", serde_json::Value::from(v)));
        }
        if let Some(v) = self.double_value {
            out.push(("doubleValue", serde_json::Value::from(v)));
        }
        if let Some(ref v) = self.string_value {
            out.push(("stringValue", serde_json::Value::from(v.clone())));
        }
        if let Some(v) = self.nil_value {
            out.push(("nilValue", serde_json::Value::from(v)));
        }
        if let Some(v) = self.unsupported_value {
            out.push(("unsupportedValue", serde_json::Value::from(v)));
        }
        out
    }
}

/// Outbound command. Each build gets a fresh request id; ids are never
/// reused, even when a command is retried by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandRequest {
    pub backend: i32,
    pub vin: String,
    pub request_id: String,
    pub kind: String,
    pub pin: Option<String>,
    pub precondition_type: Option<i32>,
    pub departure_time: Option<i32>,
}

impl CommandRequest {
    pub fn new(vin: &str, kind: &str) -> Self {
        Self {
            backend: 1,
            vin: vin.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            pin: None,
            precondition_type: None,
            departure_time: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded inbound events
// ---------------------------------------------------------------------------

/// Closed set of inbound event kinds.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Debug(DebugMessage),
    CommandStatus(CommandStatusUpdate),
    AssignedVehicles(AssignedVehicles),
    PendingCommand(PendingCommandRequest),
    Telemetry(TelemetryBatch),
    Unknown(i32),
}

/// Build the acknowledgment envelope required for an inbound event, if the
/// event kind is one the backend expects acknowledged.
pub fn ack_for(event: &PushEvent) -> Option<ClientMessage> {
    match event {
        PushEvent::CommandStatus(u) => Some(ClientMessage::ack_command_status(u.sequence_number)),
        PushEvent::AssignedVehicles(_) => Some(ClientMessage::ack_assigned_vehicles()),
        PushEvent::Telemetry(b) => Some(ClientMessage::ack_telemetry(b.sequence_number)),
        PushEvent::Debug(_) | PushEvent::PendingCommand(_) | PushEvent::Unknown(_) => None,
    }
}

impl ClientMessage {
    pub fn ack_command_status(sequence_number: i32) -> Self {
        Self {
            action: action::ACK_COMMAND_STATUS,
            sequence_number: Some(sequence_number),
            command: None,
        }
    }

    pub fn ack_assigned_vehicles() -> Self {
        Self {
            action: action::ACK_ASSIGNED_VEHICLES,
            sequence_number: None,
            command: None,
        }
    }

    pub fn ack_telemetry(sequence_number: i32) -> Self {
        Self {
            action: action::ACK_TELEMETRY,
            sequence_number: Some(sequence_number),
            command: None,
        }
    }

    pub fn command(request: CommandRequest) -> Self {
        Self {
            action: action::COMMAND,
            sequence_number: None,
            command: Some(request),
        }
    }
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

pub fn encode_client(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn encode_push(msg: &PushMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Decode an inbound frame into a typed event.
///
/// A known action with its payload field absent is a decode error: the wire
/// protocol has no resynchronization marker, so callers treat any decode
/// failure as connection-fatal.
pub fn decode_push(data: &[u8]) -> Result<PushEvent, ProtocolError> {
    let msg: PushMessage = decode_envelope(data)?;
    match msg.action {
        action::DEBUG_MESSAGE => msg
            .debug_message
            .map(PushEvent::Debug)
            .ok_or(ProtocolError::MissingPayload { action: msg.action }),
        action::COMMAND_STATUS => msg
            .command_status
            .map(PushEvent::CommandStatus)
            .ok_or(ProtocolError::MissingPayload { action: msg.action }),
        action::ASSIGNED_VEHICLES => msg
            .assigned_vehicles
            .map(PushEvent::AssignedVehicles)
            .ok_or(ProtocolError::MissingPayload { action: msg.action }),
        action::PENDING_COMMAND => msg
            .pending_command
            .map(PushEvent::PendingCommand)
            .ok_or(ProtocolError::MissingPayload { action: msg.action }),
        action::TELEMETRY => msg
            .telemetry
            .map(PushEvent::Telemetry)
            .ok_or(ProtocolError::MissingPayload { action: msg.action }),
        other => Ok(PushEvent::Unknown(other)),
    }
}

/// Decode an outbound frame. Used by the backend side of tests.
pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    decode_envelope(data)
}

fn decode_envelope<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    // Three-step decode: msgpack → rmpv::Value → serde_json::Value → T.
    //
    // 1. rmpv::Value handles msgpack binary data (which serde_json::Value cannot).
    // 2. serde_json::Value deduplicates map keys (the backend may repeat a
    //    field, which rmp_serde's struct deserializer rejects).
    // This adds allocation overhead compared to direct struct deserialization.
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ProtocolError::Decode(format!("msgpack read: {e}")))?;
    let json = rmpv_to_json(value);
    serde_json::from_value(json).map_err(|e| ProtocolError::Decode(format!("envelope: {e}")))
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => {
            if s.is_str() {
                serde_json::Value::String(s.into_str().unwrap_or_default().to_string())
            } else {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                serde_json::Value::String(String::new())
            }
        }
        rmpv::Value::Binary(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => {
                            if s.is_str() {
                                s.into_str().unwrap_or_default().to_string()
                            } else {
                                tracing::warn!(
                                    "msgpack map key contains invalid UTF-8, substituting empty string"
                                );
                                String::new()
                            }
                        }
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
        rmpv::Value::Ext(_, bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_msg(seq: i32, vin: &str, attr: &str, attribute: Attribute) -> PushMessage {
        let mut attributes = BTreeMap::new();
        attributes.insert(attr.to_string(), attribute);
        let mut updates = BTreeMap::new();
        updates.insert(vin.to_string(), VehicleUpdate { attributes });
        PushMessage {
            action: action::TELEMETRY,
            telemetry: Some(TelemetryBatch {
                sequence_number: seq,
                updates,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn decode_telemetry_batch() {
        let msg = telemetry_msg(
            7,
            "W1K0000001",
            "tanklevelpercent",
            Attribute {
                int_value: Some(55),
                changed: Some(true),
                display_value: Some("55".into()),
                ..Default::default()
            },
        );
        let data = encode_push(&msg).unwrap();
        let event = decode_push(&data).unwrap();
        let PushEvent::Telemetry(batch) = event else {
            panic!("expected Telemetry, got {event:?}");
        };
        assert_eq!(batch.sequence_number, 7);
        let attr = &batch.updates["W1K0000001"].attributes["tanklevelpercent"];
        assert_eq!(attr.value(), Some(AttrValue::Int(55)));
        assert_eq!(attr.changed, Some(true));
    }

    #[test]
    fn decode_unknown_action() {
        let msg = PushMessage {
            action: 99,
            ..Default::default()
        };
        let data = encode_push(&msg).unwrap();
        match decode_push(&data).unwrap() {
            PushEvent::Unknown(99) => {}
            other => panic!("expected Unknown(99), got {other:?}"),
        }
    }

    #[test]
    fn decode_known_action_without_payload_fails() {
        let msg = PushMessage {
            action: action::TELEMETRY,
            ..Default::default()
        };
        let data = encode_push(&msg).unwrap();
        let err = decode_push(&data).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingPayload { action: 5 }
        ));
    }

    #[test]
    fn decode_garbage_fails() {
        // A msgpack string where a map is expected
        let data = rmp_serde::to_vec("not an envelope").unwrap();
        assert!(decode_push(&data).is_err());
    }

    #[test]
    fn ack_telemetry_echoes_sequence_number() {
        let msg = telemetry_msg(41, "VIN1", "soc", Attribute::default());
        let data = encode_push(&msg).unwrap();
        let event = decode_push(&data).unwrap();
        let ack = ack_for(&event).unwrap();
        assert_eq!(ack.action, action::ACK_TELEMETRY);
        assert_eq!(ack.sequence_number, Some(41));
    }

    #[test]
    fn ack_command_status_echoes_sequence_number() {
        let event = PushEvent::CommandStatus(CommandStatusUpdate {
            sequence_number: 9,
            updates: BTreeMap::new(),
        });
        let ack = ack_for(&event).unwrap();
        assert_eq!(ack.action, action::ACK_COMMAND_STATUS);
        assert_eq!(ack.sequence_number, Some(9));
    }

    #[test]
    fn ack_assigned_vehicles_carries_no_sequence() {
        let event = PushEvent::AssignedVehicles(AssignedVehicles {
            vins: vec!["VIN1".into()],
        });
        let ack = ack_for(&event).unwrap();
        assert_eq!(ack.action, action::ACK_ASSIGNED_VEHICLES);
        assert_eq!(ack.sequence_number, None);
    }

    #[test]
    fn debug_pending_and_unknown_need_no_ack() {
        assert!(ack_for(&PushEvent::Debug(DebugMessage::default())).is_none());
        assert!(ack_for(&PushEvent::PendingCommand(PendingCommandRequest::default())).is_none());
        assert!(ack_for(&PushEvent::Unknown(42)).is_none());
    }

    #[test]
    fn client_command_round_trip() {
        let req = CommandRequest::new("VIN1", "DOORS_LOCK");
        let msg = ClientMessage::command(req.clone());
        let data = encode_client(&msg).unwrap();
        let decoded = decode_client(&data).unwrap();
        assert_eq!(decoded.action, action::COMMAND);
        let cmd = decoded.command.unwrap();
        assert_eq!(cmd.vin, "VIN1");
        assert_eq!(cmd.kind, "DOORS_LOCK");
        assert_eq!(cmd.request_id, req.request_id);
        assert_eq!(cmd.backend, 1);
    }

    #[test]
    fn command_request_ids_are_fresh() {
        let a = CommandRequest::new("VIN1", "DOORS_LOCK");
        let b = CommandRequest::new("VIN1", "DOORS_LOCK");
        assert_ne!(a.request_id, b.request_id);
        assert!(!a.request_id.is_empty());
    }

    #[test]
    fn attribute_value_projection() {
        let attr = Attribute {
            bool_value: Some(true),
            ..Default::default()
        };
        assert_eq!(attr.value(), Some(AttrValue::Bool(true)));

        let attr = Attribute {
            double_value: Some(22.5),
            ..Default::default()
        };
        assert_eq!(attr.value(), Some(AttrValue::Double(22.5)));

        let attr = Attribute {
            nil_value: Some(true),
            ..Default::default()
        };
        assert_eq!(attr.value(), Some(AttrValue::Nil));

        let attr = Attribute {
            unsupported_value: Some(true),
            ..Default::default()
        };
        assert_eq!(attr.value(), Some(AttrValue::Unsupported));

        assert_eq!(Attribute::default().value(), None);
    }

    #[test]
    fn attribute_fields_use_wire_names() {
        let attr = Attribute {
            int_value: Some(70),
            changed: Some(false),
            display_value: Some("70 %".into()),
            timestamp: Some(1_700_000_000_000),
            ..Default::default()
        };
        let fields = attr.fields();
        let names: Vec<&str> = fields.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["displayValue", "changed", "timestamp", "intValue"]);
        assert_eq!(fields[3].1, serde_json::json!(70));
    }

    #[test]
    fn decode_tolerates_binary_payload() {
        // Backends occasionally ship raw bytes where a string is expected;
        // the value-level bridge turns them into base64 strings instead of
        // failing the whole frame.
        let map = rmpv::Value::Map(vec![
            (
                rmpv::Value::String("action".into()),
                rmpv::Value::Integer(action::DEBUG_MESSAGE.into()),
            ),
            (
                rmpv::Value::String("debugMessage".into()),
                rmpv::Value::Map(vec![(
                    rmpv::Value::String("message".into()),
                    rmpv::Value::Binary(b"hello".to_vec()),
                )]),
            ),
        ]);
        let mut data = Vec::new();
        rmpv::encode::write_value(&mut data, &map).unwrap();
        match decode_push(&data).unwrap() {
            PushEvent::Debug(d) => assert_eq!(d.message.as_deref(), Some("aGVsbG8=")),
            other => panic!("expected Debug, got {other:?}"),
        }
    }

    #[test]
    fn decode_tolerates_duplicate_map_keys() {
        let vins = rmpv::Value::Map(vec![(
            rmpv::Value::String("vins".into()),
            rmpv::Value::Array(vec![rmpv::Value::String("VIN1".into())]),
        )]);
        let map = rmpv::Value::Map(vec![
            (
                rmpv::Value::String("action".into()),
                rmpv::Value::Integer(action::ASSIGNED_VEHICLES.into()),
            ),
            (
                rmpv::Value::String("assignedVehicles".into()),
                vins.clone(),
            ),
            (rmpv::Value::String("assignedVehicles".into()), vins),
        ]);
        let mut data = Vec::new();
        rmpv::encode::write_value(&mut data, &map).unwrap();
        match decode_push(&data).unwrap() {
            PushEvent::AssignedVehicles(av) => assert_eq!(av.vins, vec!["VIN1"]),
            other => panic!("expected AssignedVehicles, got {other:?}"),
        }
    }
}
