//! Wire protocol: JSON text frames shaped `{"type": <tag>, "payload": {...}}`.
//!
//! Inbound frames are decoded into a closed [`InboundMessage`] union with an
//! explicit `Unknown` fallback. The MIDI source also emits flat frames (fields
//! beside `type`, MIDI data under `event`), which decode to the same union.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Highest valid MIDI channel (channels are 0-based on the wire).
pub const MAX_MIDI_CHANNEL: i64 = 15;

/// Highest valid 7-bit MIDI data value.
pub const MAX_MIDI_DATA: i64 = 127;

/// Velocity assumed when a note_on omits it.
pub const DEFAULT_VELOCITY: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
    ControlChange,
    ProgramChange,
    PitchBend,
    /// Any other kind; delivered to the generic subscribers.
    Other(String),
}

impl MidiEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            MidiEventKind::NoteOn => "note_on",
            MidiEventKind::NoteOff => "note_off",
            MidiEventKind::ControlChange => "control_change",
            MidiEventKind::ProgramChange => "program_change",
            MidiEventKind::PitchBend => "pitch_bend",
            MidiEventKind::Other(name) => name,
        }
    }
}

impl From<String> for MidiEventKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "note_on" => MidiEventKind::NoteOn,
            "note_off" => MidiEventKind::NoteOff,
            "control_change" => MidiEventKind::ControlChange,
            "program_change" => MidiEventKind::ProgramChange,
            "pitch_bend" => MidiEventKind::PitchBend,
            _ => MidiEventKind::Other(name),
        }
    }
}

impl From<MidiEventKind> for String {
    fn from(kind: MidiEventKind) -> Self {
        match kind {
            MidiEventKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// A validated MIDI event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    #[serde(rename = "type")]
    pub kind: MidiEventKind,
    pub channel: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<i32>,
    /// Sender clock, ms since epoch.
    pub timestamp: f64,
    /// Receiver clock, assigned on receipt.
    #[serde(default)]
    pub arrival: f64,
}

/// Schema of a MIDI payload before range checks.
#[derive(Debug, Deserialize)]
struct RawMidiEvent {
    #[serde(rename = "type")]
    kind: String,
    channel: i64,
    timestamp: f64,
    #[serde(default)]
    note: Option<i64>,
    #[serde(default)]
    velocity: Option<i64>,
    #[serde(default)]
    control: Option<i64>,
    #[serde(default)]
    value: Option<i64>,
    #[serde(default)]
    program: Option<i64>,
}

impl MidiEvent {
    pub fn note_on(channel: u8, note: i32, velocity: u8, timestamp: f64) -> Self {
        Self::note(MidiEventKind::NoteOn, channel, note, Some(velocity), timestamp)
    }

    pub fn note_off(channel: u8, note: i32, timestamp: f64) -> Self {
        Self::note(MidiEventKind::NoteOff, channel, note, None, timestamp)
    }

    fn note(
        kind: MidiEventKind,
        channel: u8,
        note: i32,
        velocity: Option<u8>,
        timestamp: f64,
    ) -> Self {
        Self {
            kind,
            channel,
            note: Some(note),
            velocity,
            control: None,
            value: None,
            program: None,
            timestamp,
            arrival: 0.0,
        }
    }

    /// Validate a MIDI payload and stamp it with its arrival time.
    ///
    /// Rejects a missing or mistyped kind, channel or timestamp, a channel
    /// outside 0-15, a velocity outside 0-127 and a note event without a
    /// note. A note_on with velocity 0 is normalised to a note_off.
    pub fn from_payload(payload: &Value, arrival: f64) -> Result<Self, ChannelError> {
        let raw: RawMidiEvent =
            serde_json::from_value(payload.clone()).map_err(|err| invalid(err.to_string()))?;

        if !(0..=MAX_MIDI_CHANNEL).contains(&raw.channel) {
            return Err(invalid(format!("channel {} outside 0-15", raw.channel)));
        }
        if !raw.timestamp.is_finite() {
            return Err(invalid("timestamp is not finite"));
        }
        let velocity = match raw.velocity {
            Some(v) if !(0..=MAX_MIDI_DATA).contains(&v) => {
                return Err(invalid(format!("velocity {} outside 0-127", v)));
            }
            Some(v) => Some(v as u8),
            None => None,
        };

        let mut kind = MidiEventKind::from(raw.kind);
        let is_note = matches!(kind, MidiEventKind::NoteOn | MidiEventKind::NoteOff);
        if is_note && raw.note.is_none() {
            return Err(invalid(format!("{} without a note", kind.as_str())));
        }
        let velocity = if kind == MidiEventKind::NoteOn {
            if velocity == Some(0) {
                kind = MidiEventKind::NoteOff;
            }
            Some(velocity.unwrap_or(DEFAULT_VELOCITY))
        } else {
            velocity
        };

        Ok(Self {
            kind,
            channel: raw.channel as u8,
            note: raw.note.map(saturate),
            velocity,
            control: raw.control.map(saturate),
            value: raw.value.map(saturate),
            program: raw.program.map(saturate),
            timestamp: raw.timestamp,
            arrival,
        })
    }

    /// Velocity for rendering; note events always carry one after validation.
    pub fn velocity_or_default(&self) -> u8 {
        self.velocity.unwrap_or(DEFAULT_VELOCITY)
    }
}

fn invalid(reason: impl Into<String>) -> ChannelError {
    ChannelError::InvalidMidiEvent {
        reason: reason.into(),
    }
}

fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    MidiEvent(MidiEvent),
    /// `system_status` or the source's `status` reply, forwarded verbatim.
    SystemStatus(Value),
    /// `connection_established` greeting.
    ServerInfo(Value),
    Ping { timestamp: f64 },
    /// `timestamp` is our own echoed send time.
    Pong {
        timestamp: f64,
        client_time: Option<f64>,
    },
    Unknown { kind: String },
}

/// A parsed frame before its payload is interpreted.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: String,
    /// `payload` (or `event`) when present, otherwise the remaining fields.
    pub payload: Value,
    /// Whether the frame carried a nested payload object.
    pub nested: bool,
    pub sender_timestamp: Option<f64>,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(ChannelError::MalformedPayload {
                reason: "frame is not a JSON object".to_string(),
            });
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(ChannelError::MalformedPayload {
                    reason: format!("type is not a string: {}", other),
                })
            }
            None => {
                return Err(ChannelError::MalformedPayload {
                    reason: "missing type".to_string(),
                })
            }
        };

        let nested = fields
            .get("payload")
            .or_else(|| fields.get("event"))
            .filter(|value| value.is_object())
            .cloned();

        let sender_timestamp = number(&fields, "timestamp")
            .or_else(|| number(&fields, "server_timestamp"))
            .or_else(|| {
                nested
                    .as_ref()
                    .and_then(Value::as_object)
                    .and_then(|payload| number(payload, "timestamp"))
            });

        let (payload, nested) = match nested {
            Some(payload) => (payload, true),
            None => (Value::Object(fields), false),
        };

        Ok(Self {
            kind,
            payload,
            nested,
            sender_timestamp,
        })
    }

    /// Interpret the payload according to the frame type.
    pub fn into_message(self, arrival: f64) -> Result<InboundMessage, ChannelError> {
        let Envelope {
            kind,
            payload,
            nested,
            ..
        } = self;

        match kind.as_str() {
            "midi_event" => MidiEvent::from_payload(&payload, arrival).map(InboundMessage::MidiEvent),
            "system_status" | "status" => Ok(InboundMessage::SystemStatus(payload)),
            "connection_established" => {
                let info = payload.get("server_info").cloned();
                Ok(InboundMessage::ServerInfo(info.unwrap_or(payload)))
            }
            "ping" => field(&payload, "timestamp")
                .map(|timestamp| InboundMessage::Ping { timestamp })
                .ok_or_else(|| ChannelError::MalformedPayload {
                    reason: "ping without timestamp".to_string(),
                }),
            "pong" => {
                // Nested pongs echo under `timestamp`. A flat pong carries the
                // server clock there, so only `client_timestamp` is an echo.
                let echoed = if nested {
                    field(&payload, "timestamp").or_else(|| field(&payload, "client_timestamp"))
                } else {
                    field(&payload, "client_timestamp")
                };
                echoed
                    .map(|timestamp| InboundMessage::Pong {
                        timestamp,
                        client_time: field(&payload, "clientTime"),
                    })
                    .ok_or_else(|| ChannelError::MalformedPayload {
                        reason: "pong without echoed timestamp".to_string(),
                    })
            }
            _ => Ok(InboundMessage::Unknown { kind: kind.clone() }),
        }
    }
}

fn field(payload: &Value, name: &str) -> Option<f64> {
    payload.get(name).and_then(Value::as_f64)
}

fn number(fields: &Map<String, Value>, name: &str) -> Option<f64> {
    fields.get(name).and_then(Value::as_f64)
}

/// Messages the channel sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ping {
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
        #[serde(rename = "clientTime")]
        client_time: f64,
    },
    RequestSystemStatus {
        timestamp: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(text: &str) -> Result<InboundMessage, ChannelError> {
        Envelope::parse(text)?.into_message(1_000.0)
    }

    #[test]
    fn decodes_nested_midi_event() {
        let text = r#"{"type":"midi_event","payload":{"type":"note_on","channel":0,"note":60,"velocity":100,"timestamp":990}}"#;
        let InboundMessage::MidiEvent(event) = decode(text).unwrap() else {
            panic!("expected midi event");
        };
        assert_eq!(event.kind, MidiEventKind::NoteOn);
        assert_eq!(event.note, Some(60));
        assert_eq!(event.velocity, Some(100));
        assert_eq!(event.timestamp, 990.0);
        assert_eq!(event.arrival, 1_000.0);
    }

    #[test]
    fn decodes_source_flat_midi_event() {
        let text = r#"{"type":"midi_event","event":{"type":"note_off","note":64,"velocity":0,"channel":2,"timestamp":5},"server_timestamp":7}"#;
        let envelope = Envelope::parse(text).unwrap();
        assert_eq!(envelope.sender_timestamp, Some(7.0));

        let InboundMessage::MidiEvent(event) = envelope.into_message(10.0).unwrap() else {
            panic!("expected midi event");
        };
        assert_eq!(event.kind, MidiEventKind::NoteOff);
        assert_eq!(event.channel, 2);
    }

    #[test]
    fn sender_timestamp_falls_back_to_payload() {
        let envelope =
            Envelope::parse(r#"{"type":"midi_event","payload":{"timestamp":42}}"#).unwrap();
        assert_eq!(envelope.sender_timestamp, Some(42.0));
        let envelope = Envelope::parse(r#"{"type":"system_status"}"#).unwrap();
        assert_eq!(envelope.sender_timestamp, None);
    }

    #[test]
    fn rejects_invalid_midi_payloads() {
        let cases = [
            json!({"type": "note_on", "note": 60, "velocity": 90, "timestamp": 1}),
            json!({"type": "note_on", "channel": -1, "note": 60, "timestamp": 1}),
            json!({"type": "note_on", "channel": 16, "note": 60, "timestamp": 1}),
            json!({"type": "note_on", "channel": 0, "note": 60, "timestamp": "soon"}),
            json!({"channel": 0, "note": 60, "timestamp": 1}),
            json!({"type": 7, "channel": 0, "note": 60, "timestamp": 1}),
            json!({"type": "note_on", "channel": 0, "timestamp": 1}),
            json!({"type": "note_on", "channel": 0, "note": 60, "velocity": 128, "timestamp": 1}),
        ];
        for payload in cases {
            let err = MidiEvent::from_payload(&payload, 0.0).unwrap_err();
            assert!(
                matches!(err, ChannelError::InvalidMidiEvent { .. }),
                "{payload} should be invalid, got {err:?}"
            );
        }
    }

    #[test]
    fn zero_velocity_note_on_becomes_note_off() {
        let payload = json!({"type": "note_on", "channel": 0, "note": 60, "velocity": 0, "timestamp": 1});
        let event = MidiEvent::from_payload(&payload, 0.0).unwrap();
        assert_eq!(event.kind, MidiEventKind::NoteOff);
    }

    #[test]
    fn missing_velocity_defaults() {
        let payload = json!({"type": "note_on", "channel": 3, "note": 60, "timestamp": 1});
        let event = MidiEvent::from_payload(&payload, 0.0).unwrap();
        assert_eq!(event.velocity, Some(DEFAULT_VELOCITY));
    }

    #[test]
    fn control_change_and_unknown_kinds() {
        let payload =
            json!({"type": "control_change", "channel": 0, "control": 64, "value": 127, "timestamp": 1});
        let event = MidiEvent::from_payload(&payload, 0.0).unwrap();
        assert_eq!(event.kind, MidiEventKind::ControlChange);
        assert_eq!(event.control, Some(64));
        assert_eq!(event.value, Some(127));

        let payload = json!({"type": "aftertouch", "channel": 0, "timestamp": 1});
        let event = MidiEvent::from_payload(&payload, 0.0).unwrap();
        assert_eq!(event.kind, MidiEventKind::Other("aftertouch".into()));
        assert_eq!(event.kind.as_str(), "aftertouch");
    }

    #[test]
    fn ping_and_pong_shapes() {
        assert_eq!(
            decode(r#"{"type":"ping","payload":{"timestamp":12.5}}"#).unwrap(),
            InboundMessage::Ping { timestamp: 12.5 }
        );
        assert_eq!(
            decode(r#"{"type":"pong","payload":{"timestamp":900,"clientTime":950}}"#).unwrap(),
            InboundMessage::Pong {
                timestamp: 900.0,
                client_time: Some(950.0)
            }
        );
        // Source flat pong: its own clock under timestamp, ours under client_timestamp
        assert_eq!(
            decode(r#"{"type":"pong","timestamp":5000,"client_timestamp":900}"#).unwrap(),
            InboundMessage::Pong {
                timestamp: 900.0,
                client_time: None
            }
        );
        assert!(decode(r#"{"type":"ping","payload":{}}"#).is_err());
    }

    #[test]
    fn flat_pong_never_echoes_the_server_clock() {
        for text in [
            r#"{"type":"pong","timestamp":5000,"client_timestamp":null}"#,
            r#"{"type":"pong","timestamp":5000}"#,
        ] {
            assert!(matches!(
                decode(text),
                Err(ChannelError::MalformedPayload { .. })
            ));
        }
    }

    #[test]
    fn status_and_greeting_are_forwarded() {
        let InboundMessage::SystemStatus(status) =
            decode(r#"{"type":"status","connected_clients":2,"uptime":1.5}"#).unwrap()
        else {
            panic!("expected status");
        };
        assert_eq!(status["connected_clients"], 2);

        let InboundMessage::ServerInfo(info) = decode(
            r#"{"type":"connection_established","timestamp":1,"server_info":{"version":"1.0.0"}}"#,
        )
        .unwrap() else {
            panic!("expected server info");
        };
        assert_eq!(info["version"], "1.0.0");
    }

    #[test]
    fn unknown_and_malformed_frames() {
        assert_eq!(
            decode(r#"{"type":"lighting_scene","payload":{}}"#).unwrap(),
            InboundMessage::Unknown {
                kind: "lighting_scene".into()
            }
        );
        for text in ["not json", "[1,2]", r#"{"payload":{}}"#, r#"{"type":3}"#] {
            assert!(matches!(
                Envelope::parse(text),
                Err(ChannelError::MalformedPayload { .. })
            ));
        }
    }

    #[test]
    fn outbound_envelope_shape() {
        let text = serde_json::to_string(&OutboundMessage::Pong {
            timestamp: 1.0,
            client_time: 2.0,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "pong", "payload": {"timestamp": 1.0, "clientTime": 2.0}}));

        let value = serde_json::to_value(OutboundMessage::RequestSystemStatus { timestamp: 3.0 }).unwrap();
        assert_eq!(value["type"], "request_system_status");
    }
}
