// Connection channel error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Connection channel error code constants
///
/// Error code range: 2001-2006
pub struct ChannelErrorCodes {}

impl ChannelErrorCodes {
    /// Endpoint URL is not a usable WebSocket address
    pub const INVALID_ENDPOINT: i32 = 2001;

    /// Operation requires an open connection
    pub const NOT_CONNECTED: i32 = 2002;

    /// Inbound payload could not be decoded
    pub const MALFORMED_PAYLOAD: i32 = 2003;

    /// MIDI event failed schema validation
    pub const INVALID_MIDI_EVENT: i32 = 2004;

    /// Low-level transport reported a failure
    pub const TRANSPORT_FAILURE: i32 = 2005;

    /// All reconnect attempts were used up
    pub const RECONNECT_EXHAUSTED: i32 = 2006;
}

/// Log a channel error with structured context
///
/// Channel errors are observational: they are logged and published to
/// subscribers but never abort the caller.
pub fn log_channel_error(err: &ChannelError, context: &str) {
    error!(
        "Channel error in {}: code={}, component=ConnectionChannel, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Connection channel errors
///
/// Error code range: 2001-2006
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Endpoint URL is not a usable WebSocket address
    InvalidEndpoint { url: String, reason: String },

    /// Operation requires an open connection
    NotConnected,

    /// Inbound payload could not be decoded
    MalformedPayload { reason: String },

    /// MIDI event failed schema validation
    InvalidMidiEvent { reason: String },

    /// Low-level transport reported a failure
    TransportFailure { reason: String },

    /// All reconnect attempts were used up
    ReconnectExhausted { attempts: u32 },
}

impl ErrorCode for ChannelError {
    fn code(&self) -> i32 {
        match self {
            ChannelError::InvalidEndpoint { .. } => ChannelErrorCodes::INVALID_ENDPOINT,
            ChannelError::NotConnected => ChannelErrorCodes::NOT_CONNECTED,
            ChannelError::MalformedPayload { .. } => ChannelErrorCodes::MALFORMED_PAYLOAD,
            ChannelError::InvalidMidiEvent { .. } => ChannelErrorCodes::INVALID_MIDI_EVENT,
            ChannelError::TransportFailure { .. } => ChannelErrorCodes::TRANSPORT_FAILURE,
            ChannelError::ReconnectExhausted { .. } => ChannelErrorCodes::RECONNECT_EXHAUSTED,
        }
    }

    fn message(&self) -> String {
        match self {
            ChannelError::InvalidEndpoint { url, reason } => {
                format!("Invalid endpoint {}: {}", url, reason)
            }
            ChannelError::NotConnected => "Channel is not connected".to_string(),
            ChannelError::MalformedPayload { reason } => {
                format!("Malformed payload: {}", reason)
            }
            ChannelError::InvalidMidiEvent { reason } => {
                format!("Invalid MIDI event: {}", reason)
            }
            ChannelError::TransportFailure { reason } => {
                format!("Transport failure: {}", reason)
            }
            ChannelError::ReconnectExhausted { attempts } => {
                format!("Gave up after {} reconnect attempts", attempts)
            }
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ChannelError {}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::MalformedPayload {
            reason: err.to_string(),
        }
    }
}
