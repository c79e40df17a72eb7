//! Transport seam between the connection channel and the socket.
//!
//! The channel never performs I/O itself: it asks a [`Transport`] to open,
//! send and close, and learns about the outcome through [`TransportEvent`]s
//! that its owner feeds back in. This keeps the reconnect state machine
//! deterministic under test.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::ChannelError;

/// Outcome of socket activity, reported back to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Socket operations the channel relies on.
///
/// `open` only starts a connection attempt; success or failure arrives later
/// as [`TransportEvent::Opened`] / [`TransportEvent::Closed`]. An `Err` from
/// `open` means the attempt could not even be started.
pub trait Transport {
    fn open(&mut self, url: &str) -> Result<(), ChannelError>;
    fn send(&mut self, text: &str) -> Result<(), ChannelError>;
    fn close(&mut self, code: u16, reason: &str);
}

/// Everything a [`RecordingTransport`] was asked to do.
#[derive(Debug, Default)]
pub struct TransportLog {
    pub opened: Vec<String>,
    pub sent: Vec<String>,
    pub closed: Vec<(u16, String)>,
    pub fail_open: bool,
    /// Number of further sends that succeed before sends start failing.
    pub sends_before_failure: Option<usize>,
}

/// In-memory transport used by tests and offline tooling.
///
/// Clones share one [`TransportLog`], so a test keeps a handle while the
/// channel owns the transport.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Rc<RefCell<TransportLog>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<String> {
        self.log.borrow().opened.clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.log.borrow().sent.clone()
    }

    /// Sent frames decoded as JSON, skipping anything unparsable.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.log
            .borrow()
            .sent
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub fn closed(&self) -> Vec<(u16, String)> {
        self.log.borrow().closed.clone()
    }

    pub fn clear_sent(&self) {
        self.log.borrow_mut().sent.clear();
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.log.borrow_mut().fail_open = fail;
    }

    /// Let `count` more sends succeed, then fail every send after that.
    pub fn fail_sends_after(&self, count: usize) {
        self.log.borrow_mut().sends_before_failure = Some(count);
    }

    pub fn heal_sends(&self) {
        self.log.borrow_mut().sends_before_failure = None;
    }
}

impl Transport for RecordingTransport {
    fn open(&mut self, url: &str) -> Result<(), ChannelError> {
        let mut log = self.log.borrow_mut();
        log.opened.push(url.to_string());
        if log.fail_open {
            return Err(ChannelError::TransportFailure {
                reason: format!("refused to open {}", url),
            });
        }
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        let mut log = self.log.borrow_mut();
        match log.sends_before_failure {
            Some(0) => {
                return Err(ChannelError::TransportFailure {
                    reason: "send rejected".to_string(),
                })
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        log.sent.push(text.to_string());
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.log.borrow_mut().closed.push((code, reason.to_string()));
    }
}
