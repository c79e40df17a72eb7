// Initialization error types and constants

use crate::error::ErrorCode;
use log::error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Initialization error code constants, one per stage
///
/// Error code range: 4001-4005
pub struct InitErrorCodes {}

impl InitErrorCodes {
    pub const RENDERER: i32 = 4001;
    pub const CONNECTION: i32 = 4002;
    pub const HOST_EVENTS: i32 = 4003;
    pub const TELEMETRY: i32 = 4004;
    pub const ANIMATION_LOOP: i32 = 4005;
}

/// Stages of the visualizer initialization sequence, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStage {
    Renderer,
    Connection,
    HostEvents,
    Telemetry,
    AnimationLoop,
}

impl InitStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitStage::Renderer => "renderer",
            InitStage::Connection => "connection",
            InitStage::HostEvents => "host_events",
            InitStage::Telemetry => "telemetry",
            InitStage::AnimationLoop => "animation_loop",
        }
    }
}

/// Log an initialization error with structured context
pub fn log_init_error(err: &InitError) {
    error!(
        "Initialization failed: code={}, component=Visualizer, stage={}, message={}",
        err.code(),
        err.stage.as_str(),
        err.message()
    );
}

/// Single structured error surfaced when a stage of the init sequence fails
#[derive(Debug, Clone, PartialEq)]
pub struct InitError {
    pub stage: InitStage,
    pub reason: String,
}

impl InitError {
    pub fn new(stage: InitStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

impl ErrorCode for InitError {
    fn code(&self) -> i32 {
        match self.stage {
            InitStage::Renderer => InitErrorCodes::RENDERER,
            InitStage::Connection => InitErrorCodes::CONNECTION,
            InitStage::HostEvents => InitErrorCodes::HOST_EVENTS,
            InitStage::Telemetry => InitErrorCodes::TELEMETRY,
            InitStage::AnimationLoop => InitErrorCodes::ANIMATION_LOOP,
        }
    }

    fn message(&self) -> String {
        format!(
            "Initialization failed at stage '{}': {}",
            self.stage.as_str(),
            self.reason
        )
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InitError (code {}): {}", self.code(), self.message())
    }
}

impl std::error::Error for InitError {}
