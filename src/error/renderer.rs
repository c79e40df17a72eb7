// Renderer surface error types and constants

use crate::error::ErrorCode;
use std::fmt;

/// Renderer error code constants
///
/// Error code range: 3001-3004
pub struct RendererErrorCodes {}

impl RendererErrorCodes {
    /// Surface used before initialize()
    pub const NOT_INITIALIZED: i32 = 3001;

    /// Surface dimensions are unusable
    pub const INVALID_SURFACE: i32 = 3002;

    /// Rendering context is currently lost
    pub const CONTEXT_LOST: i32 = 3003;

    /// Backend failed to (re)initialize
    pub const INITIALIZATION_FAILED: i32 = 3004;
}

/// Renderer surface errors
#[derive(Debug, Clone, PartialEq)]
pub enum RendererError {
    /// Surface used before initialize()
    NotInitialized,

    /// Surface dimensions are unusable
    InvalidSurface { width: u32, height: u32 },

    /// Rendering context is currently lost
    ContextLost,

    /// Backend failed to (re)initialize
    InitializationFailed { reason: String },
}

impl ErrorCode for RendererError {
    fn code(&self) -> i32 {
        match self {
            RendererError::NotInitialized => RendererErrorCodes::NOT_INITIALIZED,
            RendererError::InvalidSurface { .. } => RendererErrorCodes::INVALID_SURFACE,
            RendererError::ContextLost => RendererErrorCodes::CONTEXT_LOST,
            RendererError::InitializationFailed { .. } => {
                RendererErrorCodes::INITIALIZATION_FAILED
            }
        }
    }

    fn message(&self) -> String {
        match self {
            RendererError::NotInitialized => {
                "Renderer not initialized. Call initialize() first.".to_string()
            }
            RendererError::InvalidSurface { width, height } => {
                format!("Invalid surface size {}x{}", width, height)
            }
            RendererError::ContextLost => "Rendering context lost".to_string(),
            RendererError::InitializationFailed { reason } => {
                format!("Renderer initialization failed: {}", reason)
            }
        }
    }
}

impl fmt::Display for RendererError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RendererError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for RendererError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renderer_error_codes() {
        assert_eq!(
            RendererError::NotInitialized.code(),
            RendererErrorCodes::NOT_INITIALIZED
        );
        assert_eq!(
            RendererError::InvalidSurface {
                width: 0,
                height: 10
            }
            .code(),
            RendererErrorCodes::INVALID_SURFACE
        );
        assert_eq!(
            RendererError::ContextLost.code(),
            RendererErrorCodes::CONTEXT_LOST
        );
        assert_eq!(
            RendererError::InitializationFailed {
                reason: "no adapter".into()
            }
            .code(),
            RendererErrorCodes::INITIALIZATION_FAILED
        );
    }

    #[test]
    fn test_renderer_error_messages() {
        let err = RendererError::InvalidSurface {
            width: 0,
            height: 720,
        };
        assert_eq!(err.message(), "Invalid surface size 0x720");
        assert!(format!("{}", err).contains("3002"));
    }
}
