// Error types for the keyglow visualizer
//
// This module defines custom error types for the connection channel, the
// renderer surface and the initialization sequence, providing structured
// error handling with stable numeric codes for status reporting.

mod channel;
mod init;
mod renderer;

pub use channel::{log_channel_error, ChannelError, ChannelErrorCodes};
pub use init::{log_init_error, InitError, InitErrorCodes, InitStage};
pub use renderer::{RendererError, RendererErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, so status surfaces (CLI, debug HTTP, application
/// listeners) report failures consistently.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
