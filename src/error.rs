use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum ThrottleError {
  #[error("Invalid argument provided: {0}")]
  InvalidArgument(String),

  // --- Configuration Errors ---
  #[error("Invalid throttle configuration: {0}")]
  InvalidConfig(String),
  #[error("Invalid throttle option ID: {0}")]
  InvalidOption(i32),
  #[error("Invalid value provided for option ID {0}")]
  InvalidOptionValue(i32),

  // --- Resource Limits ---
  /// No throttle state could be allocated for the identity. Callers treat the
  /// device as unthrottled.
  #[error("Throttle state unavailable for {0}: dynamic table exhausted")]
  Exhausted(String),

  // --- Runtime ---
  #[error("Timer service failed to start: {0}")]
  TimerService(#[from] io::Error),
  #[error("Throttler has been shut down")]
  ShutDown,
}
