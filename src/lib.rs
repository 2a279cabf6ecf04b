//! iothrottle - tiered I/O admission control.
//!
//! Callers declare an [`IoPolicy`]; each I/O is classified into a [`Tier`]
//! and admitted, delayed, or slept until stricter tiers have been quiet on
//! the device for long enough. See [`Throttler`] for the entry points.

pub mod admission;
pub mod caller;
pub mod config;
pub mod device;
pub mod error;
pub mod rethrottle;
pub mod throttler;
pub mod tier;
mod timer;
mod waitq;

pub use admission::Decision;
pub use caller::Caller;
pub use config::{ThrottleConfig, TierDurations, TrackingMode};
pub use device::{DeviceIdentity, DeviceKey, DeviceRegistry, DeviceSnapshot, ThrottleHandle, TierSnapshot};
pub use error::ThrottleError;
pub use rethrottle::RethrottleOutcome;
pub use throttler::{Admission, IoFlags, IoRequest, Throttler};
pub use tier::{classify, IoPolicy, Tier, TierMask};
pub use timer::TimerPhase;

// --- Top-Level Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

/// Creates a throttler with default tunables.
pub fn throttler() -> Result<Throttler, ThrottleError> {
  Throttler::new(ThrottleConfig::default())
}
