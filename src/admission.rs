// src/admission.rs

//! The admission decision for one I/O at one tier.

use std::fmt;
use std::time::Instant;

use crate::device::state::DeviceState;
use crate::tier::Tier;

/// Outcome of asking whether an I/O at some tier should be delayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// Nothing stricter is active; proceed.
  Disengaged,
  /// A stricter tier is active but no throttleable I/O has been admitted in
  /// the current accounting period, so this one may proceed.
  Engaged { level: Tier, blocking: Tier },
  /// A stricter tier is active and the period's budget is used up; the
  /// caller must wait.
  MustWaitNow { level: Tier, blocking: Tier },
}

impl Decision {
  /// Whether the I/O falls under an active throttle window.
  pub fn is_throttled(&self) -> bool {
    !matches!(self, Decision::Disengaged)
  }

  pub fn must_wait(&self) -> bool {
    matches!(self, Decision::MustWaitNow { .. })
  }

  /// The stricter tier holding the I/O back.
  pub fn blocking(&self) -> Option<Tier> {
    match self {
      Decision::Disengaged => None,
      Decision::Engaged { blocking, .. } | Decision::MustWaitNow { blocking, .. } => Some(*blocking),
    }
  }
}

impl fmt::Display for Decision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Decision::Disengaged => write!(f, "disengaged"),
      Decision::Engaged { level, blocking } => write!(f, "engaged({} behind {})", level, blocking),
      Decision::MustWaitNow { level, blocking } => write!(f, "must-wait({} behind {})", level, blocking),
    }
  }
}

/// Decides whether an I/O at `tier` may proceed on this device at `now`.
/// Pure with respect to `state`.
pub(crate) fn decide(state: &DeviceState, tier: Tier, now: Instant) -> Decision {
  if !tier.is_throttleable() || state.is_bypassed() {
    return Decision::Disengaged;
  }
  match state.blocking_tier(tier, now) {
    None => Decision::Disengaged,
    Some(blocking) if state.io_count == state.io_count_at_period_start => Decision::Engaged { level: tier, blocking },
    Some(blocking) => Decision::MustWaitNow { level: tier, blocking },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{ThrottleConfig, TrackingMode};
  use std::time::Duration;

  fn state() -> DeviceState {
    DeviceState::new(&ThrottleConfig::default(), false)
  }

  #[test]
  fn tier0_and_unmanaged_io_is_never_delayed() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier0, 1, true, false, t0);
    st.record_io(Tier::Tier3, 2, true, false, t0);
    assert_eq!(decide(&st, Tier::Tier0, t0), Decision::Disengaged);
    assert_eq!(decide(&st, Tier::None, t0), Decision::Disengaged);
  }

  #[test]
  fn first_throttleable_io_in_a_period_is_engaged_not_delayed() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier0, 1, true, false, t0);
    let now = t0 + Duration::from_millis(10);
    assert_eq!(
      decide(&st, Tier::Tier3, now),
      Decision::Engaged {
        level: Tier::Tier3,
        blocking: Tier::Tier0
      }
    );

    st.record_io(Tier::Tier3, 2, true, false, now);
    let later = now + Duration::from_millis(1);
    assert_eq!(
      decide(&st, Tier::Tier3, later),
      Decision::MustWaitNow {
        level: Tier::Tier3,
        blocking: Tier::Tier0
      }
    );
  }

  #[test]
  fn window_expiry_disengages() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier1, 1, true, false, t0);
    st.record_io(Tier::Tier2, 2, true, false, t0);
    // Tier2's window is 100ms; 100ms later the Tier1 activity no longer counts.
    assert!(decide(&st, Tier::Tier2, t0 + Duration::from_millis(99)).must_wait());
    assert_eq!(decide(&st, Tier::Tier2, t0 + Duration::from_millis(100)), Decision::Disengaged);
  }

  #[test]
  fn lowest_blocking_tier_is_reported() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier2, 1, true, false, t0);
    st.record_io(Tier::Tier0, 1, true, false, t0);
    assert_eq!(decide(&st, Tier::Tier3, t0).blocking(), Some(Tier::Tier0));
  }

  #[test]
  fn inflight_io_blocks_regardless_of_window() {
    let mut st = state();
    st.tracking = TrackingMode::InFlight;
    let t0 = Instant::now();
    st.record_io(Tier::Tier1, 1, true, false, t0);
    let decision = decide(&st, Tier::Tier2, t0 + Duration::from_secs(60));
    assert_eq!(decision.blocking(), Some(Tier::Tier1));
  }

  #[test]
  fn disabled_device_never_throttles() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier0, 1, true, false, t0);
    st.disabled = true;
    assert_eq!(decide(&st, Tier::Tier3, t0), Decision::Disengaged);
  }
}
