// src/rethrottle.rs

//! Re-evaluating a caller after its policy changed.
//!
//! A sleeping caller whose tier changed is pulled off its list and woken so
//! it can re-decide at its new tier; it re-joins at the head of whatever list
//! it lands on. A caller that is not sleeping only gets a flag it consumes
//! on its next wait.

use std::sync::Arc;

use crate::caller::CallerShared;
use crate::tier::Tier;
use crate::waitq;

/// What [`rethrottle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RethrottleOutcome {
  /// The caller was not sleeping; it will notice on its next wait.
  Flagged,
  /// The caller was asleep on a different tier and has been woken.
  Woken { from: Tier, to: Tier },
  /// The caller is asleep on the tier it would be assigned anyway.
  Unchanged,
}

/// Rethrottles `caller`, whose tier would now be `new_tier`.
pub(crate) fn rethrottle(caller: &Arc<CallerShared>, new_tier: Tier) -> RethrottleOutcome {
  loop {
    let Some(handle) = caller.window_device() else {
      caller.lock_wait().was_rethrottled = true;
      return RethrottleOutcome::Flagged;
    };

    let mut state = handle.device().state.lock();
    // The caller may have moved to another device since we read its window.
    if !caller.holds_window_on(&handle) {
      continue;
    }

    let mut wait = caller.lock_wait();
    if !wait.is_blocked {
      wait.was_rethrottled = true;
      return RethrottleOutcome::Flagged;
    }
    let from = match wait.on_list {
      Some(listed) if listed != new_tier => listed,
      _ => return RethrottleOutcome::Unchanged,
    };

    waitq::dequeue(&mut state, caller, &mut wait);
    wait.was_rethrottled = true;
    caller.signal_removed(&mut wait);
    tracing::debug!(caller = caller.id, device = %handle.key(), %from, to = %new_tier, "Rethrottled sleeping caller");
    return RethrottleOutcome::Woken { from, to: new_tier };
  }
}
