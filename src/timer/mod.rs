// src/timer/mod.rs

//! The per-device window timer.
//!
//! While a device has waiters, a one-shot timer is kept armed for the
//! earliest period end among the tiers still throttled. When it fires it
//! closes the accounting period, wakes at most one waiter per period in a
//! `Tier3 -> Tier2 -> Tier1` rotation, and releases every tier whose
//! throttle has lifted.

mod service;

pub(crate) use service::{ScheduledTimer, TimerHandle, TimerService};

use std::sync::Arc;
use std::time::Instant;

use crate::device::state::{has_elapsed, DeviceState};
use crate::device::{DeviceShared, ThrottleHandle};
use crate::tier::{Tier, TierMask};
use crate::waitq;

/// Externally visible timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
  Idle,
  Armed,
  /// The callback holds the device and is deciding what to do next.
  Firing,
}

#[derive(Debug)]
pub(crate) enum TimerSlot {
  Idle,
  Armed(ScheduledTimer),
  Firing,
}

impl TimerSlot {
  pub(crate) fn phase(&self) -> TimerPhase {
    match self {
      TimerSlot::Idle => TimerPhase::Idle,
      TimerSlot::Armed(_) => TimerPhase::Armed,
      TimerSlot::Firing => TimerPhase::Firing,
    }
  }
}

/// What the timer should do next for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerPlan {
  /// When to fire, or `None` if no tier still needs the timer.
  pub(crate) deadline: Option<Instant>,
  /// Tiers with waiters that are no longer throttled.
  pub(crate) clear: TierMask,
}

/// Computes the next deadline and the tiers that can be released now.
///
/// The deadline is never earlier than `min_timer_deadline` nor the end of
/// the current `Tier1` period, so a period that cannot close yet never
/// spins the timer.
pub(crate) fn plan_timer(state: &DeviceState, now: Instant) -> TimerPlan {
  let mut clear = TierMask::empty();
  let mut earliest: Option<Instant> = None;

  for tier in Tier::THROTTLEABLE {
    let ts = state.tier(tier);
    if ts.waiters.is_empty() {
      continue;
    }
    if state.is_bypassed() || state.blocking_tier(tier, now).is_none() {
      clear |= TierMask::of(tier);
      continue;
    }
    let period_end = ts.period_start.unwrap_or(now) + state.period(tier);
    earliest = Some(earliest.map_or(period_end, |e| e.min(period_end)));
  }

  let deadline = earliest.map(|mut deadline| {
    if let Some(floor) = state.min_timer_deadline {
      deadline = deadline.max(floor);
    }
    if let Some(start) = state.tier(Tier::LOWEST_THROTTLED).period_start {
      deadline = deadline.max(start + state.period(Tier::LOWEST_THROTTLED));
    }
    deadline
  });

  TimerPlan { deadline, clear }
}

/// Closes the accounting period if the `Tier1` period has elapsed, waking at
/// most one waiter. Returns the tier woken, if any.
///
/// Every rollover restarts all tier periods together, so the wake goes to
/// the first non-empty list in rotation. A longer per-tier period only
/// paces the timer while that tier waits alone.
pub(crate) fn close_window(state: &mut DeviceState, now: Instant) -> Option<Tier> {
  let first = Tier::LOWEST_THROTTLED;
  if !has_elapsed(state.tier(first).period_start, now, state.period(first)) {
    return None;
  }

  let mut woken = None;
  let mut tier = state.next_wake_tier;
  for _ in 0..Tier::THROTTLEABLE.len() {
    if !state.tier(tier).waiters.is_empty() {
      waitq::wake_one(state, tier);
      state.next_wake_tier = tier.next_in_rotation();
      woken = Some(tier);
      break;
    }
    tier = tier.next_in_rotation();
  }

  state.start_period(now);
  woken
}

/// Releases cleared tiers, then arms, keeps, or disarms the timer so it
/// matches the current plan. Caller holds the device lock.
pub(crate) fn ensure_armed(device: &Arc<DeviceShared>, state: &mut DeviceState, now: Instant) -> TimerPlan {
  let plan = plan_timer(state, now);
  for tier in plan.clear.tiers() {
    let released = waitq::drain(state, tier);
    if released > 0 {
      tracing::trace!(device = %device.key, %tier, released, "Throttle lifted, released waiters");
    }
  }
  match plan.deadline {
    Some(deadline) if !state.shut_down => arm(device, state, deadline),
    _ => disarm(state),
  }
  plan
}

fn arm(device: &Arc<DeviceShared>, state: &mut DeviceState, deadline: Instant) {
  match &state.timer {
    // An earlier fire re-plans anyway.
    TimerSlot::Armed(scheduled) if scheduled.deadline() <= deadline => return,
    TimerSlot::Armed(scheduled) => {
      if !scheduled.cancel() {
        // Already firing; it will re-plan once it gets the lock.
        return;
      }
    }
    TimerSlot::Idle | TimerSlot::Firing => {}
  }

  state.timer_generation += 1;
  let generation = state.timer_generation;
  let target = Arc::clone(device);
  let scheduled = device
    .timer
    .schedule(deadline, generation, move || fire(&target, generation));
  state.timer = TimerSlot::Armed(scheduled);
  if state.timer_ref.is_none() {
    state.timer_ref = Some(ThrottleHandle::retain(device));
  }
  tracing::trace!(device = %device.key, generation, "Window timer armed");
}

fn disarm(state: &mut DeviceState) {
  match std::mem::replace(&mut state.timer, TimerSlot::Idle) {
    TimerSlot::Armed(scheduled) => {
      if !scheduled.cancel() {
        // The fire in progress owns the reference now and will disarm.
        state.timer = TimerSlot::Armed(scheduled);
        return;
      }
    }
    TimerSlot::Idle | TimerSlot::Firing => {}
  }
  // Dropping may reap a dynamic entry; the registry lock nests inside ours.
  state.timer_ref = None;
}

/// Timer callback.
pub(crate) fn fire(device: &Arc<DeviceShared>, generation: u64) {
  let mut state = device.state.lock();
  if state.shut_down {
    return;
  }
  match &state.timer {
    TimerSlot::Armed(scheduled) if scheduled.generation() == generation => {}
    other => panic!(
      "window timer for {} fired in phase {:?} (generation {}, current {})",
      device.key,
      other.phase(),
      generation,
      state.timer_generation
    ),
  }
  state.timer = TimerSlot::Firing;

  let now = Instant::now();
  let woken = close_window(&mut state, now);
  let plan = ensure_armed(device, &mut state, now);
  tracing::trace!(
    device = %device.key,
    woken = ?woken,
    rearmed = plan.deadline.is_some(),
    period = state.period_number,
    "Window timer fired"
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::caller::CallerShared;
  use crate::config::ThrottleConfig;
  use std::time::Duration;

  fn state() -> DeviceState {
    DeviceState::new(&ThrottleConfig::default(), false)
  }

  fn park(state: &mut DeviceState, id: u64, tier: Tier) -> Arc<CallerShared> {
    let caller = Arc::new(CallerShared::new(id, Default::default()));
    caller.lock_wait().on_list = Some(tier);
    state.tier_mut(tier).waiters.push_back(Arc::clone(&caller));
    caller
  }

  #[test]
  fn no_waiters_means_no_deadline() {
    let st = state();
    let plan = plan_timer(&st, Instant::now());
    assert_eq!(plan.deadline, None);
    assert!(plan.clear.is_empty());
  }

  #[test]
  fn unthrottled_tier_is_cleared_immediately() {
    let mut st = state();
    park(&mut st, 1, Tier::Tier2);
    let plan = plan_timer(&st, Instant::now());
    assert_eq!(plan.deadline, None);
    assert_eq!(plan.clear, TierMask::TIER2);
  }

  #[test]
  fn deadline_is_the_earliest_period_end_but_not_before_tier1() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier0, 9, true, false, t0);
    park(&mut st, 1, Tier::Tier3);
    park(&mut st, 2, Tier::Tier2);
    for tier in Tier::THROTTLEABLE {
      st.tier_mut(tier).period_start = Some(t0);
    }
    let plan = plan_timer(&st, t0);
    // Tier2 ends at 85ms, Tier3 at 200ms; Tier1 (40ms) only acts as a floor.
    assert_eq!(plan.deadline, Some(t0 + Duration::from_millis(85)));

    st.min_timer_deadline = Some(t0 + Duration::from_millis(120));
    let plan = plan_timer(&st, t0);
    assert_eq!(plan.deadline, Some(t0 + Duration::from_millis(120)));
  }

  #[test]
  fn close_window_rotates_and_resets_the_period() {
    let mut st = state();
    let t0 = Instant::now();
    let c3 = park(&mut st, 3, Tier::Tier3);
    let c2 = park(&mut st, 2, Tier::Tier2);
    let c1 = park(&mut st, 1, Tier::Tier1);

    // Nothing elapsed yet: no wake, no rollover.
    for tier in Tier::THROTTLEABLE {
      st.tier_mut(tier).period_start = Some(t0);
    }
    assert_eq!(close_window(&mut st, t0 + Duration::from_millis(10)), None);
    assert_eq!(st.period_number, 0);

    let t1 = t0 + Duration::from_millis(250);
    assert_eq!(close_window(&mut st, t1), Some(Tier::Tier3));
    assert_eq!(c3.lock_wait().on_list, None);
    assert_eq!(st.period_number, 1);
    assert_eq!(st.next_wake_tier, Tier::Tier2);
    assert_eq!(st.tier(Tier::Tier2).period_start, Some(t1));
    assert_eq!(st.min_timer_deadline, Some(t1 + Duration::from_millis(1)));

    let t2 = t1 + Duration::from_millis(90);
    assert_eq!(close_window(&mut st, t2), Some(Tier::Tier2));
    assert_eq!(c2.lock_wait().on_list, None);

    let t3 = t2 + Duration::from_millis(45);
    assert_eq!(close_window(&mut st, t3), Some(Tier::Tier1));
    assert_eq!(c1.lock_wait().on_list, None);
    assert_eq!(st.next_wake_tier, Tier::Tier3);
  }

  #[test]
  fn busy_tier1_list_cannot_starve_a_lone_tier2_waiter() {
    let mut st = state();
    let t0 = Instant::now();
    let period = st.period(Tier::Tier1);
    for id in 10..13 {
      park(&mut st, id, Tier::Tier1);
    }
    let lone = park(&mut st, 2, Tier::Tier2);
    st.next_wake_tier = Tier::Tier1;

    let mut now = t0;
    let mut firings = 0;
    while lone.lock_wait().on_list.is_some() {
      assert!(firings < Tier::THROTTLEABLE.len(), "tier2 waiter still listed after {} firings", firings);
      now += period;
      if close_window(&mut st, now) == Some(Tier::Tier1) {
        // Tier1 traffic never lets up.
        park(&mut st, 100 + firings as u64, Tier::Tier1);
      }
      firings += 1;
    }
    assert!(!st.tier(Tier::Tier1).waiters.is_empty());
  }

  #[test]
  fn period_starts_never_move_backwards_on_fire() {
    let mut st = state();
    let t0 = Instant::now();
    park(&mut st, 1, Tier::Tier3);
    st.tier_mut(Tier::Tier1).period_start = Some(t0);
    st.tier_mut(Tier::Tier2).period_start = None;
    st.tier_mut(Tier::Tier3).period_start = Some(t0 + Duration::from_millis(30));

    // One fire too early to close the period, one well after.
    for now in [t0 + Duration::from_millis(5), t0 + Duration::from_millis(400)] {
      let before: Vec<_> = Tier::TRACKED.into_iter().map(|t| st.tier(t).period_start).collect();
      close_window(&mut st, now);
      for (tier, before) in Tier::TRACKED.into_iter().zip(before) {
        assert!(st.tier(tier).period_start >= before, "{} period start moved backwards", tier);
      }
    }
    assert_eq!(st.period_number, 1);
  }

  #[test]
  fn rollover_snapshots_the_io_count() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier2, 1, true, false, t0);
    st.record_io(Tier::Tier3, 1, true, false, t0);
    assert_ne!(st.io_count, st.io_count_at_period_start);
    close_window(&mut st, t0);
    assert_eq!(st.io_count, st.io_count_at_period_start);
  }
}
