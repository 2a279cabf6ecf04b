// src/device/state.rs

//! The lock-protected half of a device's throttle state.
//!
//! Every field here is mutated only while holding `DeviceShared::state`.
//! Timestamps are `Option<Instant>` where `None` means "never", which always
//! counts as elapsed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caller::CallerShared;
use crate::config::{ThrottleConfig, TierDurations, TrackingMode};
use crate::device::ThrottleHandle;
use crate::tier::{Tier, TIER_SLOTS};
use crate::timer::TimerSlot;

/// Bookkeeping for one tracked tier.
#[derive(Debug, Default)]
pub(crate) struct TierState {
  /// Start of the protection window opened by activity at this tier.
  pub(crate) window_start: Option<Instant>,
  /// Start of this tier's current accounting period.
  pub(crate) period_start: Option<Instant>,
  pub(crate) last_io: Option<Instant>,
  pub(crate) last_issuer: Option<u64>,
  pub(crate) inflight: u32,
  pub(crate) waiters: VecDeque<Arc<CallerShared>>,
  pub(crate) reads: u64,
  pub(crate) writes: u64,
  /// How many times activity at this tier made another caller wait.
  pub(crate) waits_caused: u64,
  /// Waiters released from this tier's list.
  pub(crate) wakes: u64,
}

/// Window and period tables for both device classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimingTables {
  windows: TierDurations,
  windows_ssd: TierDurations,
  periods: TierDurations,
  periods_ssd: TierDurations,
  pub(crate) min_timer_interval: Duration,
}

impl TimingTables {
  pub(crate) fn from_config(config: &ThrottleConfig) -> Self {
    Self {
      windows: config.windows,
      windows_ssd: config.windows_ssd,
      periods: config.io_periods,
      periods_ssd: config.io_periods_ssd,
      min_timer_interval: config.min_timer_interval,
    }
  }
}

#[derive(Debug)]
pub(crate) struct DeviceState {
  pub(crate) tiers: [TierState; TIER_SLOTS],
  /// Throttleable I/Os admitted so far.
  pub(crate) io_count: u64,
  /// `io_count` when the current accounting period began.
  pub(crate) io_count_at_period_start: u64,
  pub(crate) period_number: u64,
  pub(crate) is_ssd: bool,
  pub(crate) tables: TimingTables,
  /// No timer may be scheduled before this instant.
  pub(crate) min_timer_deadline: Option<Instant>,
  pub(crate) timer: TimerSlot,
  /// Reference the armed timer holds on its own device.
  pub(crate) timer_ref: Option<ThrottleHandle>,
  pub(crate) timer_generation: u64,
  pub(crate) disabled: bool,
  pub(crate) shut_down: bool,
  pub(crate) next_wake_tier: Tier,
  pub(crate) tracking: TrackingMode,
}

/// True when at least `span` has passed since `start`.
pub(crate) fn has_elapsed(start: Option<Instant>, now: Instant, span: Duration) -> bool {
  match start {
    None => true,
    Some(start) => now.saturating_duration_since(start) >= span,
  }
}

fn slot_of(tier: Tier) -> usize {
  match tier.slot() {
    Some(slot) => slot,
    None => panic!("Tier::None carries no per-device throttle state"),
  }
}

impl DeviceState {
  pub(crate) fn new(config: &ThrottleConfig, is_ssd: bool) -> Self {
    Self {
      tiers: Default::default(),
      io_count: 0,
      io_count_at_period_start: 0,
      period_number: 0,
      is_ssd,
      tables: TimingTables::from_config(config),
      min_timer_deadline: None,
      timer: TimerSlot::Idle,
      timer_ref: None,
      timer_generation: 0,
      disabled: false,
      shut_down: false,
      next_wake_tier: Tier::HIGHEST,
      tracking: config.tracking,
    }
  }

  pub(crate) fn tier(&self, tier: Tier) -> &TierState {
    &self.tiers[slot_of(tier)]
  }

  pub(crate) fn tier_mut(&mut self, tier: Tier) -> &mut TierState {
    &mut self.tiers[slot_of(tier)]
  }

  /// Throttle window protecting stricter tiers from `tier`.
  pub(crate) fn window(&self, tier: Tier) -> Duration {
    if self.is_ssd {
      self.tables.windows_ssd.get(tier)
    } else {
      self.tables.windows.get(tier)
    }
  }

  /// Accounting period a waiter at `tier` sits out.
  pub(crate) fn period(&self, tier: Tier) -> Duration {
    if self.is_ssd {
      self.tables.periods_ssd.get(tier)
    } else {
      self.tables.periods.get(tier)
    }
  }

  pub(crate) fn apply_tables(&mut self, tables: TimingTables) {
    self.tables = tables;
  }

  /// Whether throttling is suppressed for this device.
  pub(crate) fn is_bypassed(&self) -> bool {
    self.disabled || self.shut_down
  }

  /// The stricter tier currently holding `tier` back, if any.
  ///
  /// Scans stricter tiers in ascending order. An inflight I/O always blocks;
  /// otherwise a tier blocks while its last activity is younger than the
  /// window of the tier asking.
  pub(crate) fn blocking_tier(&self, tier: Tier, now: Instant) -> Option<Tier> {
    if !tier.is_throttleable() {
      return None;
    }
    let window = self.window(tier);
    Tier::TRACKED.into_iter().take_while(|t| *t < tier).find(|t| {
      let state = self.tier(*t);
      state.inflight > 0 || !has_elapsed(state.window_start, now, window)
    })
  }

  /// Records an admitted I/O. Returns true if an inflight count was taken,
  /// in which case a matching [`DeviceState::complete_io`] is owed.
  pub(crate) fn record_io(&mut self, tier: Tier, issuer: u64, is_read: bool, passive: bool, now: Instant) -> bool {
    if tier.slot().is_none() {
      return false;
    }
    let tracking = self.tracking;
    let state = self.tier_mut(tier);
    if is_read {
      state.reads += 1;
    } else {
      state.writes += 1;
    }
    state.last_io = Some(now);
    state.last_issuer = Some(issuer);

    let mut took_inflight = false;
    if !passive {
      match tracking {
        TrackingMode::AtIssue => state.window_start = Some(now),
        TrackingMode::InFlight => {
          state.inflight += 1;
          took_inflight = true;
        }
      }
    }
    if tier.is_throttleable() {
      self.io_count += 1;
    }
    took_inflight
  }

  /// Completes an inflight I/O and opens the tier's window at completion.
  ///
  /// A no-op for devices tracked at issue. Completing more I/Os than were
  /// issued is an invariant violation.
  pub(crate) fn complete_io(&mut self, tier: Tier, now: Instant) {
    if tier.slot().is_none() || self.tracking != TrackingMode::InFlight {
      return;
    }
    let state = self.tier_mut(tier);
    state.inflight = match state.inflight.checked_sub(1) {
      Some(remaining) => remaining,
      None => panic!("inflight count for {} would go negative", tier),
    };
    state.window_start = Some(now);
  }

  /// Whether dropping this state would lose nothing another submit could
  /// observe: no waiters, no armed timer, and no window still holding any
  /// throttleable tier back.
  pub(crate) fn is_quiescent(&self, now: Instant) -> bool {
    if self.shut_down {
      return true;
    }
    if !matches!(self.timer, TimerSlot::Idle) {
      return false;
    }
    if self.disabled {
      return true;
    }
    Tier::THROTTLEABLE
      .into_iter()
      .all(|tier| self.tier(tier).waiters.is_empty() && self.blocking_tier(tier, now).is_none())
  }

  pub(crate) fn has_inflight(&self) -> bool {
    self.tiers.iter().any(|t| t.inflight > 0)
  }

  /// Closes the current accounting period at `now`.
  pub(crate) fn start_period(&mut self, now: Instant) {
    self.io_count_at_period_start = self.io_count;
    self.period_number += 1;
    for tier in Tier::THROTTLEABLE {
      self.tier_mut(tier).period_start = Some(now);
    }
    self.min_timer_deadline = Some(now + self.tables.min_timer_interval);
    tracing::trace!(period = self.period_number, io_count = self.io_count, "Throttle accounting period rolled over");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn state() -> DeviceState {
    DeviceState::new(&ThrottleConfig::default(), false)
  }

  #[test]
  fn fresh_device_blocks_nothing() {
    let st = state();
    let now = Instant::now();
    for tier in Tier::TRACKED {
      assert_eq!(st.blocking_tier(tier, now), None);
    }
  }

  #[test]
  fn recent_activity_blocks_only_less_urgent_tiers() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier1, 7, true, false, t0);

    let now = t0 + Duration::from_millis(10);
    assert_eq!(st.blocking_tier(Tier::Tier1, now), None);
    assert_eq!(st.blocking_tier(Tier::Tier2, now), Some(Tier::Tier1));
    assert_eq!(st.blocking_tier(Tier::Tier3, now), Some(Tier::Tier1));

    // Tier2's window (100ms) has passed; Tier3's (500ms) has not.
    let later = t0 + Duration::from_millis(150);
    assert_eq!(st.blocking_tier(Tier::Tier2, later), None);
    assert_eq!(st.blocking_tier(Tier::Tier3, later), Some(Tier::Tier1));
  }

  #[test]
  fn passive_io_opens_no_window() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier0, 1, false, true, t0);
    assert_eq!(st.blocking_tier(Tier::Tier3, t0), None);
    assert_eq!(st.tier(Tier::Tier0).writes, 1);
    assert_eq!(st.tier(Tier::Tier0).last_issuer, Some(1));
  }

  #[test]
  fn only_throttleable_io_is_counted() {
    let mut st = state();
    let t0 = Instant::now();
    st.record_io(Tier::Tier0, 1, true, false, t0);
    st.record_io(Tier::None, 1, true, false, t0);
    assert_eq!(st.io_count, 0);
    st.record_io(Tier::Tier2, 1, true, false, t0);
    assert_eq!(st.io_count, 1);
  }

  #[test]
  fn inflight_tracking_blocks_until_completion() {
    let mut st = state();
    st.tracking = TrackingMode::InFlight;
    let t0 = Instant::now();
    assert!(st.record_io(Tier::Tier0, 1, true, false, t0));

    let much_later = t0 + Duration::from_secs(5);
    assert_eq!(st.blocking_tier(Tier::Tier2, much_later), Some(Tier::Tier0));

    st.complete_io(Tier::Tier0, much_later);
    assert_eq!(st.tier(Tier::Tier0).inflight, 0);
    // The window reopens at completion time.
    assert_eq!(st.blocking_tier(Tier::Tier2, much_later + Duration::from_millis(1)), Some(Tier::Tier0));
    assert_eq!(st.blocking_tier(Tier::Tier2, much_later + Duration::from_millis(101)), None);
  }

  #[test]
  #[should_panic(expected = "would go negative")]
  fn completing_more_than_issued_panics() {
    let mut st = state();
    st.tracking = TrackingMode::InFlight;
    st.complete_io(Tier::Tier1, Instant::now());
  }

  #[test]
  fn completion_is_ignored_when_tracked_at_issue() {
    let mut st = state();
    st.complete_io(Tier::Tier1, Instant::now());
    assert_eq!(st.tier(Tier::Tier1).inflight, 0);
  }

  #[test]
  fn state_stays_live_while_a_window_protects_a_stricter_tier() {
    let mut st = state();
    let t0 = Instant::now();
    assert!(st.is_quiescent(t0));

    st.record_io(Tier::Tier0, 1, true, false, t0);
    assert!(!st.is_quiescent(t0 + Duration::from_millis(499)));
    // Tier3's 500ms window is the longest one Tier0 activity feeds.
    assert!(st.is_quiescent(t0 + Duration::from_millis(500)));

    // Tier3 activity holds nobody back.
    let mut st = state();
    st.record_io(Tier::Tier3, 1, true, false, t0);
    assert!(st.is_quiescent(t0));
  }

  #[test]
  fn inflight_io_keeps_state_live() {
    let mut st = state();
    st.tracking = TrackingMode::InFlight;
    let t0 = Instant::now();
    st.record_io(Tier::Tier1, 1, true, false, t0);
    assert!(!st.is_quiescent(t0 + Duration::from_secs(60)));
    st.shut_down = true;
    assert!(st.is_quiescent(t0));
  }

  #[test]
  fn ssd_uses_its_own_period_table() {
    let mut st = state();
    assert_eq!(st.period(Tier::Tier3), Duration::from_millis(200));
    st.is_ssd = true;
    assert_eq!(st.period(Tier::Tier3), Duration::from_millis(25));
  }
}
