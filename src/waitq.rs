// src/waitq.rs

//! Per-tier FIFO wait lists and the blocking wait loop.
//!
//! List membership is mirrored in the caller's `WaitState::on_list`; both
//! sides change only under the device lock, and the caller side also under
//! the caller's wait lock.

use std::sync::Arc;
use std::time::Instant;

use crate::admission::{decide, Decision};
use crate::caller::{CallerShared, WaitState};
use crate::device::state::DeviceState;
use crate::device::ThrottleHandle;
use crate::tier::Tier;
use crate::timer;

/// Where a caller re-joins a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuePosition {
  /// Front, for callers displaced by a rethrottle.
  Head,
  Tail,
}

/// Puts `caller` on the `tier` list and makes sure the timer covers it.
///
/// Returns false if the tier turned out to be unthrottled and the caller was
/// released straight away.
pub(crate) fn enqueue(
  handle: &ThrottleHandle,
  state: &mut DeviceState,
  caller: &Arc<CallerShared>,
  tier: Tier,
  position: QueuePosition,
  now: Instant,
) -> bool {
  {
    let mut wait = caller.lock_wait();
    assert!(
      wait.on_list.is_none(),
      "caller {} enqueued on {} while already listed on {:?}",
      caller.id,
      tier,
      wait.on_list
    );
    wait.on_list = Some(tier);
  }

  let ts = state.tier_mut(tier);
  let was_empty = ts.waiters.is_empty();
  match position {
    QueuePosition::Head => ts.waiters.push_front(Arc::clone(caller)),
    QueuePosition::Tail => ts.waiters.push_back(Arc::clone(caller)),
  }
  if was_empty {
    // A fresh list's period runs from the tier's own last I/O.
    ts.period_start = Some(ts.last_io.unwrap_or(now));
  }

  timer::ensure_armed(handle.device(), state, now);
  caller.lock_wait().on_list.is_some()
}

/// Takes the caller off whatever list it is on. Idempotent.
pub(crate) fn dequeue(state: &mut DeviceState, caller: &Arc<CallerShared>, wait: &mut WaitState) {
  if let Some(tier) = wait.on_list.take() {
    state
      .tier_mut(tier)
      .waiters
      .retain(|listed| !Arc::ptr_eq(listed, caller));
  }
}

/// Releases the head of the `tier` list. Returns false if it was empty.
pub(crate) fn wake_one(state: &mut DeviceState, tier: Tier) -> bool {
  let ts = state.tier_mut(tier);
  match ts.waiters.pop_front() {
    Some(caller) => {
      let mut wait = caller.lock_wait();
      caller.signal_removed(&mut wait);
      drop(wait);
      ts.wakes += 1;
      true
    }
    None => false,
  }
}

/// Releases every caller on the `tier` list. Returns how many.
pub(crate) fn drain(state: &mut DeviceState, tier: Tier) -> usize {
  let waiters = std::mem::take(&mut state.tier_mut(tier).waiters);
  let released = waiters.len();
  for caller in waiters {
    let mut wait = caller.lock_wait();
    caller.signal_removed(&mut wait);
  }
  state.tier_mut(tier).wakes += released as u64;
  released
}

/// Result of [`wait_for_window`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitOutcome {
  /// Tier the I/O ends up issued at.
  pub(crate) tier: Tier,
  /// Decision at the moment the caller stopped waiting.
  pub(crate) decision: Decision,
  /// Completed sleep cycles. Rethrottle wakes are not counted.
  pub(crate) cycles: u32,
  /// Whether the I/O was admitted and recorded. Only a non-blocking attempt
  /// that would have had to wait is refused.
  pub(crate) admitted: bool,
  /// What `record` returned for an admitted I/O.
  pub(crate) inflight_tracked: bool,
}

/// Blocks the calling thread until an I/O may proceed on `handle`'s device.
///
/// The tier is re-derived through `classify` on every iteration because the
/// caller's policy or the system idle level may change while it sleeps.
/// With `max_cycles`, gives up after that many sleeps and admits anyway;
/// `Some(0)` never sleeps and refuses instead.
///
/// `record` runs under the same device lock as the final decision, so a
/// period's single free admission cannot be handed out twice.
pub(crate) fn wait_for_window(
  handle: &ThrottleHandle,
  caller: &Arc<CallerShared>,
  max_cycles: Option<u32>,
  mut classify: impl FnMut() -> Tier,
  record: impl FnOnce(&mut DeviceState, Tier, Instant) -> bool,
) -> WaitOutcome {
  let device = handle.device();
  let mut cycles = 0u32;
  let mut position = QueuePosition::Tail;

  loop {
    let tier = classify();
    let mut state = device.state.lock();
    let now = Instant::now();
    {
      let mut wait = caller.lock_wait();
      if wait.was_rethrottled {
        wait.was_rethrottled = false;
        position = QueuePosition::Head;
      }
      dequeue(&mut state, caller, &mut wait);
    }

    let decision = decide(&state, tier, now);
    let (level, blocking) = match decision {
      Decision::MustWaitNow { level, blocking } => (level, blocking),
      _ => {
        let inflight_tracked = record(&mut *state, tier, now);
        return WaitOutcome {
          tier,
          decision,
          cycles,
          admitted: true,
          inflight_tracked,
        };
      }
    };
    if max_cycles.map_or(false, |max| cycles >= max) {
      // Refused only if it never slept; a capped wait is admitted.
      let admitted = cycles > 0;
      let inflight_tracked = admitted && record(&mut *state, tier, now);
      return WaitOutcome {
        tier,
        decision,
        cycles,
        admitted,
        inflight_tracked,
      };
    }

    // Rethrottle finds the caller through its window, so it must point here
    // before the caller becomes visible on a list.
    caller.open_window(handle);
    if !enqueue(handle, &mut state, caller, level, position, now) {
      continue;
    }
    state.tier_mut(blocking).waits_caused += 1;

    let mut wait = caller.lock_wait();
    if wait.was_rethrottled {
      dequeue(&mut state, caller, &mut wait);
      continue;
    }
    wait.is_blocked = true;
    drop(state);

    tracing::trace!(caller = caller.id, %level, %blocking, cycles, "Caller sleeping on throttle window");
    while wait.on_list.is_some() && !wait.was_rethrottled {
      caller.wakeup.wait(&mut wait);
    }
    wait.is_blocked = false;
    if wait.was_rethrottled {
      tracing::trace!(caller = caller.id, "Caller rethrottled while sleeping");
    } else {
      cycles += 1;
      position = QueuePosition::Tail;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ThrottleConfig;
  use crate::device::{DeviceIdentity, DeviceRegistry};
  use crate::timer::{TimerPhase, TimerService};
  use parking_lot::RwLock;
  use std::time::Duration;

  fn state() -> DeviceState {
    DeviceState::new(&ThrottleConfig::default(), false)
  }

  fn listed(state: &mut DeviceState, id: u64, tier: Tier) -> Arc<CallerShared> {
    let caller = Arc::new(CallerShared::new(id, Default::default()));
    caller.lock_wait().on_list = Some(tier);
    state.tier_mut(tier).waiters.push_back(Arc::clone(&caller));
    caller
  }

  #[test]
  fn wake_one_is_fifo() {
    let mut st = state();
    let a = listed(&mut st, 1, Tier::Tier3);
    let b = listed(&mut st, 2, Tier::Tier3);

    assert!(wake_one(&mut st, Tier::Tier3));
    assert_eq!(a.lock_wait().on_list, None);
    assert_eq!(b.lock_wait().on_list, Some(Tier::Tier3));

    assert!(wake_one(&mut st, Tier::Tier3));
    assert_eq!(b.lock_wait().on_list, None);
    assert!(!wake_one(&mut st, Tier::Tier3));
    assert_eq!(st.tier(Tier::Tier3).wakes, 2);
  }

  #[test]
  fn dequeue_is_idempotent() {
    let mut st = state();
    let a = listed(&mut st, 1, Tier::Tier2);
    let b = listed(&mut st, 2, Tier::Tier2);
    {
      let mut wait = a.lock_wait();
      dequeue(&mut st, &a, &mut wait);
      dequeue(&mut st, &a, &mut wait);
      assert_eq!(wait.on_list, None);
    }
    assert_eq!(st.tier(Tier::Tier2).waiters.len(), 1);
    assert!(Arc::ptr_eq(&st.tier(Tier::Tier2).waiters[0], &b));
  }

  #[test]
  fn drain_releases_everyone_on_the_tier() {
    let mut st = state();
    let a = listed(&mut st, 1, Tier::Tier1);
    let b = listed(&mut st, 2, Tier::Tier1);
    let c = listed(&mut st, 3, Tier::Tier2);
    assert_eq!(drain(&mut st, Tier::Tier1), 2);
    assert_eq!(a.lock_wait().on_list, None);
    assert_eq!(b.lock_wait().on_list, None);
    assert_eq!(c.lock_wait().on_list, Some(Tier::Tier2));
    assert!(st.tier(Tier::Tier1).waiters.is_empty());
  }

  fn live_device() -> (TimerService, ThrottleHandle) {
    let service = TimerService::start().unwrap();
    let config = Arc::new(RwLock::new(ThrottleConfig::default()));
    let registry = DeviceRegistry::new(config, service.handle());
    let handle = registry.lookup(DeviceIdentity::Unit(0)).unwrap();
    (service, handle)
  }

  #[test]
  fn enqueue_honours_position_and_arms_the_timer() {
    let (_service, handle) = live_device();
    let a = Arc::new(CallerShared::new(1, Default::default()));
    let b = Arc::new(CallerShared::new(2, Default::default()));
    {
      let mut st = handle.device().state.lock();
      let t0 = Instant::now();
      let t1 = t0 + Duration::from_millis(300);
      st.record_io(Tier::Tier3, 98, true, false, t0);
      st.record_io(Tier::Tier0, 99, true, false, t1);

      assert!(enqueue(&handle, &mut st, &a, Tier::Tier3, QueuePosition::Tail, t1));
      assert!(enqueue(&handle, &mut st, &b, Tier::Tier3, QueuePosition::Head, t1));
      assert!(Arc::ptr_eq(&st.tier(Tier::Tier3).waiters[0], &b));
      // Seeded from the waiting tier's own last I/O, not the blocker's.
      assert_eq!(st.tier(Tier::Tier3).period_start, Some(t0));
      assert_eq!(st.timer.phase(), TimerPhase::Armed);
      assert!(st.timer_ref.is_some());
    }
    handle.device().shutdown();
    assert_eq!(a.lock_wait().on_list, None);
    assert_eq!(b.lock_wait().on_list, None);
  }

  #[test]
  fn fresh_list_without_own_io_is_seeded_at_enqueue_time() {
    let (_service, handle) = live_device();
    let caller = Arc::new(CallerShared::new(1, Default::default()));
    {
      let mut st = handle.device().state.lock();
      let now = Instant::now();
      st.record_io(Tier::Tier0, 99, true, false, now);
      assert!(enqueue(&handle, &mut st, &caller, Tier::Tier2, QueuePosition::Tail, now));
      assert_eq!(st.tier(Tier::Tier2).period_start, Some(now));
    }
    handle.device().shutdown();
  }

  #[test]
  fn free_admission_is_recorded_with_the_decision() {
    let (_service, handle) = live_device();
    let first = Arc::new(CallerShared::new(1, Default::default()));
    let second = Arc::new(CallerShared::new(2, Default::default()));
    handle
      .device()
      .state
      .lock()
      .record_io(Tier::Tier0, 99, true, false, Instant::now());

    let submit = |caller: &Arc<CallerShared>| {
      wait_for_window(&handle, caller, Some(0), || Tier::Tier3, |st, tier, now| {
        st.record_io(tier, caller.id, true, false, now)
      })
    };

    let engaged = submit(&first);
    assert!(engaged.admitted);
    assert!(matches!(engaged.decision, Decision::Engaged { .. }));
    let refused = submit(&second);
    assert!(!refused.admitted);
    assert!(refused.decision.must_wait());

    let st = handle.device().state.lock();
    assert_eq!(st.io_count, st.io_count_at_period_start + 1);
    assert_eq!(st.tier(Tier::Tier3).last_issuer, Some(1));
  }

  #[test]
  fn enqueue_on_an_unthrottled_tier_releases_immediately() {
    let (_service, handle) = live_device();
    let caller = Arc::new(CallerShared::new(1, Default::default()));
    let mut st = handle.device().state.lock();
    let now = Instant::now();
    assert!(!enqueue(&handle, &mut st, &caller, Tier::Tier2, QueuePosition::Tail, now));
    assert!(st.tier(Tier::Tier2).waiters.is_empty());
    assert_eq!(caller.lock_wait().on_list, None);
    assert_eq!(st.timer.phase(), TimerPhase::Idle);
  }
}
