// src/caller.rs

//! Per-thread throttle bookkeeping.
//!
//! A [`Caller`] is owned by the thread that issues I/O. The window timer and
//! the rethrottler touch it from other threads, which is why the wait state
//! lives behind its own small lock and condition variable.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::device::ThrottleHandle;
use crate::throttler::IoFlags;
use crate::tier::{IoPolicy, Tier};

/// Wait-list membership and the sleep/rethrottle handshake.
///
/// Guarded by [`CallerShared::wait`]. Lock order: device state first, then
/// this.
#[derive(Debug, Default)]
pub(crate) struct WaitState {
  /// Tier list this caller is on, if any.
  pub(crate) on_list: Option<Tier>,
  /// True between deciding to sleep and resuming.
  pub(crate) is_blocked: bool,
  /// Set by the rethrottler; consumed by the waiter.
  pub(crate) was_rethrottled: bool,
  /// Flags of the request being admitted, so a rethrottle reclassifies the
  /// I/O the caller is actually waiting to issue.
  pub(crate) request_flags: IoFlags,
}

/// Throttle window the caller still holds after an engaged or delayed I/O.
#[derive(Debug, Default)]
pub(crate) struct CallerWindow {
  pub(crate) device: Option<ThrottleHandle>,
  pub(crate) lowpri_window_active: bool,
}

pub(crate) struct CallerShared {
  pub(crate) id: u64,
  policy: Mutex<IoPolicy>,
  bootcache_miss: AtomicBool,
  pub(crate) wait: Mutex<WaitState>,
  pub(crate) wakeup: Condvar,
  pub(crate) window: Mutex<CallerWindow>,
}

impl CallerShared {
  pub(crate) fn new(id: u64, policy: IoPolicy) -> Self {
    Self {
      id,
      policy: Mutex::new(policy),
      bootcache_miss: AtomicBool::new(false),
      wait: Mutex::new(WaitState::default()),
      wakeup: Condvar::new(),
      window: Mutex::new(CallerWindow::default()),
    }
  }

  pub(crate) fn policy(&self) -> IoPolicy {
    *self.policy.lock()
  }

  pub(crate) fn bootcache_miss(&self) -> bool {
    self.bootcache_miss.load(Ordering::Acquire)
  }

  pub(crate) fn lock_wait(&self) -> MutexGuard<'_, WaitState> {
    self.wait.lock()
  }

  /// Marks the caller as no longer listed and wakes it if it sleeps.
  /// The caller must already be unlinked from the device list.
  pub(crate) fn signal_removed(&self, wait: &mut WaitState) {
    wait.on_list = None;
    self.wakeup.notify_one();
  }

  /// Device handle currently held by the caller's throttle window.
  pub(crate) fn window_device(&self) -> Option<ThrottleHandle> {
    self.window.lock().device.clone()
  }

  /// Whether the caller's window currently refers to `device`.
  pub(crate) fn holds_window_on(&self, device: &ThrottleHandle) -> bool {
    self
      .window
      .lock()
      .device
      .as_ref()
      .map_or(false, |held| held.same_device(device))
  }

  /// Forgets the caller's window. Returns the handle so it can be dropped
  /// outside any lock.
  pub(crate) fn take_window(&self) -> Option<ThrottleHandle> {
    let mut window = self.window.lock();
    window.lowpri_window_active = false;
    window.device.take()
  }

  /// Records that the caller holds a throttle window on `device`.
  pub(crate) fn open_window(&self, device: &ThrottleHandle) {
    let previous = {
      let mut window = self.window.lock();
      window.lowpri_window_active = true;
      let already_held = window.device.as_ref().map_or(false, |held| held.same_device(device));
      if already_held {
        None
      } else {
        window.device.replace(device.clone())
      }
    };
    // Released outside the window lock; dropping may reap a dynamic entry.
    drop(previous);
  }
}

impl fmt::Debug for CallerShared {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallerShared")
      .field("id", &self.id)
      .field("policy", &self.policy())
      .finish_non_exhaustive()
  }
}

/// A thread's handle for throttled I/O.
///
/// Cloning yields another handle to the same caller so that a policy manager
/// on a different thread can rethrottle it.
#[derive(Clone)]
pub struct Caller {
  pub(crate) shared: Arc<CallerShared>,
}

impl Caller {
  pub(crate) fn new(id: u64, policy: IoPolicy) -> Self {
    Self {
      shared: Arc::new(CallerShared::new(id, policy)),
    }
  }

  /// Issuer identity used for last-I/O attribution.
  pub fn id(&self) -> u64 {
    self.shared.id
  }

  pub fn policy(&self) -> IoPolicy {
    self.shared.policy()
  }

  /// Updates the declared policy. A blocked caller only notices once it is
  /// rethrottled; see `Throttler::set_caller_policy`.
  pub fn set_policy(&self, policy: IoPolicy) {
    *self.shared.policy.lock() = policy;
  }

  pub fn bootcache_miss(&self) -> bool {
    self.shared.bootcache_miss()
  }

  /// Marks subsequent I/O from this caller as bootcache misses.
  pub fn set_bootcache_miss(&self, miss: bool) {
    self.shared.bootcache_miss.store(miss, Ordering::Release);
  }

  /// Tier list the caller currently waits on.
  pub fn assigned_tier(&self) -> Option<Tier> {
    self.shared.lock_wait().on_list
  }

  pub fn is_blocked(&self) -> bool {
    self.shared.lock_wait().is_blocked
  }

  pub fn was_rethrottled(&self) -> bool {
    self.shared.lock_wait().was_rethrottled
  }

  /// Whether the caller still holds throttle bookkeeping to release.
  pub fn has_lowpri_window(&self) -> bool {
    self.shared.window.lock().lowpri_window_active
  }
}

impl fmt::Debug for Caller {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Caller")
      .field("id", &self.shared.id)
      .field("policy", &self.shared.policy())
      .finish()
  }
}
