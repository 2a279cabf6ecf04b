// src/throttler.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::admission::{decide, Decision};
use crate::caller::Caller;
use crate::config::ThrottleConfig;
use crate::device::state::DeviceState;
use crate::device::{DeviceIdentity, DeviceRegistry, ThrottleHandle};
use crate::error::ThrottleError;
use crate::rethrottle::{rethrottle, RethrottleOutcome};
use crate::tier::{classify, IoPolicy, Tier};
use crate::timer::TimerService;
use crate::waitq;

bitflags! {
  /// Per-request attributes.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct IoFlags: u8 {
    const READ = 1 << 0;
    /// Counts toward statistics but opens no window for other tiers.
    const PASSIVE = 1 << 1;
    /// The data was expected in the boot cache and was not there.
    const BOOTCACHE_MISS = 1 << 2;
  }
}

/// One I/O as seen at submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoRequest {
  pub flags: IoFlags,
  /// Overrides [`ThrottleConfig::max_wait_cycles`] for this request.
  /// `Some(0)` turns the submit into a non-blocking attempt.
  pub max_wait_cycles: Option<u32>,
}

impl IoRequest {
  pub fn read() -> Self {
    Self {
      flags: IoFlags::READ,
      max_wait_cycles: None,
    }
  }

  pub fn write() -> Self {
    Self::default()
  }

  pub fn with_flags(mut self, flags: IoFlags) -> Self {
    self.flags |= flags;
    self
  }

  /// Never sleep; report instead whether the I/O would have had to wait.
  pub fn non_blocking(mut self) -> Self {
    self.max_wait_cycles = Some(0);
    self
  }

  pub fn with_max_wait_cycles(mut self, cycles: u32) -> Self {
    self.max_wait_cycles = Some(cycles);
    self
  }
}

/// Result of a submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
  /// False only for a non-blocking submit that would have had to wait. The
  /// I/O was not recorded and should be retried later.
  pub admitted: bool,
  /// The I/O ran under an active throttle window.
  pub must_delay: bool,
  pub decision: Decision,
  /// Tier the I/O was issued at.
  pub tier: Tier,
  /// Sleep cycles spent before admission.
  pub wait_cycles: u32,
  /// The device counted the I/O as inflight; report its completion.
  pub inflight_tracked: bool,
}

impl Admission {
  fn unthrottled(tier: Tier, inflight_tracked: bool) -> Self {
    Self {
      admitted: true,
      must_delay: false,
      decision: Decision::Disengaged,
      tier,
      wait_cycles: 0,
      inflight_tracked,
    }
  }
}

pub(crate) struct ThrottlerInner {
  registry: DeviceRegistry,
  config: Arc<RwLock<ThrottleConfig>>,
  /// Mirrors `config.enabled` for the submit fast path.
  enabled: AtomicBool,
  system_idle_level: AtomicU32,
  next_caller_id: AtomicU64,
  shutdown_initiated: AtomicBool,
  timer: Mutex<TimerService>,
}

impl ThrottlerInner {
  fn classify(&self, caller: &Caller, flags: IoFlags) -> Tier {
    let miss = flags.contains(IoFlags::BOOTCACHE_MISS) || caller.bootcache_miss();
    classify(caller.policy(), miss, self.system_idle_level.load(Ordering::Acquire))
  }

  fn is_shut_down(&self) -> bool {
    self.shutdown_initiated.load(Ordering::Acquire)
  }

  fn shutdown(&self) {
    if self
      .shutdown_initiated
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }
    tracing::info!("Throttler shutdown initiated.");
    self.registry.shutdown();
    self.registry.for_each_device(|device| device.shutdown());
    self.timer.lock().shutdown();
    tracing::debug!("Throttler shutdown complete.");
  }
}

impl Drop for ThrottlerInner {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Entry point for tiered I/O admission control.
///
/// Cloning yields another handle to the same throttler.
#[derive(Clone)]
pub struct Throttler {
  inner: Arc<ThrottlerInner>,
}

impl Throttler {
  /// Validates `config` and starts the window timer service.
  pub fn new(config: ThrottleConfig) -> Result<Self, ThrottleError> {
    config.validate()?;
    let timer = TimerService::start()?;
    let enabled = config.enabled;
    let config = Arc::new(RwLock::new(config));
    let registry = DeviceRegistry::new(Arc::clone(&config), timer.handle());
    tracing::debug!(enabled, "Throttler created");
    Ok(Self {
      inner: Arc::new(ThrottlerInner {
        registry,
        config,
        enabled: AtomicBool::new(enabled),
        system_idle_level: AtomicU32::new(0),
        next_caller_id: AtomicU64::new(1),
        shutdown_initiated: AtomicBool::new(false),
        timer: Mutex::new(timer),
      }),
    })
  }

  pub fn registry(&self) -> &DeviceRegistry {
    &self.inner.registry
  }

  /// Creates a handle for a thread that issues I/O under `policy`.
  pub fn caller(&self, policy: IoPolicy) -> Caller {
    Caller::new(self.inner.next_caller_id.fetch_add(1, Ordering::Relaxed), policy)
  }

  /// Tier an I/O from `caller` would currently be issued at.
  pub fn classify(&self, caller: &Caller, flags: IoFlags) -> Tier {
    self.inner.classify(caller, flags)
  }

  // --- Submission ---

  /// Admits an I/O on `identity`, sleeping the calling thread while a
  /// stricter tier holds the device.
  ///
  /// If no throttle state can be allocated for the identity the I/O is
  /// admitted unthrottled.
  pub fn on_io_submit(&self, caller: &Caller, identity: DeviceIdentity, request: IoRequest) -> Admission {
    if self.inner.is_shut_down() {
      return Admission::unthrottled(self.inner.classify(caller, request.flags), false);
    }
    match self.inner.registry.lookup(identity) {
      Ok(handle) => self.submit_to(caller, &handle, request),
      Err(ThrottleError::ShutDown) => Admission::unthrottled(self.inner.classify(caller, request.flags), false),
      Err(e) => {
        tracing::warn!(?identity, error = %e, "No throttle state, admitting I/O unthrottled");
        Admission::unthrottled(self.inner.classify(caller, request.flags), false)
      }
    }
  }

  /// Like [`Throttler::on_io_submit`] for a device the caller already holds
  /// a handle to.
  pub fn submit_to(&self, caller: &Caller, handle: &ThrottleHandle, request: IoRequest) -> Admission {
    let inner = &self.inner;
    let is_read = request.flags.contains(IoFlags::READ);
    let passive = request.flags.contains(IoFlags::PASSIVE) || caller.policy().is_passive();
    let issuer = caller.id();
    let record = |state: &mut DeviceState, tier: Tier, now: Instant| state.record_io(tier, issuer, is_read, passive, now);

    if !inner.enabled.load(Ordering::Acquire) || inner.is_shut_down() {
      let tier = inner.classify(caller, request.flags);
      let mut state = handle.device().state.lock();
      return Admission::unthrottled(tier, record(&mut *state, tier, Instant::now()));
    }

    let max_cycles = request.max_wait_cycles.or_else(|| inner.config.read().max_wait_cycles);
    caller.shared.lock_wait().request_flags = request.flags;
    let outcome = waitq::wait_for_window(
      handle,
      &caller.shared,
      max_cycles,
      || inner.classify(caller, request.flags),
      record,
    );
    caller.shared.lock_wait().request_flags = IoFlags::empty();

    if !outcome.admitted {
      tracing::trace!(caller = issuer, device = %handle.key(), decision = %outcome.decision, "Non-blocking submit refused");
      return Admission {
        admitted: false,
        must_delay: true,
        decision: outcome.decision,
        tier: outcome.tier,
        wait_cycles: 0,
        inflight_tracked: false,
      };
    }

    if outcome.decision.is_throttled() {
      caller.shared.open_window(handle);
    }
    if outcome.cycles > 0 {
      tracing::debug!(
        caller = issuer,
        device = %handle.key(),
        tier = %outcome.tier,
        cycles = outcome.cycles,
        "I/O admitted after throttling"
      );
    }
    Admission {
      admitted: true,
      must_delay: outcome.decision.is_throttled(),
      decision: outcome.decision,
      tier: outcome.tier,
      wait_cycles: outcome.cycles,
      inflight_tracked: outcome.inflight_tracked,
    }
  }

  /// Reports that an I/O issued at `tier` on `identity` finished.
  pub fn on_io_complete(&self, identity: DeviceIdentity, tier: Tier) {
    if let Some(handle) = self.inner.registry.find(identity) {
      self.complete_on(&handle, tier);
    }
  }

  pub fn complete_on(&self, handle: &ThrottleHandle, tier: Tier) {
    let mut state = handle.device().state.lock();
    state.complete_io(tier, Instant::now());
  }

  /// Decision an I/O at `tier` would get right now, without waiting or
  /// recording anything.
  pub fn io_will_be_throttled(&self, identity: DeviceIdentity, tier: Tier) -> Decision {
    if !self.inner.enabled.load(Ordering::Acquire) {
      return Decision::Disengaged;
    }
    match self.inner.registry.find(identity) {
      Some(handle) => {
        let state = handle.device().state.lock();
        decide(&state, tier, Instant::now())
      }
      None => Decision::Disengaged,
    }
  }

  // --- Caller management ---

  /// Drops the caller's hold on its last throttled device.
  pub fn reset_caller_window(&self, caller: &Caller) {
    let released = caller.shared.take_window();
    if let Some(handle) = &released {
      tracing::trace!(caller = caller.id(), device = %handle.key(), "Caller throttle window reset");
    }
    drop(released);
  }

  /// Re-evaluates a caller after something affecting its tier changed.
  ///
  /// A sleeping caller is reclassified with the flags of the request it is
  /// waiting to issue.
  pub fn rethrottle_caller(&self, caller: &Caller) -> RethrottleOutcome {
    let flags = caller.shared.lock_wait().request_flags;
    let tier = self.inner.classify(caller, flags);
    rethrottle(&caller.shared, tier)
  }

  /// Changes a caller's policy and rethrottles it.
  pub fn set_caller_policy(&self, caller: &Caller, policy: IoPolicy) -> RethrottleOutcome {
    caller.set_policy(policy);
    self.rethrottle_caller(caller)
  }

  // --- Global controls ---

  pub fn is_enabled(&self) -> bool {
    self.inner.enabled.load(Ordering::Acquire)
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.inner.config.write().enabled = enabled;
    self.inner.enabled.store(enabled, Ordering::Release);
    tracing::info!(enabled, "Throttling toggled");
  }

  pub fn system_idle_level(&self) -> u32 {
    self.inner.system_idle_level.load(Ordering::Acquire)
  }

  /// Above zero, `Tier3` I/O is issued at `Tier2`.
  pub fn set_system_idle_level(&self, level: u32) {
    let prev = self.inner.system_idle_level.swap(level, Ordering::AcqRel);
    if prev != level {
      tracing::debug!(level, "System idle level changed");
    }
  }

  /// Sets a tunable by option ID and pushes the new tables to every device.
  pub fn set_option(&self, option_id: i32, value: &[u8]) -> Result<(), ThrottleError> {
    let updated = {
      let mut config = self.inner.config.write();
      config.apply_option(option_id, value)?;
      config.clone()
    };
    self.inner.enabled.store(updated.enabled, Ordering::Release);
    self.inner.registry.for_each_device(|device| device.apply_config(&updated));
    tracing::debug!(option_id, "Throttle option updated");
    Ok(())
  }

  pub fn option(&self, option_id: i32) -> Result<i32, ThrottleError> {
    self.inner.config.read().option(option_id)
  }

  pub fn config(&self) -> ThrottleConfig {
    self.inner.config.read().clone()
  }

  /// Wakes every waiter and stops the timer. Later submits are admitted
  /// unthrottled. Also runs when the last handle is dropped.
  pub fn shutdown(&self) {
    self.inner.shutdown();
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.is_shut_down()
  }
}

impl fmt::Debug for Throttler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Throttler")
      .field("enabled", &self.is_enabled())
      .field("system_idle_level", &self.system_idle_level())
      .field("registry", &self.inner.registry)
      .finish()
  }
}
