// src/device/mod.rs

//! Per-device throttle state and the reference-counted handle to it.

pub(crate) mod registry;
pub(crate) mod state;

pub use registry::DeviceRegistry;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{ThrottleConfig, TrackingMode};
use crate::error::ThrottleError;
use crate::tier::Tier;
use crate::timer::{self, TimerHandle, TimerPhase, TimerSlot};
use crate::waitq;

use registry::RegistryInner;
use state::{DeviceState, TimingTables};

/// What a caller names when submitting I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceIdentity {
  /// A physical unit number.
  Unit(u32),
  /// A mount-level identity for storage without a stable unit number.
  Mount(u64),
}

/// Key a throttle state entry is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKey {
  Unit(u32),
  Mount(u64),
  /// Created through [`DeviceRegistry::create_dynamic`]; never looked up.
  Anonymous(u64),
}

impl From<DeviceIdentity> for DeviceKey {
  fn from(identity: DeviceIdentity) -> Self {
    match identity {
      DeviceIdentity::Unit(unit) => DeviceKey::Unit(unit),
      DeviceIdentity::Mount(mount) => DeviceKey::Mount(mount),
    }
  }
}

impl fmt::Display for DeviceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DeviceKey::Unit(unit) => write!(f, "unit:{}", unit),
      DeviceKey::Mount(mount) => write!(f, "mount:{:#x}", mount),
      DeviceKey::Anonymous(id) => write!(f, "anon:{}", id),
    }
  }
}

pub(crate) struct DeviceShared {
  pub(crate) key: DeviceKey,
  pub(crate) is_static: bool,
  /// Outstanding [`ThrottleHandle`]s. Dynamic entries are reaped at zero.
  refs: AtomicUsize,
  pub(crate) state: Mutex<DeviceState>,
  pub(crate) timer: TimerHandle,
  registry: Weak<RegistryInner>,
}

impl DeviceShared {
  pub(crate) fn new(
    key: DeviceKey,
    is_static: bool,
    is_ssd: bool,
    config: &ThrottleConfig,
    timer: TimerHandle,
    registry: Weak<RegistryInner>,
  ) -> Self {
    Self {
      key,
      is_static,
      refs: AtomicUsize::new(0),
      state: Mutex::new(DeviceState::new(config, is_ssd)),
      timer,
      registry,
    }
  }

  pub(crate) fn ref_count(&self) -> usize {
    self.refs.load(Ordering::Acquire)
  }

  /// Whether an unreferenced dynamic entry may be freed. Never blocks on the
  /// state lock: a busy device is kept and looked at again on a later sweep.
  pub(crate) fn is_reapable(&self, now: Instant) -> bool {
    self.state.try_lock().map_or(false, |state| state.is_quiescent(now))
  }

  /// Re-reads the timing tables after a configuration change.
  pub(crate) fn apply_config(&self, config: &ThrottleConfig) {
    let mut state = self.state.lock();
    state.apply_tables(TimingTables::from_config(config));
  }

  /// Enables or disables throttling on this device. Disabling releases every
  /// waiter immediately.
  pub(crate) fn set_disabled(self: &Arc<Self>, disabled: bool) {
    let mut state = self.state.lock();
    if state.disabled == disabled {
      return;
    }
    state.disabled = disabled;
    tracing::debug!(device = %self.key, disabled, "Device throttling toggled");
    if disabled {
      for tier in Tier::THROTTLEABLE {
        waitq::drain(&mut state, tier);
      }
      timer::ensure_armed(self, &mut state, Instant::now());
    }
  }

  /// Stops the device for good: wakes all waiters, cancels the timer, and
  /// drops the reference the timer held.
  pub(crate) fn shutdown(&self) {
    let mut state = self.state.lock();
    if state.shut_down {
      return;
    }
    state.shut_down = true;
    for tier in Tier::THROTTLEABLE {
      waitq::drain(&mut state, tier);
    }
    if let TimerSlot::Armed(scheduled) = std::mem::replace(&mut state.timer, TimerSlot::Idle) {
      // A fire already past its cancellation point sees `shut_down` and returns.
      scheduled.cancel();
    }
    let timer_ref = state.timer_ref.take();
    drop(state);
    drop(timer_ref);
    tracing::trace!(device = %self.key, "Device throttle state shut down");
  }
}

impl fmt::Debug for DeviceShared {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DeviceShared")
      .field("key", &self.key)
      .field("is_static", &self.is_static)
      .field("refs", &self.ref_count())
      .finish_non_exhaustive()
  }
}

// --- Handle ---

/// A counted reference to one device's throttle state.
///
/// Cloning takes another reference; dropping releases it. When the last
/// handle to a dynamically allocated entry goes away, the entry is removed
/// from the registry. Static entries live as long as the registry.
pub struct ThrottleHandle {
  device: Arc<DeviceShared>,
}

impl ThrottleHandle {
  pub(crate) fn retain(device: &Arc<DeviceShared>) -> Self {
    device.refs.fetch_add(1, Ordering::AcqRel);
    Self {
      device: Arc::clone(device),
    }
  }

  pub(crate) fn device(&self) -> &Arc<DeviceShared> {
    &self.device
  }

  pub fn key(&self) -> DeviceKey {
    self.device.key
  }

  /// Outstanding references, including the one the window timer may hold.
  pub fn ref_count(&self) -> usize {
    self.device.ref_count()
  }

  pub fn is_dynamic(&self) -> bool {
    !self.device.is_static
  }

  pub fn same_device(&self, other: &ThrottleHandle) -> bool {
    Arc::ptr_eq(&self.device, &other.device)
  }

  pub fn is_disabled(&self) -> bool {
    self.device.state.lock().disabled
  }

  /// Switches between the rotational and solid-state timing tables.
  pub fn set_solid_state(&self, is_ssd: bool) {
    let mut state = self.device.state.lock();
    if state.is_ssd != is_ssd {
      state.is_ssd = is_ssd;
      tracing::debug!(device = %self.device.key, is_ssd, "Device timing class changed");
    }
  }

  /// Changes when windows open. Refused while any I/O is in flight, since
  /// the outstanding completions would be accounted under the wrong mode.
  pub fn set_tracking(&self, tracking: TrackingMode) -> Result<(), ThrottleError> {
    let mut state = self.device.state.lock();
    if state.tracking == tracking {
      return Ok(());
    }
    if state.has_inflight() {
      return Err(ThrottleError::InvalidArgument(format!(
        "cannot change tracking mode of {} with I/O in flight",
        self.device.key
      )));
    }
    state.tracking = tracking;
    Ok(())
  }

  /// Point-in-time copy of the device's counters.
  pub fn snapshot(&self) -> DeviceSnapshot {
    let state = self.device.state.lock();
    DeviceSnapshot {
      key: self.device.key,
      is_ssd: state.is_ssd,
      disabled: state.disabled,
      tracking: state.tracking,
      io_count: state.io_count,
      period_number: state.period_number,
      timer: state.timer.phase(),
      refs: self.device.ref_count(),
      tiers: Tier::TRACKED
        .into_iter()
        .map(|tier| {
          let ts = state.tier(tier);
          TierSnapshot {
            tier,
            inflight: ts.inflight,
            waiters: ts.waiters.len(),
            reads: ts.reads,
            writes: ts.writes,
            waits_caused: ts.waits_caused,
            wakes: ts.wakes,
            last_issuer: ts.last_issuer,
          }
        })
        .collect(),
    }
  }
}

impl Clone for ThrottleHandle {
  fn clone(&self) -> Self {
    ThrottleHandle::retain(&self.device)
  }
}

impl Drop for ThrottleHandle {
  fn drop(&mut self) {
    let prev = self.device.refs.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
      panic!("throttle state {} released more often than it was retained", self.device.key);
    }
    if prev == 1 && !self.device.is_static {
      if let Some(registry) = self.device.registry.upgrade() {
        registry.reap(&self.device);
      }
    }
  }
}

impl fmt::Debug for ThrottleHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThrottleHandle")
      .field("key", &self.device.key)
      .field("refs", &self.device.ref_count())
      .finish()
  }
}

// --- Snapshots ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSnapshot {
  pub tier: Tier,
  pub inflight: u32,
  pub waiters: usize,
  pub reads: u64,
  pub writes: u64,
  /// Times activity at this tier put another caller to sleep.
  pub waits_caused: u64,
  pub wakes: u64,
  pub last_issuer: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
  pub key: DeviceKey,
  pub is_ssd: bool,
  pub disabled: bool,
  pub tracking: TrackingMode,
  pub io_count: u64,
  pub period_number: u64,
  pub timer: TimerPhase,
  pub refs: usize,
  /// One entry per tracked tier, `Tier0` first.
  pub tiers: Vec<TierSnapshot>,
}

impl DeviceSnapshot {
  pub fn tier(&self, tier: Tier) -> Option<&TierSnapshot> {
    self.tiers.iter().find(|t| t.tier == tier)
  }

  pub fn total_waiters(&self) -> usize {
    self.tiers.iter().map(|t| t.waiters).sum()
  }
}
