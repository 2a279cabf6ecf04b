// src/device/registry.rs

//! Maps device identities to throttle state.
//!
//! Units below `static_units` index a fixed table whose entries are created
//! on first use and never freed. Every other identity gets a dynamically
//! allocated entry that lives while at least one [`ThrottleHandle`] refers
//! to it, or while it still carries throttle state (an open window, waiters,
//! an armed timer, inflight I/O). Unreferenced entries of the second kind
//! are swept once they go quiet.
//!
//! Lock order: a device's state lock may be held while taking the dynamic
//! map lock (a handle dropped under the device lock can reap), never the
//! reverse. Under the map lock device state is only ever `try_lock`ed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::config::ThrottleConfig;
use crate::device::{DeviceIdentity, DeviceKey, DeviceShared, ThrottleHandle};
use crate::error::ThrottleError;
use crate::timer::TimerHandle;

pub(crate) struct RegistryInner {
  statics: Box<[OnceCell<Arc<DeviceShared>>]>,
  dynamic: Mutex<HashMap<DeviceKey, Arc<DeviceShared>>>,
  config: Arc<RwLock<ThrottleConfig>>,
  timer: TimerHandle,
  next_anonymous: AtomicU64,
  shut_down: AtomicBool,
}

impl RegistryInner {
  /// Removes a dynamic entry whose last handle was just dropped.
  ///
  /// Runs under the map lock and re-checks the count, so a lookup that
  /// revived the entry in the meantime wins.
  pub(crate) fn reap(&self, device: &Arc<DeviceShared>) {
    let mut dynamic = self.dynamic.lock();
    if !Self::can_free(device, Instant::now()) {
      return;
    }
    let registered = dynamic
      .get(&device.key)
      .map_or(false, |existing| Arc::ptr_eq(existing, device));
    if registered {
      dynamic.remove(&device.key);
      tracing::debug!(device = %device.key, remaining = dynamic.len(), "Freed dynamic throttle state");
    }
  }

  /// Anonymous entries can never be looked up again, so only identity-keyed
  /// ones wait for their state to go quiet.
  fn can_free(device: &DeviceShared, now: Instant) -> bool {
    if device.ref_count() != 0 {
      return false;
    }
    matches!(device.key, DeviceKey::Anonymous(_)) || device.is_reapable(now)
  }

  /// Frees unreferenced entries that no longer carry throttle state.
  fn sweep(dynamic: &mut HashMap<DeviceKey, Arc<DeviceShared>>) {
    let now = Instant::now();
    let before = dynamic.len();
    dynamic.retain(|_, device| !Self::can_free(device, now));
    if dynamic.len() != before {
      tracing::debug!(freed = before - dynamic.len(), remaining = dynamic.len(), "Swept idle dynamic throttle state");
    }
  }

  fn check_open(&self) -> Result<(), ThrottleError> {
    if self.shut_down.load(Ordering::Acquire) {
      return Err(ThrottleError::ShutDown);
    }
    Ok(())
  }

  fn new_device(self: &Arc<Self>, key: DeviceKey, is_static: bool, is_ssd: bool) -> Arc<DeviceShared> {
    let config = self.config.read();
    Arc::new(DeviceShared::new(
      key,
      is_static,
      is_ssd,
      &config,
      self.timer.clone(),
      Arc::downgrade(self),
    ))
  }

  fn max_dynamic(&self) -> usize {
    self.config.read().max_dynamic_devices
  }
}

/// Owns every device's throttle state.
#[derive(Clone)]
pub struct DeviceRegistry {
  inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
  pub(crate) fn new(config: Arc<RwLock<ThrottleConfig>>, timer: TimerHandle) -> Self {
    let static_units = config.read().static_units;
    let statics = (0..static_units).map(|_| OnceCell::new()).collect::<Vec<_>>().into_boxed_slice();
    Self {
      inner: Arc::new(RegistryInner {
        statics,
        dynamic: Mutex::new(HashMap::new()),
        config,
        timer,
        next_anonymous: AtomicU64::new(1),
        shut_down: AtomicBool::new(false),
      }),
    }
  }

  /// Number of statically indexed unit slots.
  pub fn static_capacity(&self) -> usize {
    self.inner.statics.len()
  }

  /// Number of live dynamically allocated entries, after freeing those that
  /// have gone quiet.
  pub fn dynamic_count(&self) -> usize {
    let mut dynamic = self.inner.dynamic.lock();
    RegistryInner::sweep(&mut dynamic);
    dynamic.len()
  }

  fn static_slot(&self, identity: DeviceIdentity) -> Option<&OnceCell<Arc<DeviceShared>>> {
    match identity {
      DeviceIdentity::Unit(unit) => self.inner.statics.get(unit as usize),
      DeviceIdentity::Mount(_) => None,
    }
  }

  /// Returns a handle to the identity's throttle state, creating it on first
  /// use. Fails when the dynamic table is full of live entries or the
  /// throttler has shut down.
  pub fn lookup(&self, identity: DeviceIdentity) -> Result<ThrottleHandle, ThrottleError> {
    self.inner.check_open()?;
    let key = DeviceKey::from(identity);
    if let Some(slot) = self.static_slot(identity) {
      let device = slot.get_or_init(|| {
        tracing::trace!(device = %key, "Initialized static throttle state");
        self.inner.new_device(key, true, false)
      });
      return Ok(ThrottleHandle::retain(device));
    }

    let max_dynamic = self.inner.max_dynamic();
    let mut dynamic = self.inner.dynamic.lock();
    if let Some(device) = dynamic.get(&key) {
      return Ok(ThrottleHandle::retain(device));
    }
    if dynamic.len() >= max_dynamic {
      RegistryInner::sweep(&mut dynamic);
    }
    if dynamic.len() >= max_dynamic {
      return Err(ThrottleError::Exhausted(key.to_string()));
    }
    let device = self.inner.new_device(key, false, false);
    let handle = ThrottleHandle::retain(&device);
    dynamic.insert(key, device);
    tracing::debug!(device = %key, live = dynamic.len(), "Allocated dynamic throttle state");
    Ok(handle)
  }

  /// Returns a handle only if the identity already has state.
  pub fn find(&self, identity: DeviceIdentity) -> Option<ThrottleHandle> {
    if let Some(slot) = self.static_slot(identity) {
      return slot.get().map(ThrottleHandle::retain);
    }
    let dynamic = self.inner.dynamic.lock();
    dynamic.get(&DeviceKey::from(identity)).map(ThrottleHandle::retain)
  }

  /// Creates an entry that is not reachable by identity, for storage that
  /// manages its own handle.
  pub fn create_dynamic(&self, is_ssd: bool) -> Result<ThrottleHandle, ThrottleError> {
    self.inner.check_open()?;
    let key = DeviceKey::Anonymous(self.inner.next_anonymous.fetch_add(1, Ordering::Relaxed));
    let max_dynamic = self.inner.max_dynamic();
    let mut dynamic = self.inner.dynamic.lock();
    if dynamic.len() >= max_dynamic {
      RegistryInner::sweep(&mut dynamic);
    }
    if dynamic.len() >= max_dynamic {
      return Err(ThrottleError::Exhausted(key.to_string()));
    }
    let device = self.inner.new_device(key, false, is_ssd);
    let handle = ThrottleHandle::retain(&device);
    dynamic.insert(key, device);
    tracing::debug!(device = %key, is_ssd, "Created anonymous throttle state");
    Ok(handle)
  }

  /// Gives back a handle obtained from this registry.
  pub fn release(&self, handle: ThrottleHandle) {
    drop(handle);
  }

  /// Turns throttling off for one device and wakes its waiters. Returns
  /// false if the identity has no state yet.
  pub fn disable(&self, identity: DeviceIdentity) -> bool {
    self.set_disabled(identity, true)
  }

  /// Undoes [`DeviceRegistry::disable`].
  pub fn enable(&self, identity: DeviceIdentity) -> bool {
    self.set_disabled(identity, false)
  }

  fn set_disabled(&self, identity: DeviceIdentity, disabled: bool) -> bool {
    match self.find(identity) {
      Some(handle) => {
        handle.device().set_disabled(disabled);
        true
      }
      None => false,
    }
  }

  /// Refuses new handles from now on. Existing handles keep working.
  pub(crate) fn shutdown(&self) {
    self.inner.shut_down.store(true, Ordering::Release);
  }

  /// Runs `f` on every live entry. Entries are collected first so `f` may
  /// take device locks.
  pub(crate) fn for_each_device(&self, mut f: impl FnMut(&Arc<DeviceShared>)) {
    let mut devices: Vec<Arc<DeviceShared>> = self.inner.statics.iter().filter_map(|slot| slot.get().cloned()).collect();
    devices.extend(self.inner.dynamic.lock().values().cloned());
    for device in &devices {
      f(device);
    }
  }
}

impl std::fmt::Debug for DeviceRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeviceRegistry")
      .field("static_capacity", &self.static_capacity())
      .field("dynamic_count", &self.dynamic_count())
      .finish()
  }
}
