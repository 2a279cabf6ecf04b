// src/timer/service.rs

//! One-shot timers on a dedicated single-worker tokio runtime.
//!
//! Each scheduled timer carries a token that moves from `PENDING` to either
//! `RUNNING` (the task claimed it) or `CANCELLED` (the owner claimed it).
//! Exactly one side wins, so a cancel that returns `false` means the
//! callback is already on its way.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

use crate::error::ThrottleError;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Owner of the timer runtime.
pub(crate) struct TimerService {
  runtime: Option<Runtime>,
  handle: TimerHandle,
}

impl TimerService {
  pub(crate) fn start() -> Result<Self, ThrottleError> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(1)
      .thread_name("iothrottle-timer")
      .enable_time()
      .build()?;
    let handle = TimerHandle {
      runtime: runtime.handle().clone(),
    };
    tracing::debug!("Throttle timer service started");
    Ok(Self {
      runtime: Some(runtime),
      handle,
    })
  }

  pub(crate) fn handle(&self) -> TimerHandle {
    self.handle.clone()
  }

  /// Stops the runtime without waiting for pending timers. Safe to call from
  /// inside another async runtime.
  pub(crate) fn shutdown(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
      tracing::debug!("Throttle timer service stopped");
    }
  }
}

impl Drop for TimerService {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Cheap, cloneable access to the timer runtime.
#[derive(Clone, Debug)]
pub(crate) struct TimerHandle {
  runtime: Handle,
}

impl TimerHandle {
  /// Runs `callback` on the timer thread at `deadline` unless cancelled
  /// first.
  pub(crate) fn schedule<F>(&self, deadline: Instant, generation: u64, callback: F) -> ScheduledTimer
  where
    F: FnOnce() + Send + 'static,
  {
    let token = Arc::new(AtomicU8::new(PENDING));
    let task_token = Arc::clone(&token);
    let task = self.runtime.spawn(async move {
      tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
      if task_token
        .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        callback();
      }
    });
    ScheduledTimer {
      token,
      abort: task.abort_handle(),
      deadline,
      generation,
    }
  }
}

#[derive(Debug)]
pub(crate) struct ScheduledTimer {
  token: Arc<AtomicU8>,
  abort: AbortHandle,
  deadline: Instant,
  generation: u64,
}

impl ScheduledTimer {
  pub(crate) fn deadline(&self) -> Instant {
    self.deadline
  }

  pub(crate) fn generation(&self) -> u64 {
    self.generation
  }

  /// Prevents the callback from running. Returns `false` if it already
  /// started (or finished).
  pub(crate) fn cancel(&self) -> bool {
    let cancelled = self
      .token
      .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();
    if cancelled {
      self.abort.abort();
    }
    cancelled
  }
}
