// tests/common.rs
#![allow(dead_code)]

use iothrottle::{Admission, Caller, DeviceIdentity, IoPolicy, IoRequest, ThrottleConfig, Throttler, TierDurations};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Can be overridden by RUST_LOG env variable
    let default_filter = "iothrottle=debug,info";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_max_level(tracing::Level::TRACE)
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

/// Short windows and periods so timer-driven tests finish quickly.
pub fn fast_config() -> ThrottleConfig {
  ThrottleConfig {
    windows: TierDurations::from_millis([0, 500, 1000, 2000]),
    windows_ssd: TierDurations::from_millis([0, 500, 1000, 2000]),
    io_periods: TierDurations::from_millis([0, 40, 60, 80]),
    io_periods_ssd: TierDurations::from_millis([0, 10, 15, 20]),
    ..ThrottleConfig::default()
  }
}

/// Periods long enough that the timer never wakes anybody during a test.
pub fn frozen_config() -> ThrottleConfig {
  ThrottleConfig {
    windows: TierDurations::from_millis([0, 60_000, 60_000, 60_000]),
    io_periods: TierDurations::from_millis([0, 30_000, 30_000, 30_000]),
    ..ThrottleConfig::default()
  }
}

pub fn test_throttler(config: ThrottleConfig) -> Throttler {
  setup_tracing();
  Throttler::new(config).expect("Failed to create test throttler")
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if cond() {
      return true;
    }
    thread::sleep(Duration::from_millis(1));
  }
  cond()
}

/// Opens a `Tier0` window on `device` and spends the current period's
/// budget with one engaged `Tier3` I/O, so the next throttleable submit has
/// to sleep.
pub fn saturate(throttler: &Throttler, device: DeviceIdentity) {
  let foreground = throttler.caller(IoPolicy::Important);
  let background = throttler.caller(IoPolicy::Throttle);
  let first = throttler.on_io_submit(&foreground, device, IoRequest::read());
  assert!(!first.must_delay);
  let engaged = throttler.on_io_submit(&background, device, IoRequest::read());
  assert!(engaged.admitted && engaged.must_delay && engaged.wait_cycles == 0);
}

/// Submits from a new thread and returns once that caller is asleep.
pub fn spawn_blocked_submit(
  throttler: &Throttler,
  caller: &Caller,
  device: DeviceIdentity,
  request: IoRequest,
) -> JoinHandle<Admission> {
  let t = throttler.clone();
  let c = caller.clone();
  let handle = thread::spawn(move || t.on_io_submit(&c, device, request));
  assert!(
    wait_until(Duration::from_secs(2), || caller.is_blocked()),
    "caller {} never went to sleep",
    caller.id()
  );
  handle
}
