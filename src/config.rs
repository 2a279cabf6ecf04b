use std::time::Duration;

use crate::tier::{Tier, TIER_SLOTS};
use crate::ThrottleError;

// Administrative option identifiers. Values are native-endian i32 byte slices.
pub const THROTTLE_ENABLED: i32 = 1;
pub const WINDOW_TIER1_MSECS: i32 = 10;
pub const WINDOW_TIER2_MSECS: i32 = 11;
pub const WINDOW_TIER3_MSECS: i32 = 12;
pub const WINDOW_SSD_TIER1_MSECS: i32 = 13;
pub const WINDOW_SSD_TIER2_MSECS: i32 = 14;
pub const WINDOW_SSD_TIER3_MSECS: i32 = 15;
pub const IO_PERIOD_TIER1_MSECS: i32 = 20;
pub const IO_PERIOD_TIER2_MSECS: i32 = 21;
pub const IO_PERIOD_TIER3_MSECS: i32 = 22;
pub const IO_PERIOD_SSD_TIER1_MSECS: i32 = 23;
pub const IO_PERIOD_SSD_TIER2_MSECS: i32 = 24;
pub const IO_PERIOD_SSD_TIER3_MSECS: i32 = 25;
pub const MIN_TIMER_INTERVAL_MSECS: i32 = 30;
/// -1 for unbounded waits.
pub const MAX_WAIT_CYCLES: i32 = 31;

/// One duration per tracked tier, indexed by [`Tier::slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierDurations([Duration; TIER_SLOTS]);

impl TierDurations {
  pub const fn from_millis(ms: [u64; TIER_SLOTS]) -> Self {
    TierDurations([
      Duration::from_millis(ms[0]),
      Duration::from_millis(ms[1]),
      Duration::from_millis(ms[2]),
      Duration::from_millis(ms[3]),
    ])
  }

  /// Duration for `tier`; `Tier::None` has no window.
  pub fn get(&self, tier: Tier) -> Duration {
    tier.slot().map(|slot| self.0[slot]).unwrap_or(Duration::ZERO)
  }

  pub fn set(&mut self, tier: Tier, duration: Duration) {
    if let Some(slot) = tier.slot() {
      self.0[slot] = duration;
    }
  }
}

/// How a device opens protection windows for the tier that issued an I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingMode {
  /// The window opens when the I/O is issued. Completion is not tracked.
  #[default]
  AtIssue,
  /// The I/O counts as inflight until it completes; the window opens at
  /// completion time.
  InFlight,
}

/// Tunables for the whole throttling core.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
  /// Global switch. When false every submit is admitted without throttling.
  pub enabled: bool,
  /// How long a tier stays throttled after activity at a stricter tier,
  /// indexed by the throttled tier (rotational devices).
  pub windows: TierDurations,
  pub windows_ssd: TierDurations,
  /// Accounting period per tier: how long a waiter at that tier waits before
  /// the timer may release it (rotational devices).
  pub io_periods: TierDurations,
  pub io_periods_ssd: TierDurations,
  /// Floor applied to timer deadlines after a period rollover.
  pub min_timer_interval: Duration,
  /// Size of the statically indexed unit table. Units at or above this value
  /// get dynamically allocated state.
  pub static_units: usize,
  /// Cap on dynamically allocated device states.
  pub max_dynamic_devices: usize,
  /// Default cap on wait cycles per submit. `None` waits as long as needed.
  pub max_wait_cycles: Option<u32>,
  /// Tracking mode for newly created device states.
  pub tracking: TrackingMode,
}

impl Default for ThrottleConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      windows: TierDurations::from_millis([0, 25, 100, 500]),
      windows_ssd: TierDurations::from_millis([0, 25, 100, 500]),
      io_periods: TierDurations::from_millis([0, 40, 85, 200]),
      io_periods_ssd: TierDurations::from_millis([0, 5, 15, 25]),
      min_timer_interval: Duration::from_millis(1),
      static_units: 64,
      max_dynamic_devices: 1024,
      max_wait_cycles: None,
      tracking: TrackingMode::AtIssue,
    }
  }
}

impl ThrottleConfig {
  /// Checks the invariants the timer relies on.
  pub fn validate(&self) -> Result<(), ThrottleError> {
    for tier in Tier::THROTTLEABLE {
      for (name, table) in [("io_periods", &self.io_periods), ("io_periods_ssd", &self.io_periods_ssd)] {
        if table.get(tier).is_zero() {
          return Err(ThrottleError::InvalidConfig(format!("{} for {} must be non-zero", name, tier)));
        }
      }
    }
    if self.static_units == 0 {
      return Err(ThrottleError::InvalidConfig("static_units must be at least 1".into()));
    }
    for (name, table) in [("windows", &self.windows), ("windows_ssd", &self.windows_ssd)] {
      let shrinking = Tier::THROTTLEABLE.windows(2).any(|pair| table.get(pair[1]) < table.get(pair[0]));
      if shrinking {
        tracing::warn!(table = name, "Throttle windows shrink with tier; lower tiers may thrash");
      }
    }
    Ok(())
  }

  /// Window table for a device class.
  pub fn windows_for(&self, is_ssd: bool) -> TierDurations {
    if is_ssd {
      self.windows_ssd
    } else {
      self.windows
    }
  }

  /// Period table for a device class.
  pub fn periods_for(&self, is_ssd: bool) -> TierDurations {
    if is_ssd {
      self.io_periods_ssd
    } else {
      self.io_periods
    }
  }

  /// Applies one administrative option. The config is left untouched on error.
  pub fn apply_option(&mut self, option_id: i32, value: &[u8]) -> Result<(), ThrottleError> {
    let mut next = self.clone();
    match option_id {
      THROTTLE_ENABLED => next.enabled = parse_bool_option(value, option_id)?,
      WINDOW_TIER1_MSECS..=WINDOW_TIER3_MSECS => {
        let tier = tier_for_option(option_id - WINDOW_TIER1_MSECS);
        next.windows.set(tier, parse_millis_option(value, option_id)?);
      }
      WINDOW_SSD_TIER1_MSECS..=WINDOW_SSD_TIER3_MSECS => {
        let tier = tier_for_option(option_id - WINDOW_SSD_TIER1_MSECS);
        next.windows_ssd.set(tier, parse_millis_option(value, option_id)?);
      }
      IO_PERIOD_TIER1_MSECS..=IO_PERIOD_TIER3_MSECS => {
        let tier = tier_for_option(option_id - IO_PERIOD_TIER1_MSECS);
        next.io_periods.set(tier, parse_millis_option(value, option_id)?);
      }
      IO_PERIOD_SSD_TIER1_MSECS..=IO_PERIOD_SSD_TIER3_MSECS => {
        let tier = tier_for_option(option_id - IO_PERIOD_SSD_TIER1_MSECS);
        next.io_periods_ssd.set(tier, parse_millis_option(value, option_id)?);
      }
      MIN_TIMER_INTERVAL_MSECS => next.min_timer_interval = parse_millis_option(value, option_id)?,
      MAX_WAIT_CYCLES => next.max_wait_cycles = parse_cycles_option(value, option_id)?,
      _ => return Err(ThrottleError::InvalidOption(option_id)),
    }
    next.validate().map_err(|_| ThrottleError::InvalidOptionValue(option_id))?;
    *self = next;
    Ok(())
  }

  /// Reads one administrative option back as the i32 it would be set with.
  pub fn option(&self, option_id: i32) -> Result<i32, ThrottleError> {
    let millis = |d: Duration| d.as_millis().min(i32::MAX as u128) as i32;
    let value = match option_id {
      THROTTLE_ENABLED => self.enabled as i32,
      WINDOW_TIER1_MSECS..=WINDOW_TIER3_MSECS => {
        millis(self.windows.get(tier_for_option(option_id - WINDOW_TIER1_MSECS)))
      }
      WINDOW_SSD_TIER1_MSECS..=WINDOW_SSD_TIER3_MSECS => {
        millis(self.windows_ssd.get(tier_for_option(option_id - WINDOW_SSD_TIER1_MSECS)))
      }
      IO_PERIOD_TIER1_MSECS..=IO_PERIOD_TIER3_MSECS => {
        millis(self.io_periods.get(tier_for_option(option_id - IO_PERIOD_TIER1_MSECS)))
      }
      IO_PERIOD_SSD_TIER1_MSECS..=IO_PERIOD_SSD_TIER3_MSECS => {
        millis(self.io_periods_ssd.get(tier_for_option(option_id - IO_PERIOD_SSD_TIER1_MSECS)))
      }
      MIN_TIMER_INTERVAL_MSECS => millis(self.min_timer_interval),
      MAX_WAIT_CYCLES => self.max_wait_cycles.map(|c| c.min(i32::MAX as u32) as i32).unwrap_or(-1),
      _ => return Err(ThrottleError::InvalidOption(option_id)),
    };
    Ok(value)
  }
}

fn tier_for_option(offset: i32) -> Tier {
  Tier::from_raw(offset + 1)
}

// --- Helper functions for parsing option values ---
/// Parses a byte slice representing an integer option.
pub(crate) fn parse_i32_option(value: &[u8], option_id: i32) -> Result<i32, ThrottleError> {
  let arr: [u8; 4] = value
    .try_into()
    .map_err(|_| ThrottleError::InvalidOptionValue(option_id))?;
  Ok(i32::from_ne_bytes(arr))
}

/// Parses a byte slice representing a boolean option (0 or 1).
pub(crate) fn parse_bool_option(value: &[u8], option_id: i32) -> Result<bool, ThrottleError> {
  match parse_i32_option(value, option_id)? {
    0 => Ok(false),
    1 => Ok(true),
    _ => Err(ThrottleError::InvalidOptionValue(option_id)),
  }
}

/// Parses a non-negative millisecond duration.
pub(crate) fn parse_millis_option(value: &[u8], option_id: i32) -> Result<Duration, ThrottleError> {
  match parse_i32_option(value, option_id)? {
    val @ 0.. => Ok(Duration::from_millis(val as u64)),
    _ => Err(ThrottleError::InvalidOptionValue(option_id)),
  }
}

/// Parses a wait-cycle cap: -1 for unbounded, otherwise a non-negative count.
pub(crate) fn parse_cycles_option(value: &[u8], option_id: i32) -> Result<Option<u32>, ThrottleError> {
  match parse_i32_option(value, option_id)? {
    -1 => Ok(None),
    val @ 0.. => Ok(Some(val as u32)),
    _ => Err(ThrottleError::InvalidOptionValue(option_id)),
  }
}
