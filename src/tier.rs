// src/tier.rs

//! Tier ordinals and the policy classifier.
//!
//! A [`Tier`] is the ordinal priority class an I/O is issued at. `Tier0` is
//! the most important class that still takes part in throttling; `Tier1`
//! through `Tier3` are progressively more willing to wait and are the only
//! tiers ever delayed. `None` marks I/O issued outside any throttling context.

use std::fmt;

use bitflags::bitflags;

/// Ordinal throttle tier. Ordering is total: `None < Tier0 < ... < Tier3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
  None,
  Tier0,
  Tier1,
  Tier2,
  Tier3,
}

/// Number of tiers that carry per-device bookkeeping (`Tier0..=Tier3`).
pub const TIER_SLOTS: usize = 4;

impl Tier {
  /// Tiers with per-device state, in ascending order.
  pub const TRACKED: [Tier; TIER_SLOTS] = [Tier::Tier0, Tier::Tier1, Tier::Tier2, Tier::Tier3];
  /// Tiers that may be delayed, in ascending order.
  pub const THROTTLEABLE: [Tier; 3] = [Tier::Tier1, Tier::Tier2, Tier::Tier3];
  /// The first tier that is ever delayed.
  pub const LOWEST_THROTTLED: Tier = Tier::Tier1;
  /// The least urgent tier.
  pub const HIGHEST: Tier = Tier::Tier3;

  /// Index into per-tier arrays, or `None` for [`Tier::None`].
  pub fn slot(self) -> Option<usize> {
    match self {
      Tier::None => None,
      Tier::Tier0 => Some(0),
      Tier::Tier1 => Some(1),
      Tier::Tier2 => Some(2),
      Tier::Tier3 => Some(3),
    }
  }

  /// Whether I/O at this tier can be delayed at all.
  pub fn is_throttleable(self) -> bool {
    self >= Tier::LOWEST_THROTTLED
  }

  /// Converts a raw level (`-1` for none, `0..=3` for tiers). Values outside
  /// the defined range clamp to the nearest tier.
  pub fn from_raw(raw: i32) -> Tier {
    match raw {
      i32::MIN..=-1 => Tier::None,
      0 => Tier::Tier0,
      1 => Tier::Tier1,
      2 => Tier::Tier2,
      _ => Tier::Tier3,
    }
  }

  pub fn as_raw(self) -> i32 {
    match self {
      Tier::None => -1,
      Tier::Tier0 => 0,
      Tier::Tier1 => 1,
      Tier::Tier2 => 2,
      Tier::Tier3 => 3,
    }
  }

  /// Next throttleable tier in the timer's wake rotation (`3 -> 2 -> 1 -> 3`).
  pub(crate) fn next_in_rotation(self) -> Tier {
    match self {
      Tier::Tier3 => Tier::Tier2,
      Tier::Tier2 => Tier::Tier1,
      _ => Tier::Tier3,
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Tier::None => write!(f, "none"),
      Tier::Tier0 => write!(f, "tier0"),
      Tier::Tier1 => write!(f, "tier1"),
      Tier::Tier2 => write!(f, "tier2"),
      Tier::Tier3 => write!(f, "tier3"),
    }
  }
}

bitflags! {
  /// A set of tracked tiers.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct TierMask: u8 {
    const TIER0 = 1 << 0;
    const TIER1 = 1 << 1;
    const TIER2 = 1 << 2;
    const TIER3 = 1 << 3;
  }
}

impl TierMask {
  pub fn of(tier: Tier) -> TierMask {
    match tier.slot() {
      Some(slot) => TierMask::from_bits_truncate(1 << slot),
      None => TierMask::empty(),
    }
  }

  pub fn contains_tier(&self, tier: Tier) -> bool {
    !TierMask::of(tier).is_empty() && self.contains(TierMask::of(tier))
  }

  /// Members in ascending tier order.
  pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
    Tier::TRACKED.into_iter().filter(move |t| self.contains_tier(*t))
  }
}

// --- I/O Policy ---

/// The I/O policy a caller declares for its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPolicy {
  /// I/O issued outside any throttling context (kernel-internal work).
  Unmanaged,
  Default,
  Important,
  /// Issued at `Tier0` but never opens a window for other tiers.
  Passive,
  Throttle,
  Utility,
  Standard,
}

impl IoPolicy {
  /// Converts a raw policy value. Unknown values clamp to the nearest
  /// defined policy so classification never fails.
  pub fn from_raw(raw: i32) -> IoPolicy {
    match raw {
      i32::MIN..=-1 => IoPolicy::Unmanaged,
      0 => IoPolicy::Default,
      1 => IoPolicy::Important,
      2 => IoPolicy::Passive,
      3 => IoPolicy::Throttle,
      4 => IoPolicy::Utility,
      _ => IoPolicy::Standard,
    }
  }

  pub fn as_raw(self) -> i32 {
    match self {
      IoPolicy::Unmanaged => -1,
      IoPolicy::Default => 0,
      IoPolicy::Important => 1,
      IoPolicy::Passive => 2,
      IoPolicy::Throttle => 3,
      IoPolicy::Utility => 4,
      IoPolicy::Standard => 5,
    }
  }

  /// The tier this policy maps to before any ambient adjustment.
  pub fn base_tier(self) -> Tier {
    match self {
      IoPolicy::Unmanaged => Tier::None,
      IoPolicy::Default | IoPolicy::Important | IoPolicy::Passive => Tier::Tier0,
      IoPolicy::Standard => Tier::Tier1,
      IoPolicy::Utility => Tier::Tier2,
      IoPolicy::Throttle => Tier::Tier3,
    }
  }

  pub fn is_passive(self) -> bool {
    matches!(self, IoPolicy::Passive)
  }
}

impl Default for IoPolicy {
  fn default() -> Self {
    IoPolicy::Default
  }
}

/// Maps a declared policy plus ambient conditions to the tier an I/O is
/// issued at.
///
/// A bootcache miss is always least urgent. Otherwise a `Tier3` policy is
/// demoted to `Tier2` while the system is idle so background maintenance can
/// make progress.
pub fn classify(policy: IoPolicy, is_bootcache_miss: bool, system_idle_level: u32) -> Tier {
  if is_bootcache_miss {
    return Tier::Tier3;
  }
  let base = policy.base_tier();
  if base == Tier::Tier3 && system_idle_level > 0 {
    return Tier::Tier2;
  }
  base
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tiers_are_totally_ordered() {
    assert!(Tier::None < Tier::Tier0);
    assert!(Tier::Tier0 < Tier::Tier1);
    assert!(Tier::Tier2 < Tier::Tier3);
    assert!(!Tier::Tier0.is_throttleable());
    assert!(!Tier::None.is_throttleable());
    assert!(Tier::Tier1.is_throttleable());
  }

  #[test]
  fn classify_maps_policy_directly() {
    assert_eq!(classify(IoPolicy::Important, false, 0), Tier::Tier0);
    assert_eq!(classify(IoPolicy::Standard, false, 0), Tier::Tier1);
    assert_eq!(classify(IoPolicy::Utility, false, 0), Tier::Tier2);
    assert_eq!(classify(IoPolicy::Throttle, false, 0), Tier::Tier3);
    assert_eq!(classify(IoPolicy::Unmanaged, false, 0), Tier::None);
    assert_eq!(classify(IoPolicy::Passive, false, 0), Tier::Tier0);
  }

  #[test]
  fn bootcache_miss_forces_tier3_even_when_idle() {
    assert_eq!(classify(IoPolicy::Important, true, 0), Tier::Tier3);
    assert_eq!(classify(IoPolicy::Standard, true, 2), Tier::Tier3);
  }

  #[test]
  fn idle_system_demotes_tier3_only() {
    assert_eq!(classify(IoPolicy::Throttle, false, 1), Tier::Tier2);
    assert_eq!(classify(IoPolicy::Utility, false, 1), Tier::Tier2);
    assert_eq!(classify(IoPolicy::Standard, false, 5), Tier::Tier1);
  }

  #[test]
  fn raw_values_clamp_to_nearest() {
    assert_eq!(IoPolicy::from_raw(-7), IoPolicy::Unmanaged);
    assert_eq!(IoPolicy::from_raw(42), IoPolicy::Standard);
    assert_eq!(Tier::from_raw(9), Tier::Tier3);
    assert_eq!(Tier::from_raw(-3), Tier::None);
    for tier in Tier::TRACKED {
      assert_eq!(Tier::from_raw(tier.as_raw()), tier);
    }
  }

  #[test]
  fn rotation_visits_every_throttleable_tier() {
    let mut tier = Tier::Tier3;
    let mut seen = TierMask::empty();
    for _ in 0..3 {
      seen |= TierMask::of(tier);
      tier = tier.next_in_rotation();
    }
    assert_eq!(tier, Tier::Tier3);
    assert_eq!(seen, TierMask::TIER1 | TierMask::TIER2 | TierMask::TIER3);
  }

  #[test]
  fn mask_iterates_in_ascending_order() {
    let mask = TierMask::TIER3 | TierMask::TIER1;
    let tiers: Vec<Tier> = mask.tiers().collect();
    assert_eq!(tiers, vec![Tier::Tier1, Tier::Tier3]);
    assert!(TierMask::of(Tier::None).is_empty());
  }
}
