use crate::cli::ClassifyArgs;
use crate::commands::parse_policy;

use anyhow::Result;
use iothrottle::{classify, ThrottleConfig};

pub fn run(args: ClassifyArgs) -> Result<()> {
  let policy = parse_policy(&args.policy)?;
  let tier = classify(policy, args.bootcache_miss, args.idle_level);

  println!("policy:     {:?} ({})", policy, policy.as_raw());
  println!("tier:       {} ({})", tier, tier.as_raw());
  if policy.is_passive() {
    println!("passive:    yes (opens no throttle window)");
  }
  if !tier.is_throttleable() {
    println!("throttled:  never");
    return Ok(());
  }

  let config = ThrottleConfig::default();
  let ms = |d: std::time::Duration| d.as_millis();
  println!("throttled:  while a stricter tier was active within its window");
  println!(
    "window:     {}ms rotational, {}ms solid-state",
    ms(config.windows_for(false).get(tier)),
    ms(config.windows_for(true).get(tier))
  );
  println!(
    "period:     {}ms rotational, {}ms solid-state",
    ms(config.periods_for(false).get(tier)),
    ms(config.periods_for(true).get(tier))
  );
  Ok(())
}
