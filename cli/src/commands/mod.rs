pub mod classify;
pub mod simulate;

use anyhow::{bail, Result};
use iothrottle::IoPolicy;

/// Maps a policy name accepted on the command line.
pub(crate) fn parse_policy(name: &str) -> Result<IoPolicy> {
  let policy = match name {
    "unmanaged" => IoPolicy::Unmanaged,
    "default" => IoPolicy::Default,
    "important" => IoPolicy::Important,
    "passive" => IoPolicy::Passive,
    "throttle" => IoPolicy::Throttle,
    "utility" => IoPolicy::Utility,
    "standard" => IoPolicy::Standard,
    other => bail!("unknown I/O policy '{}'", other),
  };
  Ok(policy)
}
