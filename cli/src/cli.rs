use clap::{builder::TypedValueParser, Parser};

#[derive(Parser, Debug)]
#[clap(name = "iothrottle", version, about = "iothrottle Command Line Utility")]
pub struct Cli {
  /// Log filter (e.g. "iothrottle=debug"); overridden by RUST_LOG
  #[clap(long, global = true, default_value = "warn")]
  pub log: String,

  #[clap(subcommand)]
  pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
  /// Print the tier an I/O would be issued at
  Classify(ClassifyArgs),
  /// Run competing workloads against one simulated device
  Simulate(SimulateArgs),
}

const POLICY_NAMES: [&str; 7] = ["unmanaged", "default", "important", "passive", "throttle", "utility", "standard"];

#[derive(Parser, Debug)]
pub struct ClassifyArgs {
  /// Declared I/O policy
  #[clap(long, short, value_parser = clap::builder::PossibleValuesParser::new(POLICY_NAMES).map(|s| s.to_lowercase()))]
  pub policy: String,

  /// Treat the I/O as a bootcache miss
  #[clap(long, action)]
  pub bootcache_miss: bool,

  /// System idle level; above zero demotes tier3 to tier2
  #[clap(long, default_value_t = 0)]
  pub idle_level: u32,
}

#[derive(Parser, Debug)]
pub struct SimulateArgs {
  /// How long to run, in milliseconds
  #[clap(long, short, default_value_t = 2_000)]
  pub duration_ms: u64,

  /// Worker threads per policy (tier0, tier1, tier2, tier3)
  #[clap(long, value_delimiter = ',', default_value = "1,1,1,2")]
  pub workers: Vec<usize>,

  /// Mean think time between I/Os per worker, in milliseconds
  #[clap(long, default_value_t = 5)]
  pub think_ms: u64,

  /// Simulated service time of one I/O, in milliseconds
  #[clap(long, default_value_t = 2)]
  pub service_ms: u64,

  /// Use the solid-state timing tables
  #[clap(long, action)]
  pub ssd: bool,

  /// Count I/Os as inflight until they complete
  #[clap(long, action)]
  pub inflight: bool,

  /// Seed for think-time jitter; random if omitted
  #[clap(long)]
  pub seed: Option<u64>,
}
