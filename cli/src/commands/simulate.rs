use crate::cli::SimulateArgs;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as AnyhowContext, Result};
use iothrottle::{
  Admission, DeviceIdentity, IoPolicy, IoRequest, ThrottleConfig, ThrottleHandle, Throttler, Tier, TrackingMode,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const POLICIES: [IoPolicy; 4] = [IoPolicy::Important, IoPolicy::Standard, IoPolicy::Utility, IoPolicy::Throttle];
const READ_RATIO: f64 = 0.7;

#[derive(Debug, Default, Clone)]
struct WorkerStats {
  ios: u64,
  delayed: u64,
  wait_cycles: u64,
  total_latency: Duration,
  max_latency: Duration,
}

impl WorkerStats {
  fn record(&mut self, admission: &Admission, latency: Duration) {
    self.ios += 1;
    if admission.must_delay {
      self.delayed += 1;
    }
    self.wait_cycles += u64::from(admission.wait_cycles);
    self.total_latency += latency;
    self.max_latency = self.max_latency.max(latency);
  }

  fn merge(&mut self, other: &WorkerStats) {
    self.ios += other.ios;
    self.delayed += other.delayed;
    self.wait_cycles += other.wait_cycles;
    self.total_latency += other.total_latency;
    self.max_latency = self.max_latency.max(other.max_latency);
  }

  fn mean_latency(&self) -> Duration {
    match u32::try_from(self.ios) {
      Ok(0) | Err(_) => Duration::ZERO,
      Ok(n) => self.total_latency / n,
    }
  }
}

struct WorkerPlan {
  policy: IoPolicy,
  deadline: Instant,
  think: Duration,
  service: Duration,
  seed: u64,
}

fn worker(throttler: Throttler, handle: ThrottleHandle, plan: WorkerPlan) -> WorkerStats {
  let mut rng = StdRng::seed_from_u64(plan.seed);
  let caller = throttler.caller(plan.policy);
  let max_think = plan.think.as_micros() as u64 * 2;
  let mut stats = WorkerStats::default();

  while Instant::now() < plan.deadline {
    thread::sleep(Duration::from_micros(rng.random_range(0..=max_think)));
    let request = if rng.random_bool(READ_RATIO) {
      IoRequest::read()
    } else {
      IoRequest::write()
    };

    let started = Instant::now();
    let admission = throttler.submit_to(&caller, &handle, request);
    let latency = started.elapsed();

    thread::sleep(plan.service);
    if admission.inflight_tracked {
      throttler.complete_on(&handle, admission.tier);
    }
    stats.record(&admission, latency);
  }

  throttler.reset_caller_window(&caller);
  stats
}

pub fn run(args: SimulateArgs) -> Result<()> {
  if args.workers.len() != POLICIES.len() {
    bail!("--workers takes {} counts (tier0,tier1,tier2,tier3)", POLICIES.len());
  }

  let config = ThrottleConfig {
    tracking: if args.inflight {
      TrackingMode::InFlight
    } else {
      TrackingMode::AtIssue
    },
    ..ThrottleConfig::default()
  };
  let throttler = Throttler::new(config).context("Failed to start throttler")?;
  let handle = throttler
    .registry()
    .lookup(DeviceIdentity::Unit(0))
    .context("Failed to allocate device state")?;
  handle.set_solid_state(args.ssd);

  let base_seed = args.seed.unwrap_or_else(rand::random);
  let deadline = Instant::now() + Duration::from_millis(args.duration_ms);
  tracing::info!(seed = base_seed, duration_ms = args.duration_ms, ssd = args.ssd, "Simulation started");

  let mut workers = Vec::new();
  for (slot, (&policy, &count)) in POLICIES.iter().zip(&args.workers).enumerate() {
    for n in 0..count {
      let plan = WorkerPlan {
        policy,
        deadline,
        think: Duration::from_millis(args.think_ms),
        service: Duration::from_millis(args.service_ms),
        seed: base_seed ^ (((slot as u64) << 32) | n as u64),
      };
      let t = throttler.clone();
      let h = handle.clone();
      let join = thread::Builder::new()
        .name(format!("sim-tier{}-{}", slot, n))
        .spawn(move || worker(t, h, plan))
        .context("Failed to spawn worker thread")?;
      workers.push((slot, join));
    }
  }

  let mut per_tier = vec![WorkerStats::default(); POLICIES.len()];
  for (slot, join) in workers {
    match join.join() {
      Ok(stats) => per_tier[slot].merge(&stats),
      Err(_) => bail!("worker thread for tier{} panicked", slot),
    }
  }

  println!("seed: {}", base_seed);
  println!(
    "{:<6} {:>7} {:>7} {:>8} {:>7} {:>12} {:>12}",
    "tier", "workers", "ios", "delayed", "cycles", "mean-wait", "max-wait"
  );
  for (slot, stats) in per_tier.iter().enumerate() {
    println!(
      "{:<6} {:>7} {:>7} {:>8} {:>7} {:>12} {:>12}",
      format!("tier{}", slot),
      args.workers[slot],
      stats.ios,
      stats.delayed,
      stats.wait_cycles,
      format!("{:?}", stats.mean_latency()),
      format!("{:?}", stats.max_latency)
    );
  }

  let snapshot = handle.snapshot();
  println!();
  println!(
    "device {}: {} throttleable I/Os, {} periods, timer {:?}",
    snapshot.key, snapshot.io_count, snapshot.period_number, snapshot.timer
  );
  for tier in Tier::TRACKED {
    if let Some(t) = snapshot.tier(tier) {
      println!(
        "  {}: reads={} writes={} caused-waits={} wakes={}",
        t.tier, t.reads, t.writes, t.waits_caused, t.wakes
      );
    }
  }

  drop(handle);
  throttler.shutdown();
  Ok(())
}
