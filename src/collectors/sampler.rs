use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Two samples closer together than this reuse the previous rate.
pub const MIN_SAMPLE_WINDOW: Duration = Duration::from_millis(250);

/// Baselines untouched for this long are dropped by [`Samplers::prune`].
pub const SAMPLE_TTL: Duration = Duration::from_secs(300);

/// Family totals and single-process counters never share a baseline, even
/// when the root pid is the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKey {
    Process(u32),
    Family(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    pub at: Instant,
    pub value: f64,
    pub rate: f64,
}

/// Turns cumulative counters into per-second rates.
#[derive(Debug, Default)]
pub struct RateSampler {
    samples: Mutex<HashMap<SampleKey, CounterSample>>,
}

impl RateSampler {
    /// Records `value` and returns the rate per second since the previous
    /// sample. The first sample, and any counter that went backwards, yields 0.
    pub fn sample(&self, key: SampleKey, now: Instant, value: f64) -> f64 {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        let Some(prev) = samples.get(&key).copied() else {
            samples.insert(key, CounterSample { at: now, value, rate: 0.0 });
            return 0.0;
        };

        let elapsed = now.saturating_duration_since(prev.at);
        if elapsed < MIN_SAMPLE_WINDOW {
            return prev.rate;
        }
        if value < prev.value {
            samples.insert(key, CounterSample { at: now, value, rate: 0.0 });
            return 0.0;
        }

        let rate = (value - prev.value) / elapsed.as_secs_f64();
        samples.insert(key, CounterSample { at: now, value, rate });
        rate
    }

    pub fn prune(&self, now: Instant, max_age: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.retain(|_, s| now.saturating_duration_since(s.at) < max_age);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// One table per counter kind so CPU, network and I/O sampling never
/// contend with each other.
#[derive(Debug, Default)]
pub struct Samplers {
    pub cpu: RateSampler,
    pub net: RateSampler,
    pub io: RateSampler,
}

impl Samplers {
    /// CPU seconds per second spread over `cores`, as a percentage. Not
    /// clamped; a multi-threaded burst may exceed 100.
    pub fn cpu_percent(&self, pid: u32, now: Instant, cpu_time: Duration, cores: usize) -> f64 {
        let busy = self
            .cpu
            .sample(SampleKey::Process(pid), now, cpu_time.as_secs_f64());
        busy / cores.max(1) as f64 * 100.0
    }

    pub fn prune(&self, now: Instant) {
        self.cpu.prune(now, SAMPLE_TTL);
        self.net.prune(now, SAMPLE_TTL);
        self.io.prune(now, SAMPLE_TTL);
    }
}

pub fn bytes_to_kb(rate: f64) -> f64 {
    rate / 1024.0
}
