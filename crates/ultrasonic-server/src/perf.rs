use std::time::{Duration, Instant};

/// Process CPU usage sampled between calls. Linux-only; other hosts report
/// zero rather than guessing.
pub struct CpuSampler {
    last: Option<(Instant, Duration)>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// CPU percent of one core since the previous sample (so values above
    /// 100 mean more than one busy core).
    pub fn sample(&mut self) -> f32 {
        let Some(cpu) = process_cpu_time() else {
            return 0.0;
        };
        let now = Instant::now();
        let pct = match self.last {
            None => 0.0,
            Some((then, prev_cpu)) => {
                let wall = now.duration_since(then).as_secs_f32();
                if wall <= 0.0 {
                    0.0
                } else {
                    let used = cpu.saturating_sub(prev_cpu).as_secs_f32();
                    (used / wall) * 100.0
                }
            }
        };
        self.last = Some((now, cpu));
        pct
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn process_cpu_time() -> Option<Duration> {
    // utime + stime out of /proc/self/stat, fields 14 and 15. The comm field
    // may contain spaces, so split after the closing paren.
    const CLK_TCK: f64 = 100.0;
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let rest = stat.rsplit_once(')')?.1;
    let mut fields = rest.split_ascii_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(Duration::from_secs_f64(((utime + stime) as f64) / CLK_TCK))
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_time() -> Option<Duration> {
    None
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_is_readable() {
        assert!(process_cpu_time().is_some());
    }

    #[test]
    fn first_sample_is_zero_then_bounded() {
        let mut sampler = CpuSampler::new();
        assert_eq!(sampler.sample(), 0.0);
        // Burn a little CPU so the delta is measurable but small.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        let pct = sampler.sample();
        assert!(pct >= 0.0);
    }
}
