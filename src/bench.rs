use std::time::{Duration, Instant};

use tabled::{builder::Builder, settings::Style};

use crate::{call_path::CallPath, ctx::Ctx};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BenchInterval {
    pub calls: u64,
    pub duration: Duration,
}

impl BenchInterval {
    pub fn calls_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.calls as f64 / secs
    }

    pub fn nsecs_per_call(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.duration.as_nanos() as f64 / self.calls as f64
    }
}

/// Call `call` in a tight loop until a freshly armed timer expires.
/// Nothing is checked here, only counted.
pub fn measure(ctx: &mut Ctx, mut call: impl FnMut()) -> BenchInterval {
    let mut calls: u64 = 0;
    ctx.start_timer();
    let start = Instant::now();
    while !ctx.should_stop() {
        call();
        calls += 1;
    }
    let duration = start.elapsed();
    ctx.cleanup_timer();
    BenchInterval { calls, duration }
}

#[derive(Clone, Debug, Default)]
pub struct BenchResults {
    pub intervals: Vec<(CallPath, BenchInterval)>,
}

impl BenchResults {
    pub fn record(&mut self, path: CallPath, interval: BenchInterval) {
        self.intervals.push((path, interval));
    }

    pub fn get(&self, path: CallPath) -> Option<&BenchInterval> {
        self.intervals
            .iter()
            .find(|(recorded, _)| *recorded == path)
            .map(|(_, interval)| interval)
    }

    /// How many times faster the vDSO is than trapping into the kernel.
    pub fn speedup(&self) -> Option<f64> {
        let fast = self.get(CallPath::FastPath)?.nsecs_per_call();
        let slow = self.get(CallPath::Syscall)?.nsecs_per_call();
        if fast == 0.0 {
            return None;
        }
        Some(slow / fast)
    }

    pub fn render(&self, suite: &str) -> String {
        let mut builder = Builder::new();
        builder.push_record([suite, "calls", "seconds", "calls/sec", "ns/call"]);
        for (path, interval) in &self.intervals {
            builder.push_record([
                path.label().to_owned(),
                interval.calls.to_string(),
                format!("{:.3}", interval.duration.as_secs_f64()),
                format!("{:.0}", interval.calls_per_sec()),
                format!("{:.1}", interval.nsecs_per_call()),
            ]);
        }
        let mut table = builder.build().with(Style::ascii_rounded()).to_string();
        if let Some(speedup) = self.speedup() {
            table.push_str(&format!("\nvDSO speedup over system call: {speedup:.2}x"));
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::Settings;

    #[test]
    fn derived_rates() {
        let interval = BenchInterval {
            calls: 2_000,
            duration: Duration::from_millis(500),
        };
        assert_eq!(interval.calls_per_sec(), 4_000.0);
        assert_eq!(interval.nsecs_per_call(), 250_000.0);
        assert_eq!(BenchInterval::default().calls_per_sec(), 0.0);
        assert_eq!(BenchInterval::default().nsecs_per_call(), 0.0);
    }

    #[test]
    fn each_measurement_gets_its_own_interval() {
        let mut ctx = Ctx::new(
            "bench-test",
            Settings {
                duration: Duration::from_millis(30),
                ..Settings::default()
            },
        );
        let mut counted = 0u64;
        let first = measure(&mut ctx, || counted += 1);
        assert_eq!(first.calls, counted);
        assert!(first.duration >= Duration::from_millis(30));

        // a second run is not cut short by the first run's expired timer
        let second = measure(&mut ctx, || std::hint::black_box(()));
        assert!(second.duration >= Duration::from_millis(30));
        assert!(second.calls > 0);
    }

    #[test]
    fn speedup_needs_both_paths() {
        let mut results = BenchResults::default();
        results.record(
            CallPath::Syscall,
            BenchInterval {
                calls: 100,
                duration: Duration::from_micros(10),
            },
        );
        assert_eq!(results.speedup(), None);
        results.record(
            CallPath::FastPath,
            BenchInterval {
                calls: 1_000,
                duration: Duration::from_micros(10),
            },
        );
        assert_eq!(results.speedup(), Some(10.0));
        let table = results.render("gettimeofday");
        assert!(table.contains("vDSO"));
        assert!(table.contains("system call"));
        assert!(table.contains("10.00x"));
    }
}
