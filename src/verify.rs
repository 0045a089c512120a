//! Building blocks shared by the verification loops: clock invariants that
//! span every call path, and the affinity juggling that forces the calling
//! thread from one CPU to another.

use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use rustix::rand::{getrandom, GetRandomFlags};

use crate::{
    call_path::CallPath,
    ctx::{fatal, Ctx},
};

pub const USEC_PER_SEC: i64 = 1_000_000;
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Upper bound (exclusive) on the number of calls made between migrations.
pub const MAX_BURST: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockReading {
    pub secs: i64,
    pub subsec: i64,
}

impl ClockReading {
    pub fn new(secs: i64, subsec: i64) -> ClockReading {
        ClockReading { secs, subsec }
    }

    pub fn is_normalized(&self, subsec_max: i64) -> bool {
        self.secs >= 0 && self.subsec >= 0 && self.subsec < subsec_max
    }

    pub fn is_ordered_before(&self, later: &ClockReading) -> bool {
        (self.secs, self.subsec) <= (later.secs, later.subsec)
    }
}

/// Tracks the last reading from any call path, so ordering is checked
/// across paths in the exact order the calls were made.
#[derive(Debug)]
pub struct ClockChecker {
    subsec_max: i64,
    previous: Option<(CallPath, ClockReading)>,
}

impl ClockChecker {
    pub fn new(subsec_max: i64) -> ClockChecker {
        ClockChecker {
            subsec_max,
            previous: None,
        }
    }

    /// Seed the checker with a reading that itself goes unchecked.
    pub fn seed(&mut self, path: CallPath, reading: ClockReading) {
        self.previous = Some((path, reading));
    }

    pub fn check(&mut self, path: CallPath, reading: ClockReading) -> Vec<String> {
        let mut violations = Vec::new();
        if !reading.is_normalized(self.subsec_max) {
            violations.push(format!(
                "timestamp obtained from {path} not normalized:\n\t[{}, {}]",
                reading.secs, reading.subsec
            ));
        }
        if let Some((previous_path, previous)) = self.previous {
            if !previous.is_ordered_before(&reading) {
                violations.push(format!(
                    "timestamp obtained from {path} predates timestamp\n\
                     previously obtained from {previous_path}:\n\
                     \t[{}, {}] ({previous_path})\n\
                     \t[{}, {}] ({path})",
                    previous.secs, previous.subsec, reading.secs, reading.subsec
                ));
            }
        }
        self.previous = Some((path, reading));
        violations
    }

    /// Check `reading` and record every violation against `ctx`.
    pub fn observe(&mut self, ctx: &mut Ctx, path: CallPath, reading: ClockReading) {
        for violation in self.check(path, reading) {
            ctx.log_failure(violation);
        }
    }
}

pub fn cpus_in(set: &CpuSet) -> Vec<usize> {
    (0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect()
}

pub fn single_cpu(cpu: usize) -> Option<CpuSet> {
    let mut set = CpuSet::new();
    set.set(cpu).ok()?;
    Some(set)
}

/// The mask that moves the thread off `current`: `allowed` without
/// `current`, or the full default mask once nothing would be left.
pub fn next_affinity(allowed: CpuSet, current: usize, default: &CpuSet) -> CpuSet {
    let mut next = allowed;
    let _ = next.unset(current);
    if cpus_in(&next).is_empty() {
        *default
    } else {
        next
    }
}

pub fn set_thread_affinity(set: &CpuSet) {
    // pid 0 is the calling thread
    if let Err(errno) = sched_setaffinity(Pid::from_raw(0), set) {
        fatal(errno, "sched_setaffinity");
    }
}

/// Force the calling thread onto a different CPU and return the mask it
/// is now confined to.
pub fn migrate(ctx: &mut Ctx, allowed: CpuSet, current: usize) -> CpuSet {
    if !allowed.is_set(current).unwrap_or(false) {
        ctx.log_failure(format!(
            "running on cpu {current}, outside the affinity mask {:?}",
            cpus_in(&allowed)
        ));
    }
    let next = next_affinity(allowed, current, &ctx.cpus_allowed);
    set_thread_affinity(&next);
    ctx.debug(format!("migrating off cpu {current} to {:?}", cpus_in(&next)));
    next
}

/// Random number of calls to make before the next migration.
pub fn burst_len() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom(&mut bytes, GetRandomFlags::empty()) {
        Ok(8) => u64::from_ne_bytes(bytes) % MAX_BURST,
        _ => MAX_BURST / 2,
    }
}
