use crate::writer::{flush_buffer, write_debug, write_failure};
use nix::{
    errno::Errno,
    sched::{sched_getaffinity, CpuSet},
    unistd::Pid,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

// set from the ctrlc handler
pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub const EXIT_FAILURES: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
/// Harness-fatal exits use `FATAL_EXIT_BASE + errno`, clear of the statuses above
pub const FATAL_EXIT_BASE: i32 = 100;

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub duration: Duration,
    pub max_failures: u64,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            duration: Duration::from_secs(1),
            max_failures: 10,
            debug: false,
        }
    }
}

/// Per-run state handed to every suite operation: stop conditions,
/// failure bookkeeping, and the affinity mask the process started with.
pub struct Ctx {
    pub suite: &'static str,
    pub settings: Settings,
    pub failures: u64,
    pub cpus_allowed: CpuSet,
    expired: Option<Arc<AtomicBool>>,
}

impl Ctx {
    pub fn new(suite: &'static str, settings: Settings) -> Ctx {
        let cpus_allowed = match sched_getaffinity(Pid::from_raw(0)) {
            Ok(set) => set,
            Err(errno) => fatal(errno, "sched_getaffinity"),
        };
        Ctx {
            suite,
            settings,
            failures: 0,
            cpus_allowed,
            expired: None,
        }
    }

    /// Arm a fresh deadline `settings.duration` from now. Each call gets its
    /// own flag, so a previous interval's timer can never end this one.
    pub fn start_timer(&mut self) {
        let expired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&expired);
        let duration = self.settings.duration;
        std::thread::spawn(move || {
            std::thread::sleep(duration);
            flag.store(true, Ordering::Release);
        });
        self.expired = Some(expired);
    }

    pub fn cleanup_timer(&mut self) {
        self.expired = None;
    }

    pub fn timer_expired(&self) -> bool {
        self.expired
            .as_ref()
            .is_some_and(|expired| expired.load(Ordering::Acquire))
    }

    pub fn too_many_failures(&self) -> bool {
        self.settings.max_failures != 0 && self.failures >= self.settings.max_failures
    }

    #[inline(always)]
    pub fn should_stop(&self) -> bool {
        self.timer_expired() || INTERRUPTED.load(Ordering::Relaxed) || self.too_many_failures()
    }

    pub fn log_failure(&mut self, message: impl AsRef<str>) {
        self.failures += 1;
        write_failure(self.suite, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        if self.settings.debug {
            write_debug(self.suite, message.as_ref());
        }
    }
}

/// Abort the whole run: something the harness itself relies on failed,
/// so every check after this point would be meaningless.
pub fn fatal(errno: Errno, what: &str) -> ! {
    flush_buffer();
    eprintln!("vdsoprobe: {what}: {}", errno.desc());
    std::process::exit(fatal_status(errno))
}

pub fn fatal_status(errno: Errno) -> i32 {
    FATAL_EXIT_BASE + errno as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> Settings {
        Settings {
            duration: Duration::from_millis(20),
            max_failures: 2,
            debug: false,
        }
    }

    #[test]
    fn timer_expires_and_restarts_independently() {
        let mut ctx = Ctx::new("ctx-test", quick());
        assert!(!ctx.timer_expired());
        ctx.start_timer();
        while !ctx.should_stop() {
            std::hint::spin_loop();
        }
        assert!(ctx.timer_expired());
        ctx.start_timer();
        assert!(!ctx.timer_expired());
        ctx.cleanup_timer();
        assert!(!ctx.timer_expired());
    }

    #[test]
    fn failure_limit_stops_the_run() {
        let mut ctx = Ctx::new("ctx-test", quick());
        ctx.log_failure("first");
        assert!(!ctx.should_stop());
        ctx.log_failure("second");
        assert!(ctx.should_stop());
    }

    #[test]
    fn fatal_statuses_stay_clear_of_run_statuses() {
        assert_eq!(fatal_status(Errno::EPERM), 101);
        assert_eq!(fatal_status(Errno::ENOENT), 102);
        assert_eq!(fatal_status(Errno::UnknownErrno), FATAL_EXIT_BASE);
        for raw in 0..=133 {
            let status = fatal_status(Errno::from_raw(raw));
            assert!(status != 0 && status != EXIT_FAILURES && status != EXIT_USAGE);
            assert!(status <= 255);
        }
    }

    #[test]
    fn unlimited_failures() {
        let mut ctx = Ctx::new(
            "ctx-test",
            Settings {
                max_failures: 0,
                ..quick()
            },
        );
        for _ in 0..50 {
            ctx.log_failure("again");
        }
        assert!(!ctx.too_many_failures());
        assert_eq!(ctx.failures, 50);
    }
}
