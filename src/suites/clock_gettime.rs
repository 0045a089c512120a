//! clock_gettime, one suite per clock id. Every operation is generic over
//! the clock so both suites share a single body.

use std::{
    ffi::{c_int, c_void},
    mem,
    sync::OnceLock,
};

use nix::{
    errno::Errno,
    libc::{clockid_t, timespec, CLOCK_MONOTONIC, CLOCK_REALTIME},
};
use syscalls::{syscall2, Sysno};

use crate::{
    abi::{run_matrix, PointerParam},
    bench::{measure, BenchResults},
    call_path::{prepare_call, CallPath, CallResult},
    ctx::Ctx,
    suite::Suite,
    verify::{ClockChecker, ClockReading, NSEC_PER_SEC},
};

type ClockGettimeFn = unsafe extern "C" fn(clock: clockid_t, ts: *mut timespec) -> c_int;

static CLOCK_GETTIME_VDSO: OnceLock<ClockGettimeFn> = OnceLock::new();

// NULL is not "not requested" here, the kernel has to write the time somewhere
const PARAMS: [PointerParam; 1] = [PointerParam::required("ts")];

const VDSO_NAMES: &[&str] = &["__kernel_clock_gettime", "__vdso_clock_gettime"];

pub static MONOTONIC: Suite = Suite {
    name: "clock-gettime-monotonic",
    bench: Some(clock_gettime_bench::<{ CLOCK_MONOTONIC }>),
    verify: Some(clock_gettime_verify::<{ CLOCK_MONOTONIC }>),
    abi: Some(clock_gettime_abi::<{ CLOCK_MONOTONIC }>),
    notes: Some(clock_gettime_notes),
    vdso_names: VDSO_NAMES,
    bind: Some(clock_gettime_bind),
};

pub static REALTIME: Suite = Suite {
    name: "clock-gettime-realtime",
    bench: Some(clock_gettime_bench::<{ CLOCK_REALTIME }>),
    verify: Some(clock_gettime_verify::<{ CLOCK_REALTIME }>),
    abi: Some(clock_gettime_abi::<{ CLOCK_REALTIME }>),
    notes: Some(clock_gettime_notes),
    vdso_names: VDSO_NAMES,
    bind: Some(clock_gettime_bind),
};

// both suites resolve the same symbol, whichever binds first wins
fn clock_gettime_bind(address: Option<usize>) {
    if let Some(address) = address {
        let function = unsafe { mem::transmute::<usize, ClockGettimeFn>(address) };
        let _ = CLOCK_GETTIME_VDSO.set(function);
    }
}

fn vdso_has_clock_gettime() -> bool {
    CLOCK_GETTIME_VDSO.get().is_some()
}

fn clock_gettime_syscall<const CLOCK: clockid_t>(ts: *mut timespec) -> CallResult {
    CallResult::from_raw_syscall(unsafe {
        syscall2(Sysno::clock_gettime, CLOCK as usize, ts as usize)
    })
}

fn clock_gettime_vdso<const CLOCK: clockid_t>(ts: *mut timespec) -> CallResult {
    prepare_call();
    match CLOCK_GETTIME_VDSO.get() {
        Some(clock_gettime) => CallResult::from_vdso(unsafe { clock_gettime(CLOCK, ts) } as i64),
        None => CallResult::failed(Errno::ENOSYS),
    }
}

fn clock_gettime_libc<const CLOCK: clockid_t>(ts: *mut timespec) -> CallResult {
    prepare_call();
    CallResult::from_libc(unsafe { nix::libc::clock_gettime(CLOCK, ts) } as i64)
}

fn reading(ts: &timespec) -> ClockReading {
    ClockReading::new(ts.tv_sec as i64, ts.tv_nsec as i64)
}

fn clock_gettime_verify<const CLOCK: clockid_t>(ctx: &mut Ctx) {
    let mut now: timespec = unsafe { mem::zeroed() };
    let mut checker = ClockChecker::new(NSEC_PER_SEC);

    clock_gettime_syscall::<CLOCK>(&mut now).nofail("SYS_clock_gettime");
    checker.seed(CallPath::Syscall, reading(&now));

    ctx.start_timer();
    while !ctx.should_stop() {
        if vdso_has_clock_gettime() {
            clock_gettime_vdso::<CLOCK>(&mut now).nofail("clock_gettime (vDSO)");
            checker.observe(ctx, CallPath::FastPath, reading(&now));
        }

        clock_gettime_libc::<CLOCK>(&mut now).nofail("clock_gettime");
        checker.observe(ctx, CallPath::LibraryWrapper, reading(&now));

        clock_gettime_syscall::<CLOCK>(&mut now).nofail("SYS_clock_gettime");
        checker.observe(ctx, CallPath::Syscall, reading(&now));
    }
    ctx.cleanup_timer();
}

fn clock_gettime_bench<const CLOCK: clockid_t>(ctx: &mut Ctx) -> BenchResults {
    let mut ts: timespec = unsafe { mem::zeroed() };
    let mut results = BenchResults::default();

    if vdso_has_clock_gettime() {
        let interval = measure(ctx, || {
            let _ = clock_gettime_vdso::<CLOCK>(&mut ts);
        });
        results.record(CallPath::FastPath, interval);
    }

    let interval = measure(ctx, || {
        let _ = clock_gettime_libc::<CLOCK>(&mut ts);
    });
    results.record(CallPath::LibraryWrapper, interval);

    let interval = measure(ctx, || {
        let _ = clock_gettime_syscall::<CLOCK>(&mut ts);
    });
    results.record(CallPath::Syscall, interval);

    results
}

fn clock_gettime_call<const CLOCK: clockid_t>(
    path: CallPath,
    args: &[*mut c_void],
) -> CallResult {
    let ts = args[0].cast::<timespec>();
    match path {
        CallPath::FastPath => clock_gettime_vdso::<CLOCK>(ts),
        _ => clock_gettime_syscall::<CLOCK>(ts),
    }
}

fn clock_gettime_abi<const CLOCK: clockid_t>(ctx: &mut Ctx) {
    let mut paths = vec![CallPath::Syscall];
    if vdso_has_clock_gettime() {
        paths.push(CallPath::FastPath);
    }
    run_matrix(ctx, "clock_gettime", &PARAMS, &paths, clock_gettime_call::<CLOCK>);
}

fn clock_gettime_notes(_ctx: &Ctx) -> Vec<String> {
    if vdso_has_clock_gettime() {
        vec![]
    } else {
        vec!["vDSO version of clock_gettime not found".to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ctx::Settings, registry::REGISTRY};
    use std::{sync::LazyLock, time::Duration};

    fn short() -> Settings {
        Settings {
            duration: Duration::from_millis(50),
            max_failures: 0,
            debug: false,
        }
    }

    #[test]
    fn both_clocks_share_one_binding() {
        LazyLock::force(&REGISTRY);
        assert_eq!(MONOTONIC.vdso_names, REALTIME.vdso_names);
        assert_eq!(
            vdso_has_clock_gettime(),
            crate::vdso::resolve(VDSO_NAMES).is_some()
        );
    }

    #[test]
    fn monotonic_paths_read_in_order() {
        LazyLock::force(&REGISTRY);
        let mut first: timespec = unsafe { mem::zeroed() };
        let mut second: timespec = unsafe { mem::zeroed() };
        clock_gettime_syscall::<CLOCK_MONOTONIC>(&mut first).nofail("SYS_clock_gettime");
        assert_eq!(
            clock_gettime_libc::<CLOCK_MONOTONIC>(&mut second),
            CallResult::SUCCESS
        );
        assert!(reading(&first).is_ordered_before(&reading(&second)));
        assert!(reading(&second).is_normalized(NSEC_PER_SEC));
    }

    #[test]
    fn monotonic_verify_finds_nothing() {
        LazyLock::force(&REGISTRY);
        let mut ctx = Ctx::new("clock-gettime-monotonic", short());
        clock_gettime_verify::<CLOCK_MONOTONIC>(&mut ctx);
        assert_eq!(ctx.failures, 0);
    }

    #[test]
    fn realtime_bench_measures_libc_and_syscall() {
        LazyLock::force(&REGISTRY);
        let mut ctx = Ctx::new("clock-gettime-realtime", short());
        let results = clock_gettime_bench::<CLOCK_REALTIME>(&mut ctx);
        assert!(results.get(CallPath::LibraryWrapper).unwrap().calls > 0);
        assert!(results.get(CallPath::Syscall).unwrap().calls > 0);
    }

    #[test]
    fn null_timespec_is_efault_on_the_syscall_path() {
        assert_eq!(
            clock_gettime_syscall::<CLOCK_MONOTONIC>(std::ptr::null_mut()),
            CallResult::failed(Errno::EFAULT)
        );
    }

    #[test]
    fn full_matrix_matches_the_abi_on_every_path() {
        LazyLock::force(&REGISTRY);
        let mut ctx = Ctx::new("clock-gettime-monotonic", short());
        clock_gettime_abi::<CLOCK_MONOTONIC>(&mut ctx);
        assert_eq!(ctx.failures, 0);
    }

    #[test]
    fn syscall_matrix_matches_kernel_behavior() {
        let mut ctx = Ctx::new("clock-gettime-monotonic", short());
        run_matrix(
            &mut ctx,
            "clock_gettime",
            &PARAMS,
            &[CallPath::Syscall],
            clock_gettime_call::<CLOCK_MONOTONIC>,
        );
        assert_eq!(ctx.failures, 0);
    }
}
