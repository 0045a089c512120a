use std::{
    ffi::{c_int, c_void},
    mem,
    ptr::null_mut,
    sync::OnceLock,
};

use nix::{errno::Errno, libc::timeval};
use syscalls::{syscall2, Sysno};

use crate::{
    abi::{run_matrix, PointerParam},
    bench::{measure, BenchResults},
    call_path::{prepare_call, CallPath, CallResult},
    ctx::Ctx,
    suite::Suite,
    verify::{ClockChecker, ClockReading, USEC_PER_SEC},
};

type GettimeofdayFn = unsafe extern "C" fn(tv: *mut timeval, tz: *mut c_void) -> c_int;

static GETTIMEOFDAY_VDSO: OnceLock<GettimeofdayFn> = OnceLock::new();

const PARAMS: [PointerParam; 2] = [PointerParam::nullable("tv"), PointerParam::nullable("tz")];

pub static SUITE: Suite = Suite {
    name: "gettimeofday",
    bench: Some(gettimeofday_bench),
    verify: Some(gettimeofday_verify),
    abi: Some(gettimeofday_abi),
    notes: Some(gettimeofday_notes),
    vdso_names: &["__kernel_gettimeofday", "__vdso_gettimeofday"],
    bind: Some(gettimeofday_bind),
};

fn gettimeofday_bind(address: Option<usize>) {
    if let Some(address) = address {
        let function = unsafe { mem::transmute::<usize, GettimeofdayFn>(address) };
        let _ = GETTIMEOFDAY_VDSO.set(function);
    }
}

fn vdso_has_gettimeofday() -> bool {
    GETTIMEOFDAY_VDSO.get().is_some()
}

fn gettimeofday_syscall(tv: *mut timeval, tz: *mut c_void) -> CallResult {
    CallResult::from_raw_syscall(unsafe { syscall2(Sysno::gettimeofday, tv as usize, tz as usize) })
}

fn gettimeofday_vdso(tv: *mut timeval, tz: *mut c_void) -> CallResult {
    prepare_call();
    match GETTIMEOFDAY_VDSO.get() {
        Some(gettimeofday) => CallResult::from_vdso(unsafe { gettimeofday(tv, tz) } as i64),
        None => CallResult::failed(Errno::ENOSYS),
    }
}

fn gettimeofday_libc(tv: *mut timeval, tz: *mut c_void) -> CallResult {
    prepare_call();
    CallResult::from_libc(unsafe { nix::libc::gettimeofday(tv, tz.cast()) } as i64)
}

fn reading(tv: &timeval) -> ClockReading {
    ClockReading::new(tv.tv_sec as i64, tv.tv_usec as i64)
}

fn gettimeofday_verify(ctx: &mut Ctx) {
    let mut now: timeval = unsafe { mem::zeroed() };
    let mut checker = ClockChecker::new(USEC_PER_SEC);

    gettimeofday_syscall(&mut now, null_mut()).nofail("SYS_gettimeofday");
    checker.seed(CallPath::Syscall, reading(&now));

    ctx.start_timer();
    while !ctx.should_stop() {
        if vdso_has_gettimeofday() {
            gettimeofday_vdso(&mut now, null_mut()).nofail("gettimeofday (vDSO)");
            checker.observe(ctx, CallPath::FastPath, reading(&now));
        }

        gettimeofday_libc(&mut now, null_mut()).nofail("gettimeofday");
        checker.observe(ctx, CallPath::LibraryWrapper, reading(&now));

        gettimeofday_syscall(&mut now, null_mut()).nofail("SYS_gettimeofday");
        checker.observe(ctx, CallPath::Syscall, reading(&now));
    }
    ctx.cleanup_timer();
}

fn gettimeofday_bench(ctx: &mut Ctx) -> BenchResults {
    let mut tv: timeval = unsafe { mem::zeroed() };
    let mut results = BenchResults::default();

    if vdso_has_gettimeofday() {
        let interval = measure(ctx, || {
            let _ = gettimeofday_vdso(&mut tv, null_mut());
        });
        results.record(CallPath::FastPath, interval);
    }

    let interval = measure(ctx, || {
        let _ = gettimeofday_libc(&mut tv, null_mut());
    });
    results.record(CallPath::LibraryWrapper, interval);

    let interval = measure(ctx, || {
        let _ = gettimeofday_syscall(&mut tv, null_mut());
    });
    results.record(CallPath::Syscall, interval);

    results
}

fn gettimeofday_abi(ctx: &mut Ctx) {
    let mut paths = vec![CallPath::Syscall];
    if vdso_has_gettimeofday() {
        paths.push(CallPath::FastPath);
    }
    run_matrix(ctx, "gettimeofday", &PARAMS, &paths, |path, args| {
        let (tv, tz) = (args[0].cast::<timeval>(), args[1]);
        match path {
            CallPath::FastPath => gettimeofday_vdso(tv, tz),
            _ => gettimeofday_syscall(tv, tz),
        }
    });
}

fn gettimeofday_notes(_ctx: &Ctx) -> Vec<String> {
    if vdso_has_gettimeofday() {
        vec![]
    } else {
        vec!["vDSO version of gettimeofday not found".to_owned()]
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
    fn every_path_reads_the_same_clock() {
        LazyLock::force(&REGISTRY);
        let mut before: timeval = unsafe { mem::zeroed() };
        let mut after: timeval = unsafe { mem::zeroed() };
        gettimeofday_syscall(&mut before, null_mut()).nofail("SYS_gettimeofday");
        assert_eq!(gettimeofday_libc(&mut after, null_mut()), CallResult::SUCCESS);
        assert!(reading(&before).is_ordered_before(&reading(&after)));
        if vdso_has_gettimeofday() {
            let mut fast: timeval = unsafe { mem::zeroed() };
            assert_eq!(gettimeofday_vdso(&mut fast, null_mut()), CallResult::SUCCESS);
            assert!(reading(&after).is_ordered_before(&reading(&fast)));
        } else {
            assert_eq!(
                gettimeofday_vdso(&mut after, null_mut()),
                CallResult::failed(Errno::ENOSYS)
            );
        }
    }

    #[test]
    fn verify_finds_nothing_on_a_sane_kernel() {
        LazyLock::force(&REGISTRY);
        let mut ctx = Ctx::new("gettimeofday", short());
        gettimeofday_verify(&mut ctx);
        assert_eq!(ctx.failures, 0);
    }

    #[test]
    fn bench_measures_every_available_path() {
        LazyLock::force(&REGISTRY);
        let mut ctx = Ctx::new("gettimeofday", short());
        let results = gettimeofday_bench(&mut ctx);
        assert!(results.get(CallPath::Syscall).unwrap().calls > 0);
        assert!(results.get(CallPath::LibraryWrapper).unwrap().calls > 0);
        assert_eq!(
            results.get(CallPath::FastPath).is_some(),
            vdso_has_gettimeofday()
        );
    }

    #[test]
    fn full_matrix_matches_the_abi_on_every_path() {
        LazyLock::force(&REGISTRY);
        let mut ctx = Ctx::new("gettimeofday", short());
        gettimeofday_abi(&mut ctx);
        assert_eq!(ctx.failures, 0);
    }

    #[test]
    fn notes_mention_a_missing_vdso() {
        LazyLock::force(&REGISTRY);
        let ctx = Ctx::new("gettimeofday", short());
        assert_eq!(gettimeofday_notes(&ctx).is_empty(), vdso_has_gettimeofday());
    }
}
