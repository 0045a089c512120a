use std::{
    ffi::{c_int, c_uint, c_void},
    mem,
    ptr::null_mut,
    sync::OnceLock,
};

use nix::{errno::Errno, sched::CpuSet};
use syscalls::{syscall3, Sysno};

use crate::{
    abi::{run_matrix, PointerParam},
    bench::{measure, BenchResults},
    call_path::{prepare_call, CallPath, CallResult},
    ctx::{fatal, Ctx},
    suite::Suite,
    verify::{burst_len, cpus_in, migrate, set_thread_affinity, single_cpu},
};

type GetcpuFn =
    unsafe extern "C" fn(cpu: *mut c_uint, node: *mut c_uint, tcache: *mut c_void) -> c_int;

static GETCPU_VDSO: OnceLock<GetcpuFn> = OnceLock::new();

const PARAMS: [PointerParam; 2] = [PointerParam::nullable("cpu"), PointerParam::nullable("node")];

pub static SUITE: Suite = Suite {
    name: "getcpu",
    bench: Some(getcpu_bench),
    verify: Some(getcpu_verify),
    abi: Some(getcpu_abi),
    notes: Some(getcpu_notes),
    vdso_names: &["__kernel_getcpu", "__vdso_getcpu"],
    bind: Some(getcpu_bind),
};

fn getcpu_bind(address: Option<usize>) {
    if let Some(address) = address {
        let function = unsafe { mem::transmute::<usize, GetcpuFn>(address) };
        let _ = GETCPU_VDSO.set(function);
    }
}

fn vdso_has_getcpu() -> bool {
    GETCPU_VDSO.get().is_some()
}

// tcache has been ignored by the kernel since 2.6.24, always pass NULL
fn getcpu_syscall(cpu: *mut c_uint, node: *mut c_uint) -> CallResult {
    CallResult::from_raw_syscall(unsafe { syscall3(Sysno::getcpu, cpu as usize, node as usize, 0) })
}

fn getcpu_vdso(cpu: *mut c_uint, node: *mut c_uint) -> CallResult {
    prepare_call();
    match GETCPU_VDSO.get() {
        Some(getcpu) => CallResult::from_vdso(unsafe { getcpu(cpu, node, null_mut()) } as i64),
        None => CallResult::failed(Errno::ENOSYS),
    }
}

/// The fast path where there is one, the system call otherwise.
fn getcpu_fast(cpu: *mut c_uint, node: *mut c_uint) -> CallResult {
    if vdso_has_getcpu() {
        getcpu_vdso(cpu, node)
    } else {
        getcpu_syscall(cpu, node)
    }
}

fn current_cpu_nofail() -> usize {
    let mut cpu: c_uint = 0;
    getcpu_syscall(&mut cpu, null_mut()).nofail("SYS_getcpu");
    cpu as usize
}

/// Pin the calling thread to the CPU it is running on and return that mask.
fn getcpu_setup() -> CpuSet {
    let cpu = current_cpu_nofail();
    let Some(pinned) = single_cpu(cpu) else {
        fatal(Errno::EINVAL, "CPU_SET");
    };
    set_thread_affinity(&pinned);
    pinned
}

fn cpu_violation(path: CallPath, cpu: usize, allowed: &CpuSet) -> Option<String> {
    if allowed.is_set(cpu).unwrap_or(false) {
        None
    } else {
        Some(format!(
            "getcpu via {path} returned cpu {cpu}, outside the allowed set {:?}",
            cpus_in(allowed)
        ))
    }
}

fn check_cpu(ctx: &mut Ctx, path: CallPath, cpu: c_uint, allowed: &CpuSet) {
    if let Some(violation) = cpu_violation(path, cpu as usize, allowed) {
        ctx.log_failure(violation);
    }
}

fn getcpu_verify(ctx: &mut Ctx) {
    let mut allowed = getcpu_setup();

    ctx.start_timer();
    while !ctx.should_stop() {
        allowed = migrate(ctx, allowed, current_cpu_nofail());
        let burst = burst_len();
        ctx.debug(format!("burst of {burst} calls"));

        let mut calls = 0;
        while calls < burst && !ctx.should_stop() {
            let mut cpu: c_uint = 0;

            getcpu_fast(&mut cpu, null_mut()).nofail("getcpu");
            check_cpu(ctx, CallPath::FastPath, cpu, &allowed);

            getcpu_syscall(&mut cpu, null_mut()).nofail("SYS_getcpu");
            check_cpu(ctx, CallPath::Syscall, cpu, &allowed);

            calls += 1;
        }
    }
    ctx.cleanup_timer();

    set_thread_affinity(&ctx.cpus_allowed);
}

fn getcpu_bench(ctx: &mut Ctx) -> BenchResults {
    let mut cpu: c_uint = 0;
    let mut results = BenchResults::default();

    getcpu_setup();

    let interval = measure(ctx, || {
        let _ = getcpu_fast(&mut cpu, null_mut());
    });
    results.record(CallPath::FastPath, interval);

    let interval = measure(ctx, || {
        let _ = getcpu_syscall(&mut cpu, null_mut());
    });
    results.record(CallPath::Syscall, interval);

    set_thread_affinity(&ctx.cpus_allowed);
    results
}

fn getcpu_call(path: CallPath, args: &[*mut c_void]) -> CallResult {
    let (cpu, node) = (args[0].cast::<c_uint>(), args[1].cast::<c_uint>());
    match path {
        CallPath::FastPath => getcpu_vdso(cpu, node),
        _ => getcpu_syscall(cpu, node),
    }
}

fn getcpu_abi(ctx: &mut Ctx) {
    let mut paths = vec![CallPath::Syscall];
    if vdso_has_getcpu() {
        paths.push(CallPath::FastPath);
    }
    run_matrix(ctx, "getcpu", &PARAMS, &paths, getcpu_call);
}

fn getcpu_notes(_ctx: &Ctx) -> Vec<String> {
    let mut notes = Vec::new();
    if !vdso_has_getcpu() {
        notes.push(
            "vDSO version of getcpu not found, timing the system call in its place".to_owned(),
        );
    }
    if num_cpus::get() < 2 {
        notes.push("only one CPU available, migration cannot move the thread".to_owned());
    }
    notes
}
