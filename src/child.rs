//! Run a single call in a forked child so a fault it raises stays there.
//!
//! The child reports its return value and errno over a pipe and exits;
//! the parent classifies how the child ended and compares that with what
//! the caller predicted.

use std::{
    fmt,
    fs::File,
    io::{Read, Write},
};

use nix::{
    errno::Errno,
    libc,
    sys::{
        resource::{setrlimit, Resource},
        signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{fork, pipe, ForkResult},
};

use crate::{
    call_path::{prepare_call, CallResult},
    ctx::Ctx,
    writer::flush_buffer,
};

const REPORT_SIZE: usize = 12;

/// A call the parent needs to run the child failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsolationError {
    pub call: &'static str,
    pub errno: Errno,
}

impl fmt::Display for IsolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.call, self.errno.desc())
    }
}

fn failed_call(call: &'static str) -> impl FnOnce(Errno) -> IsolationError {
    move |errno| IsolationError { call, errno }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildOutcome {
    /// The call returned and the child reported its result
    Returned(CallResult),
    /// The child was killed by a signal
    Signaled(Signal),
    /// The child exited without reporting a result
    Exited(i32),
}

#[derive(Clone, Debug)]
pub struct Expected {
    pub result: CallResult,
    pub tolerated: SigSet,
    /// A normal return is a failure: one of `tolerated` has to end the child
    pub must_signal: bool,
}

impl Expected {
    pub fn returns(result: CallResult) -> Expected {
        Expected {
            result,
            tolerated: SigSet::empty(),
            must_signal: false,
        }
    }

    pub fn killed_by(signal: Signal) -> Expected {
        let mut tolerated = SigSet::empty();
        tolerated.add(signal);
        Expected {
            result: CallResult::SUCCESS,
            tolerated,
            must_signal: true,
        }
    }
}

pub fn signal_names(set: &SigSet) -> String {
    let names: Vec<&str> = set.iter().map(|signal| signal.as_str()).collect();
    if names.is_empty() {
        "no signal".to_owned()
    } else {
        names.join(" or ")
    }
}

/// Compare how the child ended with the prediction. `Err` carries a
/// description of the mismatch with both sides.
pub fn check_outcome(expected: &Expected, outcome: &ChildOutcome) -> Result<(), String> {
    match outcome {
        ChildOutcome::Signaled(signal) => {
            if expected.tolerated.contains(*signal) {
                Ok(())
            } else {
                Err(format!(
                    "terminated by unexpected signal {}\n\texpected: {}",
                    signal.as_str(),
                    describe(expected)
                ))
            }
        }
        ChildOutcome::Returned(result) => {
            if expected.must_signal {
                return Err(format!(
                    "returned {} (errno {}) instead of being killed\n\texpected: {}",
                    result.ret,
                    errno_name(result.errno),
                    describe(expected)
                ));
            }
            if result.ret != expected.result.ret {
                return Err(format!(
                    "wrong return value {}\n\texpected: {}",
                    result.ret,
                    describe(expected)
                ));
            }
            if result.errno != expected.result.errno {
                return Err(format!(
                    "wrong errno {}\n\texpected: {}",
                    errno_name(result.errno),
                    describe(expected)
                ));
            }
            Ok(())
        }
        ChildOutcome::Exited(status) => Err(format!(
            "child exited with status {status} without reporting a result"
        )),
    }
}

fn errno_name(errno: i32) -> String {
    if errno == 0 {
        "0".to_owned()
    } else {
        format!("{:?}", Errno::from_raw(errno))
    }
}

fn describe(expected: &Expected) -> String {
    if expected.must_signal {
        format!("killed by {}", signal_names(&expected.tolerated))
    } else {
        format!(
            "return {} (errno {})",
            expected.result.ret,
            errno_name(expected.result.errno)
        )
    }
}

fn encode(result: CallResult) -> [u8; REPORT_SIZE] {
    let mut report = [0u8; REPORT_SIZE];
    report[..8].copy_from_slice(&result.ret.to_ne_bytes());
    report[8..].copy_from_slice(&result.errno.to_ne_bytes());
    report
}

fn decode(report: &[u8]) -> Option<CallResult> {
    let report: &[u8; REPORT_SIZE] = report.try_into().ok()?;
    let mut ret = [0u8; 8];
    let mut errno = [0u8; 4];
    ret.copy_from_slice(&report[..8]);
    errno.copy_from_slice(&report[8..]);
    Some(CallResult {
        ret: i64::from_ne_bytes(ret),
        errno: i32::from_ne_bytes(errno),
    })
}

fn child_main(call: impl FnOnce() -> CallResult, tolerated: &SigSet, mut report: File) -> ! {
    // an expected SIGSEGV should not leave a core file behind
    let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in tolerated.iter() {
        let _ = unsafe { sigaction(signal, &default) };
    }
    let _ = tolerated.thread_unblock();

    prepare_call();
    let result = call();
    let status = match report.write_all(&encode(result)) {
        Ok(()) => 0,
        Err(_) => 2,
    };
    unsafe { libc::_exit(status) }
}

/// Perform `call` in a fresh child process and report how it ended.
/// Signals in `tolerated` get their default disposition in the child so
/// they terminate it observably.
pub fn run_isolated(
    call: impl FnOnce() -> CallResult,
    tolerated: &SigSet,
) -> Result<ChildOutcome, IsolationError> {
    flush_buffer();
    let (read_end, write_end) = pipe().map_err(failed_call("pipe"))?;
    match unsafe { fork() }.map_err(failed_call("fork"))? {
        ForkResult::Child => {
            drop(read_end);
            child_main(call, tolerated, File::from(write_end))
        }
        ForkResult::Parent { child } => {
            drop(write_end);
            let mut report = Vec::with_capacity(REPORT_SIZE);
            let _ = File::from(read_end).read_to_end(&mut report);
            let outcome = match waitpid(child, None).map_err(failed_call("waitpid"))? {
                WaitStatus::Signaled(_, signal, _) => ChildOutcome::Signaled(signal),
                WaitStatus::Exited(_, 0) => match decode(&report) {
                    Some(result) => ChildOutcome::Returned(result),
                    None => ChildOutcome::Exited(0),
                },
                WaitStatus::Exited(_, status) => ChildOutcome::Exited(status),
                _ => ChildOutcome::Exited(-1),
            };
            Ok(outcome)
        }
    }
}

/// Run `call` isolated and record a failure on `ctx` if the outcome does
/// not match `expected`.
pub fn run_as_child(
    ctx: &mut Ctx,
    desc: &str,
    call: impl FnOnce() -> CallResult,
    expected: &Expected,
) {
    ctx.debug(desc);
    let outcome = match run_isolated(call, &expected.tolerated) {
        Ok(outcome) => outcome,
        Err(error) => crate::ctx::fatal(error.errno, error.call),
    };
    if let Err(mismatch) = check_outcome(expected, &outcome) {
        ctx.log_failure(format!("{desc}: {mismatch}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_roundtrip_rejects_short_reads() {
        let result = CallResult::failed(Errno::EFAULT);
        assert_eq!(decode(&encode(result)), Some(result));
        assert_eq!(decode(&encode(result)[..5]), None);
    }

    #[test]
    fn setup_errors_name_the_failing_call() {
        let error = failed_call("pipe")(Errno::EMFILE);
        assert_eq!(
            error,
            IsolationError {
                call: "pipe",
                errno: Errno::EMFILE
            }
        );
        assert_eq!(error.to_string(), format!("pipe: {}", Errno::EMFILE.desc()));
        assert_eq!(failed_call("waitpid")(Errno::ECHILD).call, "waitpid");
    }

    #[test]
    fn normal_return_is_reported() {
        let outcome = run_isolated(|| CallResult { ret: 42, errno: 0 }, &SigSet::empty()).unwrap();
        assert_eq!(outcome, ChildOutcome::Returned(CallResult { ret: 42, errno: 0 }));
    }

    #[test]
    fn fault_in_child_is_contained() {
        let expected = Expected::killed_by(Signal::SIGSEGV);
        let outcome = run_isolated(
            || {
                let bogus = usize::MAX as *mut u8;
                unsafe { std::ptr::write_volatile(bogus, 1) };
                CallResult::SUCCESS
            },
            &expected.tolerated,
        )
        .unwrap();
        assert_eq!(outcome, ChildOutcome::Signaled(Signal::SIGSEGV));
        assert!(check_outcome(&expected, &outcome).is_ok());
    }

    #[test]
    fn unexpected_signal_is_a_mismatch() {
        let expected = Expected::returns(CallResult::SUCCESS);
        let mismatch =
            check_outcome(&expected, &ChildOutcome::Signaled(Signal::SIGSEGV)).unwrap_err();
        assert!(mismatch.contains("SIGSEGV"));
    }

    #[test]
    fn surviving_a_predicted_fault_is_a_mismatch() {
        let expected = Expected::killed_by(Signal::SIGSEGV);
        let mismatch =
            check_outcome(&expected, &ChildOutcome::Returned(CallResult::SUCCESS)).unwrap_err();
        assert!(mismatch.contains("instead of being killed"));

        let efault = ChildOutcome::Returned(CallResult::failed(Errno::EFAULT));
        assert!(check_outcome(&expected, &efault).is_err());
    }

    #[test]
    fn errno_and_return_are_compared() {
        let expected = Expected::returns(CallResult::failed(Errno::EFAULT));
        assert!(check_outcome(
            &expected,
            &ChildOutcome::Returned(CallResult::failed(Errno::EFAULT))
        )
        .is_ok());
        let wrong_errno = ChildOutcome::Returned(CallResult::failed(Errno::EINVAL));
        assert!(check_outcome(&expected, &wrong_errno)
            .unwrap_err()
            .contains("wrong errno"));
        let wrong_ret = ChildOutcome::Returned(CallResult::SUCCESS);
        assert!(check_outcome(&expected, &wrong_ret)
            .unwrap_err()
            .contains("wrong return value"));
        assert!(check_outcome(&expected, &ChildOutcome::Exited(2)).is_err());
    }
}
