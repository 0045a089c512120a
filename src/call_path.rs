use std::fmt;

use ::errno::{errno, set_errno, Errno as LibErrno};
use nix::errno::Errno;

use crate::ctx::fatal;

/// The interchangeable ways of reaching the same kernel service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallPath {
    FastPath,
    Syscall,
    LibraryWrapper,
}

impl CallPath {
    pub fn label(&self) -> &'static str {
        match self {
            CallPath::FastPath => "vDSO",
            CallPath::Syscall => "system call",
            CallPath::LibraryWrapper => "libc",
        }
    }
}

impl fmt::Display for CallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Return value and errno of one call, in libc convention:
/// `ret == -1` and a non-zero errno on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallResult {
    pub ret: i64,
    pub errno: i32,
}

impl CallResult {
    pub const SUCCESS: CallResult = CallResult { ret: 0, errno: 0 };

    pub fn failed(errno: Errno) -> CallResult {
        CallResult {
            ret: -1,
            errno: errno as i32,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ret >= 0
    }

    /// Result of a raw system call made through the `syscalls` crate.
    pub fn from_raw_syscall(result: Result<usize, syscalls::Errno>) -> CallResult {
        match result {
            Ok(ret) => CallResult {
                ret: ret as i64,
                errno: 0,
            },
            Err(errno) => CallResult {
                ret: -1,
                errno: errno.into_raw(),
            },
        }
    }

    /// Result of a vDSO entry point. Some architectures hand back the
    /// negated errno instead of setting errno.
    pub fn from_vdso(ret: i64) -> CallResult {
        if ret < 0 && ret != -1 {
            CallResult {
                ret: -1,
                errno: (-ret) as i32,
            }
        } else if ret == -1 {
            CallResult { ret, errno: errno().0 }
        } else {
            CallResult { ret, errno: 0 }
        }
    }

    /// Result of a libc wrapper, reading errno the way C callers do.
    pub fn from_libc(ret: i64) -> CallResult {
        CallResult {
            ret,
            errno: if ret == -1 { errno().0 } else { 0 },
        }
    }

    /// Abort the run if the call failed. For calls the verification and
    /// benchmark loops cannot continue without.
    pub fn nofail(self, what: &str) -> CallResult {
        if !self.is_ok() {
            fatal(Errno::from_raw(self.errno), what);
        }
        self
    }
}

/// Clear errno so a stale value cannot be mistaken for this call's.
#[inline(always)]
pub fn prepare_call() {
    set_errno(LibErrno(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_syscall_errors_become_libc_convention() {
        let failed = CallResult::from_raw_syscall(Err(syscalls::Errno::EFAULT));
        assert_eq!(failed, CallResult::failed(Errno::EFAULT));
        assert!(!failed.is_ok());
        assert_eq!(CallResult::from_raw_syscall(Ok(0)), CallResult::SUCCESS);
    }

    #[test]
    fn negated_errno_from_vdso_is_normalized() {
        assert_eq!(
            CallResult::from_vdso(-(Errno::EFAULT as i64)),
            CallResult::failed(Errno::EFAULT)
        );
        assert_eq!(CallResult::from_vdso(0), CallResult::SUCCESS);
        assert_eq!(CallResult::from_vdso(7).ret, 7);
    }

    #[test]
    fn libc_convention_reads_errno() {
        set_errno(LibErrno(Errno::EINVAL as i32));
        assert_eq!(CallResult::from_libc(-1), CallResult::failed(Errno::EINVAL));
        prepare_call();
        assert_eq!(CallResult::from_libc(0), CallResult::SUCCESS);
    }

    #[test]
    fn labels() {
        assert_eq!(CallPath::FastPath.to_string(), "vDSO");
        assert_eq!(CallPath::Syscall.label(), "system call");
        assert_eq!(CallPath::LibraryWrapper.label(), "libc");
    }
}
