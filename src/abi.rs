//! Argument-boundary checks: every combination of pointer validity classes
//! is passed to the system call and to the vDSO, each call in its own
//! child, and the outcome compared with what the ABI promises.

use std::{ffi::c_void, fmt, num::NonZeroUsize, ptr::NonNull};

use nix::{
    errno::Errno,
    sys::{
        mman::{mmap_anonymous, munmap, MapFlags, ProtFlags},
        signal::Signal,
    },
};

use crate::{
    call_path::{CallPath, CallResult},
    child::{run_as_child, Expected},
    ctx::{fatal, Ctx},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgumentClass {
    /// Freshly allocated, writable
    Valid,
    Null,
    /// The very end of the address space, never mapped
    Bogus,
    /// A mapped page with no access at all
    ProtNone,
    /// A mapped page that can only be read
    ProtRead,
}

impl ArgumentClass {
    pub const ALL: [ArgumentClass; 5] = [
        ArgumentClass::Valid,
        ArgumentClass::Null,
        ArgumentClass::Bogus,
        ArgumentClass::ProtNone,
        ArgumentClass::ProtRead,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ArgumentClass::Valid => "valid",
            ArgumentClass::Null => "NULL",
            ArgumentClass::Bogus => "UINTPTR_MAX",
            ArgumentClass::ProtNone => "page (PROT_NONE)",
            ArgumentClass::ProtRead => "page (PROT_READ)",
        }
    }

    /// Whether writing through a pointer of this class must fault,
    /// for parameters where NULL means "not requested".
    pub const fn should_fault(&self) -> bool {
        match self {
            ArgumentClass::Valid | ArgumentClass::Null => false,
            ArgumentClass::Bogus | ArgumentClass::ProtNone | ArgumentClass::ProtRead => true,
        }
    }
}

impl fmt::Display for ArgumentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A pointer parameter of the function under test.
#[derive(Clone, Copy, Debug)]
pub struct PointerParam {
    pub name: &'static str,
    /// NULL is accepted and means the output is not wanted
    pub nullable: bool,
}

impl PointerParam {
    pub const fn nullable(name: &'static str) -> PointerParam {
        PointerParam {
            name,
            nullable: true,
        }
    }

    pub const fn required(name: &'static str) -> PointerParam {
        PointerParam {
            name,
            nullable: false,
        }
    }

    pub fn should_fault(&self, class: ArgumentClass) -> bool {
        class.should_fault() || (!self.nullable && class == ArgumentClass::Null)
    }
}

/// True when at least one argument of the call is expected to fault.
pub fn args_should_fault(params: &[PointerParam], classes: &[ArgumentClass]) -> bool {
    params
        .iter()
        .zip(classes)
        .any(|(param, class)| param.should_fault(*class))
}

/// Every combination of argument classes for `arity` pointer parameters.
pub fn combinations(arity: usize) -> Vec<Vec<ArgumentClass>> {
    let mut combos = vec![Vec::with_capacity(arity)];
    for _ in 0..arity {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                ArgumentClass::ALL.iter().map(move |class| {
                    let mut combo = prefix.clone();
                    combo.push(*class);
                    combo
                })
            })
            .collect();
    }
    combos
}

/// Backing storage for one pointer argument, released on drop.
pub enum ArgBuffer {
    Heap(Vec<u64>),
    Null,
    Bogus,
    Page(NonNull<c_void>),
}

impl ArgBuffer {
    pub fn alloc(class: ArgumentClass) -> ArgBuffer {
        match class {
            ArgumentClass::Valid => ArgBuffer::Heap(vec![0u64; page_size::get() / 8]),
            ArgumentClass::Null => ArgBuffer::Null,
            ArgumentClass::Bogus => ArgBuffer::Bogus,
            ArgumentClass::ProtNone => ArgBuffer::Page(alloc_page(ProtFlags::PROT_NONE)),
            ArgumentClass::ProtRead => ArgBuffer::Page(alloc_page(ProtFlags::PROT_READ)),
        }
    }

    pub fn as_ptr(&mut self) -> *mut c_void {
        match self {
            ArgBuffer::Heap(buffer) => buffer.as_mut_ptr().cast(),
            ArgBuffer::Null => std::ptr::null_mut(),
            ArgBuffer::Bogus => usize::MAX as *mut c_void,
            ArgBuffer::Page(page) => page.as_ptr(),
        }
    }
}

impl Drop for ArgBuffer {
    fn drop(&mut self) {
        if let ArgBuffer::Page(page) = self {
            if let Err(errno) = unsafe { munmap(*page, page_size::get()) } {
                fatal(errno, "munmap");
            }
        }
    }
}

fn alloc_page(prot: ProtFlags) -> NonNull<c_void> {
    let Some(len) = NonZeroUsize::new(page_size::get()) else {
        fatal(Errno::EINVAL, "page size");
    };
    match unsafe {
        mmap_anonymous(
            None,
            len,
            prot,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    } {
        Ok(page) => page,
        Err(errno) => fatal(errno, "mmap"),
    }
}

/// What a call through `path` has to do when its arguments do (or do not)
/// include a faulting pointer. The kernel validates user pointers and
/// returns EFAULT; the vDSO dereferences them in-process and takes SIGSEGV.
pub fn expected_outcome(path: CallPath, faults: bool) -> Expected {
    match (path, faults) {
        (_, false) => Expected::returns(CallResult::SUCCESS),
        (CallPath::Syscall, true) => Expected::returns(CallResult::failed(Errno::EFAULT)),
        (CallPath::FastPath | CallPath::LibraryWrapper, true) => {
            Expected::killed_by(Signal::SIGSEGV)
        }
    }
}

/// `gettimeofday(tv: NULL, tz: page (PROT_NONE)) (vDSO)`
pub fn describe_cell(
    function: &str,
    params: &[PointerParam],
    classes: &[ArgumentClass],
    path: CallPath,
) -> String {
    let args: Vec<String> = params
        .iter()
        .zip(classes)
        .map(|(param, class)| format!("{}: {class}", param.name))
        .collect();
    format!("{function}({}) ({path})", args.join(", "))
}

/// Run the whole matrix for a function with pointer parameters `params`.
/// `call` performs the call through the given path with the given
/// pointers; it runs only inside the isolated child.
pub fn run_matrix(
    ctx: &mut Ctx,
    function: &str,
    params: &[PointerParam],
    paths: &[CallPath],
    call: impl Fn(CallPath, &[*mut c_void]) -> CallResult,
) {
    for classes in combinations(params.len()) {
        if ctx.should_stop() {
            break;
        }
        let mut buffers: Vec<ArgBuffer> =
            classes.iter().map(|&class| ArgBuffer::alloc(class)).collect();
        let pointers: Vec<*mut c_void> = buffers.iter_mut().map(ArgBuffer::as_ptr).collect();
        let faults = args_should_fault(params, &classes);

        for &path in paths {
            let expected = expected_outcome(path, faults);
            let desc = describe_cell(function, params, &classes, path);
            run_as_child(ctx, &desc, || call(path, &pointers), &expected);
        }
        // buffers are released here, after every child for this cell was reaped
        drop(buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::Settings;
    use proptest::prelude::*;

    const TV_TZ: [PointerParam; 2] = [PointerParam::nullable("tv"), PointerParam::nullable("tz")];

    #[test]
    fn fault_classes() {
        assert!(!ArgumentClass::Valid.should_fault());
        assert!(!ArgumentClass::Null.should_fault());
        assert!(ArgumentClass::Bogus.should_fault());
        assert!(ArgumentClass::ProtNone.should_fault());
        assert!(ArgumentClass::ProtRead.should_fault());
    }

    #[test]
    fn required_pointer_faults_on_null() {
        let ts = PointerParam::required("ts");
        assert!(ts.should_fault(ArgumentClass::Null));
        assert!(!ts.should_fault(ArgumentClass::Valid));
    }

    #[test]
    fn matrix_is_the_full_cross_product() {
        let cells = combinations(2);
        assert_eq!(cells.len(), 25);
        let unique: std::collections::HashSet<_> = cells.iter().collect();
        assert_eq!(unique.len(), 25);
        assert_eq!(combinations(1).len(), 5);
        assert_eq!(combinations(0), vec![Vec::<ArgumentClass>::new()]);
    }

    #[test]
    fn null_and_prot_none_cell() {
        let classes = [ArgumentClass::Null, ArgumentClass::ProtNone];
        assert!(args_should_fault(&TV_TZ, &classes));

        let syscall = expected_outcome(CallPath::Syscall, true);
        assert_eq!(syscall.result, CallResult { ret: -1, errno: Errno::EFAULT as i32 });
        assert!(!syscall.must_signal);
        assert!(!syscall.tolerated.contains(Signal::SIGSEGV));

        let vdso = expected_outcome(CallPath::FastPath, true);
        assert!(vdso.must_signal);
        assert!(vdso.tolerated.contains(Signal::SIGSEGV));

        assert_eq!(
            describe_cell("gettimeofday", &TV_TZ, &classes, CallPath::FastPath),
            "gettimeofday(tv: NULL, tz: page (PROT_NONE)) (vDSO)"
        );
    }

    #[test]
    fn non_faulting_cells_expect_success_everywhere() {
        for path in [CallPath::Syscall, CallPath::FastPath] {
            let expected = expected_outcome(path, false);
            assert_eq!(expected.result, CallResult::SUCCESS);
            assert!(!expected.must_signal);
        }
    }

    #[test]
    fn buffers_point_where_their_class_says() {
        let page = page_size::get();
        let mut valid = ArgBuffer::alloc(ArgumentClass::Valid);
        let pointer = valid.as_ptr();
        assert!(!pointer.is_null());
        assert_eq!(pointer as usize % 8, 0);
        unsafe { std::ptr::write_bytes(pointer.cast::<u8>(), 0xa5, page) };

        assert!(ArgBuffer::alloc(ArgumentClass::Null).as_ptr().is_null());
        assert_eq!(ArgBuffer::alloc(ArgumentClass::Bogus).as_ptr() as usize, usize::MAX);

        let mut read_only = ArgBuffer::alloc(ArgumentClass::ProtRead);
        let pointer = read_only.as_ptr();
        assert_eq!(pointer as usize % page, 0);
        assert_eq!(unsafe { std::ptr::read_volatile(pointer.cast::<u8>()) }, 0);
    }

    #[test]
    fn raw_syscall_matrix_matches_kernel_behavior() {
        let settings = Settings {
            max_failures: 0,
            ..Settings::default()
        };
        let mut ctx = Ctx::new("abi-test", settings);
        run_matrix(&mut ctx, "gettimeofday", &TV_TZ, &[CallPath::Syscall], |_, args| {
            CallResult::from_raw_syscall(unsafe {
                syscalls::syscall2(
                    syscalls::Sysno::gettimeofday,
                    args[0] as usize,
                    args[1] as usize,
                )
            })
        });
        assert_eq!(ctx.failures, 0);
    }

    #[test]
    fn writing_through_bad_pointers_is_caught_as_a_mismatch() {
        // a "fast path" that claims success without touching memory must be flagged
        // for every faulting cell
        let settings = Settings {
            max_failures: 0,
            ..Settings::default()
        };
        let mut ctx = Ctx::new("abi-test", settings);
        run_matrix(
            &mut ctx,
            "noop",
            &[PointerParam::nullable("out")],
            &[CallPath::FastPath],
            |_, _| CallResult::SUCCESS,
        );
        assert_eq!(ctx.failures, 3);
    }

    proptest! {
        #[test]
        fn any_faulting_argument_faults_the_call(
            picks in proptest::collection::vec(0usize..5, 1..4),
        ) {
            let classes: Vec<ArgumentClass> =
                picks.iter().map(|&pick| ArgumentClass::ALL[pick]).collect();
            let params: Vec<PointerParam> =
                classes.iter().map(|_| PointerParam::nullable("p")).collect();
            let expected = classes.iter().any(ArgumentClass::should_fault);
            prop_assert_eq!(args_should_fault(&params, &classes), expected);
            // pure: asking again changes nothing
            prop_assert_eq!(args_should_fault(&params, &classes), expected);
        }
    }
}
