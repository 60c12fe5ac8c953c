// Kernel error handling and errno definitions

/// Internal error kinds, mapped onto errno values at the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Interrupted,
    WouldBlock,
    TimedOut,
    NotSupported,
    BadAddress,
    WouldDeadlock,
    Overflow,
    NotInitialized,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    ESRCH = 3,       // No such process
    EINTR = 4,       // Interrupted system call
    ECHILD = 10,     // No child processes
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EACCES = 13,     // Permission denied
    EFAULT = 14,     // Bad address
    EEXIST = 17,     // Already exists
    EINVAL = 22,     // Invalid argument
    EDEADLK = 35,    // Resource deadlock would occur
    ENOSYS = 38,     // Function not implemented
    EOVERFLOW = 75,  // Value too large for defined data type
    ENOTSUP = 95,    // Operation not supported
    ETIMEDOUT = 110, // Timed out
    EALREADY = 114,  // Operation already in progress
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EACCES,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::AlreadyExists => Errno::EEXIST,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::TimedOut => Errno::ETIMEDOUT,
            KernelError::NotSupported => Errno::ENOSYS,
            KernelError::BadAddress => Errno::EFAULT,
            KernelError::WouldDeadlock => Errno::EDEADLK,
            KernelError::Overflow => Errno::EOVERFLOW,
            KernelError::NotInitialized => Errno::EINVAL,
        }
    }
}

impl Errno {
    /// Syscall return convention: errors surface as negative integers.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EEXIST => "File exists",
            Errno::EINVAL => "Invalid argument",
            Errno::EDEADLK => "Resource deadlock would occur",
            Errno::ENOSYS => "Function not implemented",
            Errno::EOVERFLOW => "Value too large",
            Errno::ENOTSUP => "Operation not supported",
            Errno::ETIMEDOUT => "Timed out",
            Errno::EALREADY => "Operation already in progress",
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;

/// Fold a `Result` into the negative-errno syscall convention.
pub fn errno_or<T, F: FnOnce(T) -> isize>(res: Result<T>, map: F) -> isize {
    match res {
        Ok(v) => map(v),
        Err(e) => e.as_isize(),
    }
}
