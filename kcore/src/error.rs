//! Kernel error taxonomy and errno mapping.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    NoMemory,
    WouldBlock,
    TimedOut,
    Interrupted,
    InvalidArg,
    InvalidAddr,
    NotFound,
    AlreadyExists,
    PermDenied,
    ProcessRunning,
    ReadOnly,
    IoError,
    NotSupported,
    BadHandle,
    NotInitialized,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ENOSYS = 38,
    ETIMEDOUT = 110,
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::NoMemory => Errno::ENOMEM,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::TimedOut => Errno::ETIMEDOUT,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::InvalidArg => Errno::EINVAL,
            KernelError::InvalidAddr => Errno::EFAULT,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::AlreadyExists => Errno::EEXIST,
            KernelError::PermDenied => Errno::EACCES,
            KernelError::ProcessRunning => Errno::EBUSY,
            KernelError::ReadOnly => Errno::EACCES,
            KernelError::IoError => Errno::EIO,
            KernelError::NotSupported => Errno::ENOSYS,
            KernelError::BadHandle => Errno::EBADF,
            KernelError::NotInitialized => Errno::EINVAL,
        }
    }
}

impl Errno {
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such entity",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted",
            Errno::EIO => "I/O error",
            Errno::EBADF => "Bad handle",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Would block",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Resource busy",
            Errno::EEXIST => "Already exists",
            Errno::EINVAL => "Invalid argument",
            Errno::ENOSYS => "Not supported",
            Errno::ETIMEDOUT => "Timed out",
        }
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// Log at [`crate::log::Level::Error`] and halt. Used for invariant
/// violations that the design calls out as always-fatal: nested spinlock
/// acquisition on uniprocessor builds, an unpaired release, boundary-tag
/// corruption in the range arena, a missing cache page on release, and
/// scheduler state inconsistencies.
#[cold]
#[track_caller]
pub fn panic(msg: &str) -> ! {
    crate::error!("fatal: {}", msg);
    #[cfg(test)]
    {
        std::panic!("{}", msg);
    }
    #[cfg(not(test))]
    {
        loop {
            core::hint::spin_loop();
        }
    }
}
