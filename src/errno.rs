//! Kernel error codes.
//!
//! Every fallible kernel path returns `Result<T>`; the syscall gateway
//! folds the error into the negative return value the user ABI expects.

/// POSIX error numbers, with the i386 Linux values.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    ETXTBSY = 26,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    EROFS = 30,
    EMLINK = 31,
    EPIPE = 32,
    EDEADLK = 35,
    ENAMETOOLONG = 36,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
    ELIBACC = 79,
    ELIBBAD = 80,
    EOPNOTSUPP = 95,
    EADDRINUSE = 98,
    ECONNREFUSED = 111,
    ENOMEDIUM = 123,
    /// Interrupted syscall that must be re-executed after the handler
    /// returns. Never escapes to user mode; the signal-return path turns
    /// it into `EINTR` or re-arms the trap instruction.
    ERESTART = 85,
}

pub type Result<T> = core::result::Result<T, Errno>;

impl Errno {
    /// The value placed in EAX when a syscall fails.
    pub fn as_ret(self) -> isize {
        -(self as i32) as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_convention_is_negative() {
        assert_eq!(Errno::EPERM.as_ret(), -1);
        assert_eq!(Errno::ENOENT.as_ret(), -2);
        assert_eq!(Errno::ENOSYS.as_ret(), -38);
    }
}
