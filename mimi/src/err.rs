// err.rs - shared error codes
//
// The numeric code space is part of the ABI: syscalls return these values
// in r0, and the shell-facing tools print them. Keep the numbers stable.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrCode {
    #[error("out of memory")]
    Nomem,
    #[error("invalid argument")]
    Inval,
    #[error("no such file or entry")]
    Noent,
    #[error("I/O error")]
    Io,
    #[error("resource busy")]
    Busy,
    #[error("permission denied")]
    Perm,
    #[error("not implemented")]
    Nosys,
    #[error("corrupted data")]
    Corrupt,
    #[error("too large")]
    TooLarge,
    #[error("not executable")]
    Noexec,
}

impl ErrCode {
    /// Numeric value as seen by user programs (0 is success and has no
    /// variant here).
    pub fn code(self) -> i32 {
        match self {
            ErrCode::Nomem => -1,
            ErrCode::Inval => -2,
            ErrCode::Noent => -3,
            ErrCode::Io => -4,
            ErrCode::Busy => -5,
            ErrCode::Perm => -6,
            ErrCode::Nosys => -7,
            ErrCode::Corrupt => -8,
            ErrCode::TooLarge => -9,
            ErrCode::Noexec => -10,
        }
    }
}

impl From<std::io::Error> for ErrCode {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrCode::Noent,
            std::io::ErrorKind::PermissionDenied => ErrCode::Perm,
            _ => ErrCode::Io,
        }
    }
}
