//! Error taxonomy for the data plane.
//!
//! Mirrors the errors a filesystem shim needs to map to platform error codes,
//! plus a handful of internal-only variants (`InvalidRingBufferPosition`) that
//! never cross the facade boundary.

use std::io;

#[derive(thiserror::Error, Debug, Clone)]
pub enum DataPlaneError {
    #[error("not found")]
    NotFound,
    #[error("is a directory")]
    IsDirectory,
    #[error("is a file")]
    IsFile,
    #[error("already exists")]
    Exists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("access denied")]
    AccessDenied,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid operation")]
    InvalidOperation,
    /// Internal-only: a download raced a ring-buffer window slide. The read
    /// loop retries locally; this must never reach the facade.
    #[error("invalid ring buffer position")]
    InvalidRingBufferPosition,
    #[error("no space left")]
    NoSpace,
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("OS error (errno {errno})")]
    OsError { errno: i32 },
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("download incomplete")]
    DownloadIncomplete,
    #[error("download stopped")]
    DownloadStopped,
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("upload stopped")]
    UploadStopped,
    #[error("provider transport error: {0}")]
    CommError(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DataPlaneError>;

impl DataPlaneError {
    /// Ranks sticky download outcomes so a later, less severe observation never
    /// overwrites a more severe one: `Success < DownloadIncomplete <
    /// DownloadStopped < (any terminal error)`.
    pub fn download_precedence(&self) -> u8 {
        match self {
            DataPlaneError::DownloadIncomplete => 1,
            DataPlaneError::DownloadStopped => 2,
            _ => 3,
        }
    }

    /// True if retrying the same read against the provider again (up to
    /// `RetryReadCount` times) might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataPlaneError::CommError(_) | DataPlaneError::DownloadFailed(_) | DataPlaneError::IoError(_)
        )
    }

    /// Best-effort POSIX errno this error maps to. The facade uses this to
    /// translate into the platform's error code before returning to the shim.
    pub fn to_errno(&self) -> i32 {
        match self {
            DataPlaneError::NotFound => libc_enoent(),
            DataPlaneError::IsDirectory => libc_eisdir(),
            DataPlaneError::IsFile => libc_enotdir(),
            DataPlaneError::Exists => libc_eexist(),
            DataPlaneError::DirectoryNotEmpty => libc_enotempty(),
            DataPlaneError::AccessDenied | DataPlaneError::PermissionDenied => libc_eacces(),
            DataPlaneError::NotSupported => libc_enotsup(),
            DataPlaneError::InvalidOperation | DataPlaneError::InvalidRingBufferPosition => libc_einval(),
            DataPlaneError::NoSpace => libc_enospc(),
            DataPlaneError::OsError { errno } => *errno,
            DataPlaneError::Cancelled => libc_eintr(),
            _ => libc_eio(),
        }
    }
}

impl From<io::Error> for DataPlaneError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => DataPlaneError::NotFound,
            io::ErrorKind::AlreadyExists => DataPlaneError::Exists,
            io::ErrorKind::PermissionDenied => DataPlaneError::PermissionDenied,
            _ => {
                if let Some(errno) = e.raw_os_error() {
                    DataPlaneError::OsError { errno }
                } else {
                    DataPlaneError::IoError(e.to_string())
                }
            }
        }
    }
}

// Small constants avoid pulling in the `libc` crate just for a handful of
// errno numbers; values match Linux/most POSIX platforms.
fn libc_enoent() -> i32 {
    2
}
fn libc_eio() -> i32 {
    5
}
fn libc_eacces() -> i32 {
    13
}
fn libc_eexist() -> i32 {
    17
}
fn libc_enotdir() -> i32 {
    20
}
fn libc_eisdir() -> i32 {
    21
}
fn libc_einval() -> i32 {
    22
}
fn libc_enospc() -> i32 {
    28
}
fn libc_enotempty() -> i32 {
    39
}
fn libc_enotsup() -> i32 {
    95
}
fn libc_eintr() -> i32 {
    4
}
