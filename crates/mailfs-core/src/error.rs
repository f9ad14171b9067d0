//! Error types for MailFS Core

use std::io;

use crate::mailbox::MailError;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("not a file")]
    NotAFile,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("unsupported")]
    Unsupported,
    #[error("mailbox error: {0}")]
    Transport(#[from] MailError),
    #[error("local io error: {0}")]
    LocalIo(#[from] io::Error),
    #[error("rename failed: {0}")]
    RenameFailed(String),
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn invalid_path<S: Into<String>>(path: S) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Platform error code reported back to the kernel for this error.
    #[cfg(unix)]
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::NotAFile => libc::EISDIR,
            FsError::InvalidPath(_) | FsError::InvalidConfig(_) => libc::EINVAL,
            FsError::Unsupported => libc::ENOTSUP,
            FsError::Transport(_) => transport_errno(),
            FsError::LocalIo(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::RenameFailed(_) | FsError::WriteRejected(_) => libc::EACCES,
        }
    }
}

#[cfg(target_os = "linux")]
fn transport_errno() -> i32 {
    libc::ECOMM
}

#[cfg(all(unix, not(target_os = "linux")))]
fn transport_errno() -> i32 {
    libc::EIO
}
