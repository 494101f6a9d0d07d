use std::io;
use thiserror::Error;

/// How far a failure reaches. A `Message` failure skips one message and the
/// folder continues; a `Folder` failure skips the folder and the account
/// continues; `Repo` counts against the account's failure budget; `Critical`
/// ends the account loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Message,
    Folder,
    Repo,
    Critical,
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("unique filename {0} already exists")]
    MessageExists(String),
    #[error("saving message (uid {uid}) on folder {folder} returned invalid uid {newuid}")]
    SaveInvalidUid { uid: i64, folder: String, newuid: i64 },
    #[error("UID validity mismatch on {folder}: cached {saved}, server reports {current}")]
    ValidityProblem { folder: String, saved: u32, current: u32 },
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Imap(#[from] imap::error::Error),
    #[error("{0}")]
    Tls(#[from] native_tls::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SyncError {
    pub severity: Severity,
    pub kind: ErrorKind,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn new(severity: Severity, kind: ErrorKind) -> SyncError {
        SyncError { severity, kind }
    }

    pub fn message(kind: ErrorKind) -> SyncError {
        SyncError::new(Severity::Message, kind)
    }

    pub fn folder(kind: ErrorKind) -> SyncError {
        SyncError::new(Severity::Folder, kind)
    }

    pub fn repo(kind: ErrorKind) -> SyncError {
        SyncError::new(Severity::Repo, kind)
    }

    pub fn critical(kind: ErrorKind) -> SyncError {
        SyncError::new(Severity::Critical, kind)
    }
}

// Filesystem trouble is local to the folder being worked on; network and TLS
// trouble means the connection pool may be stale, so it bubbles to the
// repository where it counts against the failure budget.

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> SyncError {
        SyncError::folder(ErrorKind::Io(e))
    }
}

impl From<imap::error::Error> for SyncError {
    fn from(e: imap::error::Error) -> SyncError {
        SyncError::repo(ErrorKind::Imap(e))
    }
}

impl From<native_tls::Error> for SyncError {
    fn from(e: native_tls::Error) -> SyncError {
        SyncError::repo(ErrorKind::Tls(e))
    }
}
