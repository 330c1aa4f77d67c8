//! Error types for the RTG frame engine

use rtg_common::GroupId;
use thiserror::Error;

/// Alias for `Result<T, Error>`
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane errors
///
/// Tick-path problems are never surfaced here; they are logged and the
/// affected group degrades instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Out-of-range or malformed request parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Group id unknown or not currently allocated
    #[error("invalid group id: {0}")]
    InvalidGroupId(GroupId),

    /// The request would duplicate a live group
    #[error("group {0} is already active")]
    GroupAlreadyActive(GroupId),

    /// Every dynamic group slot is taken
    #[error("no free frame group slots")]
    NoFreeGroupSlots,

    /// Caller does not own the group
    #[error("uid {uid} does not own group {group}")]
    PermissionDenied { group: GroupId, uid: u32 },

    /// Group is not being tracked, or the thread is not one of its members
    #[error("group {0} is not in frame")]
    NotInFrame(GroupId),

    /// Too many frame groups already run RT threads
    #[error("no RT frame slots left")]
    NoRtFrameSlots,

    /// An activity window is open on the group
    #[error("activity in progress on group {0}")]
    ActivityInProgress(GroupId),

    /// Timer worker could not be started or reached
    #[error("timer error: {0}")]
    Timer(String),
}

/// Error category, for callers that only branch on the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidGroupId,
    GroupAlreadyActive,
    NoFreeGroupSlots,
    PermissionDenied,
    NotInFrame,
    NoRtFrameSlots,
    ActivityInProgress,
    Timer,
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InvalidGroupId(_) => ErrorKind::InvalidGroupId,
            Error::GroupAlreadyActive(_) => ErrorKind::GroupAlreadyActive,
            Error::NoFreeGroupSlots => ErrorKind::NoFreeGroupSlots,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::NotInFrame(_) => ErrorKind::NotInFrame,
            Error::NoRtFrameSlots => ErrorKind::NoRtFrameSlots,
            Error::ActivityInProgress(_) => ErrorKind::ActivityInProgress,
            Error::Timer(_) => ErrorKind::Timer,
        }
    }
}
