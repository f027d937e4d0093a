use crate::debugger::address::RelocatedAddress;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("debuggee is not stopped")]
    NotStopped,
    #[error("timed out waiting for a debugger event")]
    Timeout,

    // --------------------------------- debug information errors ----------------------------------
    #[error("no debug information found in {}", .0.display())]
    NoDebugInfo(PathBuf),
    #[error("malformed dwarf: {0}")]
    MalformedDwarf(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("breakpoint plant failed at {0}")]
    BreakpointPlantFailed(RelocatedAddress),
    #[error("invalid breakpoint location `{0}`, expected `file:line` or a hex address")]
    InvalidLocation(String),
    #[error("unknown breakpoint id `{0}`")]
    InvalidBreakpointId(String),

    // --------------------------------- session errors --------------------------------------------
    #[error("unknown session `{0}`")]
    InvalidSession(String),
    #[error("debuggee process lost: {0}")]
    ProcessLost(String),
    #[error("failed to create debuggee process: {0}")]
    ProcessCreation(String),
    #[error("debugging is not supported on this platform")]
    UnsupportedPlatform,

    // --------------------------------- os-level errors -------------------------------------------
    #[error("invalid process or thread handle")]
    InvalidHandle,
    #[error("memory access denied at {0}")]
    MemoryAccessDenied(RelocatedAddress),
    #[error("thread {0} not found")]
    ThreadNotFound(u32),

    // --------------------------------- external interface errors ---------------------------------
    #[error("source file not found: {0}")]
    SourceNotFound(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
}

impl Error {
    /// Stable kind tag attached to every caller-visible failure.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::NotStopped => "NotStopped",
            Error::Timeout => "Timeout",
            Error::NoDebugInfo(_) => "NoDebugInfo",
            Error::MalformedDwarf(_) => "MalformedDwarf",
            Error::ObjParsing(_) => "MalformedDwarf",
            Error::BreakpointPlantFailed(_) => "BreakpointPlantFailed",
            Error::InvalidLocation(_) => "InvalidLocation",
            Error::InvalidBreakpointId(_) => "InvalidBreakpointId",
            Error::InvalidSession(_) => "InvalidSession",
            Error::ProcessLost(_) => "ProcessLost",
            Error::ProcessCreation(_) => "ProcessCreation",
            Error::UnsupportedPlatform => "UnsupportedPlatform",
            Error::InvalidHandle => "InvalidHandle",
            Error::MemoryAccessDenied(_) => "MemoryAccessDenied",
            Error::ThreadNotFound(_) => "ThreadNotFound",
            Error::SourceNotFound(_) => "SourceNotFound",
            Error::InvalidArguments(_) => "InvalidArguments",
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
