use realmproto::access::AccessLevel;

use crate::compile::CompileOutcome;

/// Host-level failure taxonomy.
///
/// Runtime freezes never appear here; they are handled asynchronously
/// through failure counting (see the watchdog sweep).
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("no such realm: {0}")]
    UnknownRealm(String),

    #[error("no such player: {0}")]
    UnknownPlayer(String),

    #[error("no such instance: {0}")]
    UnknownInstance(String),

    #[error("compile failed: {0:?}")]
    Compile(CompileOutcome),

    /// The image compiled but the interpreter rejected it. Retrying
    /// with the same image cannot succeed; this is a toolchain or
    /// runtime mismatch, not a source bug.
    #[error("worker rejected compiled image: {0}")]
    WorkerLoad(String),

    #[error("permission denied (need {need:?}, have {have:?})")]
    PermissionDenied {
        need: AccessLevel,
        have: AccessLevel,
    },

    #[error("realm is condemned: {0}")]
    Condemned(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
