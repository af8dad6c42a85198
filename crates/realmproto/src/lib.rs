//! `realmproto`: the protocols between realmhost and its interpreter
//! workers.
//!
//! - [`tag`]: the embedded output tag mini-language (`<$t N>`, `<$a>`,
//!   `<$b spec>`, `<$d info>`) parsed with a per-byte state machine.
//! - [`worker`]: worker-facing input line formats and probe lines, the
//!   opaque [`worker::Worker`] contract, and transfer specs.
//! - [`chat`]: client chat shorthand rewriting.
//! - [`access`]: realm privacy levels and the access-control lattice.
//! - [`register`]: the side-channel register vocabulary.

pub mod access;
pub mod chat;
pub mod register;
pub mod tag;
pub mod worker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// A transfer spec that is not `token@instance` or a bare name.
    BadTransferSpec(String),
    /// A worker input line without the `<sid>:` prefix.
    BadInputLine(String),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::BadTransferSpec(s) => write!(f, "bad transfer spec: {s:?}"),
            ProtoError::BadInputLine(s) => write!(f, "bad worker input line: {s:?}"),
        }
    }
}

impl std::error::Error for ProtoError {}
