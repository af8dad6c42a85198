//! The worker-facing line protocol and the opaque worker contract.
//!
//! Input lines handed to the worker are either player lines of the
//! form `<sid>:<command>` or `$`-prefixed administrative probes. A
//! `$silent ` prefix on a player line tells the worker to suppress
//! that line's output (used for disambiguation replay).

use std::path::Path;

use crate::ProtoError;

pub const PROBE_JOIN: &str = "$join";
pub const PROBE_PART: &str = "$part";
pub const PROBE_LOCATE: &str = "$locate";
pub const PROBE_KNOCK: &str = "$knock";
pub const PROBE_SHUTDOWN: &str = "$shutdown";
pub const PROBE_RTEVENT: &str = "$rtevent";
pub const SILENT_PREFIX: &str = "$silent ";

/// `"<sid>:<command>"`.
pub fn input_line(sid: i32, command: &str) -> String {
    format!("{sid}:{command}")
}

/// Wrap a player line so its output is suppressed.
pub fn silent_line(line: &str) -> String {
    format!("{SILENT_PREFIX}{line}")
}

pub fn join_probe(sid: i32, name: &str, position: &str) -> String {
    if position.is_empty() {
        format!("{PROBE_JOIN} {sid} {name}")
    } else {
        format!("{PROBE_JOIN} {sid} {name} {position}")
    }
}

pub fn part_probe(sid: i32) -> String {
    format!("{PROBE_PART} {sid}")
}

pub fn locate_probe(sid: i32) -> String {
    format!("{PROBE_LOCATE} {sid}")
}

pub fn knock_probe(token: &str) -> String {
    format!("{PROBE_KNOCK} {token}")
}

/// Split a player line back into `(sid, command)`.
pub fn parse_input_line(line: &str) -> Result<(i32, &str), ProtoError> {
    let (sid, rest) = line
        .split_once(':')
        .ok_or_else(|| ProtoError::BadInputLine(line.to_string()))?;
    let sid: i32 = sid
        .parse()
        .map_err(|_| ProtoError::BadInputLine(line.to_string()))?;
    Ok((sid, rest))
}

/// Session id of the player a queued line belongs to, if any.
///
/// Probe lines (and malformed lines) belong to no player.
pub fn line_session(line: &str) -> Option<i32> {
    let line = line.strip_prefix(SILENT_PREFIX).unwrap_or(line);
    parse_input_line(line).ok().map(|(sid, _)| sid)
}

/// Destination of a `<$b SPEC>` transfer: `token@instanceName`, with
/// a bare name meaning the `default` token of that instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub token: String,
    pub instance: String,
}

impl TransferSpec {
    pub fn parse(spec: &str) -> Result<Self, ProtoError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ProtoError::BadTransferSpec(spec.to_string()));
        }
        let (token, instance) = match spec.split_once('@') {
            Some((t, i)) => (t.trim(), i.trim()),
            None => ("default", spec),
        };
        if token.is_empty() || instance.is_empty() {
            return Err(ProtoError::BadTransferSpec(spec.to_string()));
        }
        Ok(Self {
            token: token.to_string(),
            instance: instance.to_string(),
        })
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The program halted on its own.
    Halted,
    /// The host asked it to stop (`read_line` returned `None`).
    Stopped,
    /// The interpreter faulted.
    Faulted,
}

/// Host services available to a running worker.
///
/// Every method may be called only from the worker's own thread; the
/// host side bridges them onto its async runtime.
pub trait WorkerHost {
    /// Append raw output (tag stream included) for demultiplexing.
    fn write(&mut self, chunk: &[u8]);

    /// Block until the next input line. `None` means shut down; the
    /// worker must return from `run` promptly after seeing it.
    fn read_line(&mut self) -> Option<String>;

    /// Side-channel register reads/writes. Unknown registers yield
    /// `-1` / `None` / `false` and are never fatal.
    fn get_word(&mut self, register: &str, arg: i32) -> i32;
    fn put_word(&mut self, register: &str, arg: i32, value: i32) -> bool;
    fn get_text(&mut self, register: &str, arg: &str) -> Option<String>;
    fn put_text(&mut self, register: &str, key: &str, value: &str) -> bool;
}

/// An opaque interpreter instance.
///
/// Workers are single-threaded, blocking, and non-reentrant: `run`
/// owns the calling thread until exit and must never be entered twice.
pub trait Worker: Send {
    fn run(&mut self, host: &mut dyn WorkerHost) -> WorkerExit;
}

/// Loads compiled images into workers. Implementations wrap a real
/// interpreter; a load rejection is the fatal worker-load failure
/// class, distinct from a compile failure.
pub trait WorkerFactory: Send + Sync {
    fn name(&self) -> &str;
    fn load(&self, image: &Path) -> Result<Box<dyn Worker>, String>;
}
