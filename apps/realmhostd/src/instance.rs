//! One running execution of a realm.
//!
//! The interpreter worker is blocking and non-reentrant, so each
//! active instance owns exactly one dedicated OS thread for it. This
//! module bridges that thread to the async host: a FIFO input channel
//! (with in-band transaction markers and a stop sentinel), tag-stream
//! demultiplexing of the worker's output to joined players, the
//! synchronous-transaction protocol, and the watchdog clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, Timelike};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use realmproto::register::{Register, WORD_SENTINEL};
use realmproto::tag::{TagAction, TagScanner};
use realmproto::worker::{
    self, TransferSpec, Worker, WorkerExit, WorkerFactory, WorkerHost, PROBE_SHUTDOWN,
};

use crate::error::HostError;
use crate::events::Command;
use crate::player::Player;
use crate::realm::Realm;
use crate::store::Store;

/// Input lines longer than this are truncated before queueing.
pub const MAX_INPUT_CHARS: usize = 512;

/// Registry key for an instance: `<realm_lc>/<instance name>`.
pub fn instance_key(realm_lc: &str, name: &str) -> String {
    format!("{realm_lc}/{name}")
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub txn_timeout: Duration,
    pub watchdog_grace: Duration,
}

#[derive(Debug)]
enum WorkerMsg {
    Line(String),
    /// The transaction slot holds a queued query; deliver it.
    Txn,
    Stop,
}

struct Txn {
    query: String,
    buf: Arc<Mutex<String>>,
    done: Option<oneshot::Sender<String>>,
}

enum TxnSlot {
    Idle,
    Queued(Txn),
    Running(Txn),
}

struct WatchdogState {
    armed: bool,
    deadline: Instant,
    /// One failure per episode: set when a freeze is observed,
    /// cleared on the next re-arm.
    noted: bool,
}

struct SessionEntry {
    player: Arc<Player>,
    /// Pending `<$d>` info; the next input line from this player is
    /// preceded by a silent replay of it.
    disambig: Option<String>,
}

struct InstanceShared {
    key: String,
    realm: Arc<Realm>,
    cfg: InstanceConfig,
    sessions: RwLock<HashMap<i32, SessionEntry>>,
    txn: Mutex<TxnSlot>,
    watchdog: Mutex<WatchdogState>,
    input_tx: Mutex<Option<crossbeam_channel::Sender<WorkerMsg>>>,
    active: AtomicBool,
    stop: AtomicBool,
    /// Set when the instance is being shut down for good; suppresses
    /// the automatic restart when the worker thread exits.
    terminate: AtomicBool,
    restart_requested: AtomicBool,
    raw_mode: AtomicBool,
    rte_secs: AtomicU32,
    /// Tombstone of the currently scheduled timed event, if any.
    rte_tombstone: Mutex<Option<Arc<AtomicBool>>>,
    kv: Arc<Store>,
    post: mpsc::UnboundedSender<Command>,
}

pub struct InstanceRuntime {
    pub realm: Arc<Realm>,
    pub name: String,
    shared: Arc<InstanceShared>,
    factory: Arc<dyn WorkerFactory>,
    image: std::path::PathBuf,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Serializes `send_and_get` callers: at most one transaction in
    /// flight per instance.
    txn_gate: tokio::sync::Mutex<()>,
}

impl InstanceRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        realm: Arc<Realm>,
        name: &str,
        factory: Arc<dyn WorkerFactory>,
        image: std::path::PathBuf,
        kv: Arc<Store>,
        post: mpsc::UnboundedSender<Command>,
        cfg: InstanceConfig,
    ) -> Arc<Self> {
        let key = instance_key(&realm.name_lc, name);
        Arc::new(Self {
            realm: realm.clone(),
            name: name.to_string(),
            shared: Arc::new(InstanceShared {
                key,
                realm,
                cfg,
                sessions: RwLock::new(HashMap::new()),
                txn: Mutex::new(TxnSlot::Idle),
                watchdog: Mutex::new(WatchdogState {
                    armed: false,
                    deadline: Instant::now(),
                    noted: false,
                }),
                input_tx: Mutex::new(None),
                active: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                terminate: AtomicBool::new(false),
                restart_requested: AtomicBool::new(false),
                raw_mode: AtomicBool::new(false),
                rte_secs: AtomicU32::new(0),
                rte_tombstone: Mutex::new(None),
                kv,
                post,
            }),
            factory,
            image,
            thread: Mutex::new(None),
            txn_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn set_raw_mode(&self, on: bool) {
        self.shared.raw_mode.store(on, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.shared.restart_requested.store(true, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.shared.restart_requested.load(Ordering::SeqCst)
    }

    /// Start the worker thread. Idempotent; a second call while
    /// active is a no-op.
    pub fn activate(&self) -> Result<(), HostError> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.terminate.store(false, Ordering::SeqCst);

        let worker = match self.factory.load(&self.image) {
            Ok(w) => w,
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                return Err(HostError::WorkerLoad(e));
            }
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        *self.shared.input_tx.lock() = Some(tx);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", self.shared.key))
            .spawn(move || worker_main(worker, shared, rx))?;
        *self.thread.lock() = Some(handle);
        debug!(instance = %self.shared.key, "instance activated");
        Ok(())
    }

    /// Stop the worker. Idempotent, and tolerates a thread that has
    /// already exited. Pending transactions are released with their
    /// partial response so no caller stays blocked.
    ///
    /// A worker stuck outside any host call cannot be killed; its
    /// thread is detached and leaks until it next touches the bridge.
    pub fn deactivate(&self, terminate: bool) {
        if terminate {
            self.shared.terminate.store(true, Ordering::SeqCst);
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shared.input_tx.lock().take() {
            let _ = tx.send(WorkerMsg::Stop);
        }
        self.shared.release_txn();
        self.shared.active.store(false, Ordering::SeqCst);
        drop(self.thread.lock().take());
    }

    /// Queue one player input line (fire and forget).
    pub fn queue_input(&self, line: &str) {
        let line = if line.chars().count() > MAX_INPUT_CHARS {
            line.chars().take(MAX_INPUT_CHARS).collect::<String>()
        } else {
            line.to_string()
        };
        self.send_msg(WorkerMsg::Line(line));
    }

    /// Queue an administrative probe line (never truncated).
    pub fn queue_probe(&self, line: &str) {
        self.send_msg(WorkerMsg::Line(line.to_string()));
    }

    fn send_msg(&self, msg: WorkerMsg) {
        let guard = self.shared.input_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => trace!(instance = %self.shared.key, "input dropped; instance inactive"),
        }
    }

    /// Issue a blocking query to the worker.
    ///
    /// Resolves when the worker next becomes idle, or after the
    /// configured timeout with whatever output accumulated so far.
    /// Transactions are strictly one at a time; concurrent callers
    /// queue on an async gate without blocking the worker.
    pub async fn send_and_get(&self, query: &str) -> String {
        let _gate = self.txn_gate.lock().await;

        let buf = Arc::new(Mutex::new(String::new()));
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut slot = self.shared.txn.lock();
            *slot = TxnSlot::Queued(Txn {
                query: query.to_string(),
                buf: buf.clone(),
                done: Some(done_tx),
            });
        }
        self.send_msg(WorkerMsg::Txn);

        match tokio::time::timeout(self.shared.cfg.txn_timeout, done_rx).await {
            Ok(Ok(full)) => full,
            _ => {
                // Timed out, or the worker went away: hand back the
                // partial response and clear the slot.
                *self.shared.txn.lock() = TxnSlot::Idle;
                let partial = buf.lock().clone();
                warn!(instance = %self.shared.key, "transaction timed out");
                partial
            }
        }
    }

    /// Join a player, assigning the smallest free session id.
    pub fn add_player(&self, player: &Arc<Player>, saved_position: &str) -> i32 {
        let sid = {
            let mut sessions = self.shared.sessions.write();
            let mut sid = 1;
            while sessions.contains_key(&sid) {
                sid += 1;
            }
            sessions.insert(
                sid,
                SessionEntry {
                    player: player.clone(),
                    disambig: None,
                },
            );
            sid
        };
        player.state.write().instance = Some(self.shared.key.clone());
        if !self.shared.raw_mode.load(Ordering::SeqCst) {
            self.queue_probe(&worker::join_probe(sid, &player.name, saved_position));
        }
        sid
    }

    /// Part a player; a no-op for unknown session ids.
    pub fn remove_player(&self, sid: i32) {
        let entry = self.shared.sessions.write().remove(&sid);
        if let Some(entry) = entry {
            if !self.shared.raw_mode.load(Ordering::SeqCst) {
                self.queue_probe(&worker::part_probe(sid));
            }
            let mut st = entry.player.state.write();
            if st.instance.as_deref() == Some(self.shared.key.as_str()) {
                st.instance = None;
            }
        }
    }

    pub fn session_of(&self, player_id: i64) -> Option<i32> {
        self.shared
            .sessions
            .read()
            .iter()
            .find(|(_, e)| e.player.id == player_id)
            .map(|(sid, _)| *sid)
    }

    pub fn joined_players(&self) -> Vec<(i32, Arc<Player>)> {
        let mut v: Vec<(i32, Arc<Player>)> = self
            .shared
            .sessions
            .read()
            .iter()
            .map(|(sid, e)| (*sid, e.player.clone()))
            .collect();
        v.sort_by_key(|(sid, _)| *sid);
        v
    }

    /// Remove every session at once (teardown paths), unbinding the
    /// players from this instance. Returns the abandoned players.
    pub fn drain_sessions(&self) -> Vec<Arc<Player>> {
        self.shared.drain_sessions()
    }

    /// Ask the worker to wind down politely (`$shutdown`); forced
    /// deactivation follows separately.
    pub fn request_shutdown(&self) {
        self.queue_probe(PROBE_SHUTDOWN);
    }

    /// Watchdog check: true exactly once per freeze episode.
    pub fn frozen_once(&self, now: Instant) -> bool {
        let mut wd = self.shared.watchdog.lock();
        if wd.armed && !wd.noted && now >= wd.deadline {
            wd.noted = true;
            true
        } else {
            false
        }
    }

    pub fn rte_interval(&self) -> u32 {
        self.shared.rte_secs.load(Ordering::SeqCst)
    }

    /// Swap in a new timed-event tombstone, cancelling the old one.
    pub fn replace_rte_tombstone(&self, next: Option<Arc<AtomicBool>>) {
        let mut slot = self.shared.rte_tombstone.lock();
        if let Some(old) = slot.take() {
            old.store(true, Ordering::SeqCst);
        }
        *slot = next;
    }

    #[cfg(test)]
    pub(crate) fn force_watchdog_deadline(&self, deadline: Instant) {
        let mut wd = self.shared.watchdog.lock();
        wd.armed = true;
        wd.noted = false;
        wd.deadline = deadline;
    }
}

impl InstanceShared {
    /// Release any pending transaction with its partial buffer.
    fn release_txn(&self) {
        let taken = std::mem::replace(&mut *self.txn.lock(), TxnSlot::Idle);
        match taken {
            TxnSlot::Queued(mut t) | TxnSlot::Running(mut t) => {
                if let Some(done) = t.done.take() {
                    let partial = t.buf.lock().clone();
                    let _ = done.send(partial);
                }
            }
            TxnSlot::Idle => {}
        }
    }

    fn arm_watchdog(&self) {
        let mut wd = self.watchdog.lock();
        wd.armed = true;
        wd.noted = false;
        wd.deadline = Instant::now() + self.cfg.watchdog_grace;
    }

    fn disarm_watchdog(&self) {
        self.watchdog.lock().armed = false;
    }

    /// Drop every session and unbind its player from this instance.
    fn drain_sessions(&self) -> Vec<Arc<Player>> {
        let drained: Vec<Arc<Player>> = self
            .sessions
            .write()
            .drain()
            .map(|(_, e)| e.player)
            .collect();
        for p in &drained {
            let mut st = p.state.write();
            if st.instance.as_deref() == Some(self.key.as_str()) {
                st.instance = None;
            }
        }
        drained
    }
}

/// Worker thread body: run the interpreter against the bridge, then
/// clean up and notify the owner.
fn worker_main(
    mut worker: Box<dyn Worker>,
    shared: Arc<InstanceShared>,
    rx: crossbeam_channel::Receiver<WorkerMsg>,
) {
    let mut bridge = Bridge::new(shared.clone(), rx);
    let exit = worker.run(&mut bridge);
    bridge.finish_stream();
    drop(bridge);

    shared.release_txn();
    shared.disarm_watchdog();
    shared.active.store(false, Ordering::SeqCst);

    let abandoned = shared.drain_sessions();
    let terminated = shared.terminate.load(Ordering::SeqCst);
    debug!(instance = %shared.key, ?exit, terminated, abandoned = abandoned.len(), "worker exited");

    let _ = shared.post.send(Command::InstanceExited {
        key: shared.key.clone(),
        abandoned,
        terminated,
        exit,
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Target {
    Player(i32),
    Announcer,
}

/// The worker-facing side of the runtime; lives on the worker thread.
struct Bridge {
    shared: Arc<InstanceShared>,
    rx: crossbeam_channel::Receiver<WorkerMsg>,
    scan: TagScanner,
    targets: Vec<Target>,
    /// Per-target line assembly, flushed on newline or yield.
    bufs: HashMap<Target, Vec<u8>>,
    /// Output suppression for the current `$silent` line.
    silent: bool,
    /// Second half of a disambiguation delivery.
    replay: Option<String>,
}

impl Bridge {
    fn new(shared: Arc<InstanceShared>, rx: crossbeam_channel::Receiver<WorkerMsg>) -> Self {
        Self {
            shared,
            rx,
            scan: TagScanner::new(),
            targets: Vec::new(),
            bufs: HashMap::new(),
            silent: false,
            replay: None,
        }
    }

    fn apply(&mut self, action: TagAction) {
        match action {
            TagAction::Emit(b) => self.emit(b),
            TagAction::PushTarget(sid) => self.targets.push(Target::Player(sid)),
            TagAction::PushAnnouncer => self.targets.push(Target::Announcer),
            TagAction::PopTarget => {
                if self.targets.pop().is_none() {
                    trace!(instance = %self.shared.key, "unbalanced close tag");
                }
            }
            TagAction::Transfer(spec) => self.transfer(&spec),
            TagAction::Disambiguate(info) => {
                match self.targets.last() {
                    Some(Target::Player(sid)) => {
                        if let Some(e) = self.shared.sessions.write().get_mut(sid) {
                            e.disambig = Some(info);
                        }
                    }
                    _ => warn!(instance = %self.shared.key, "<$d> with no player target"),
                }
            }
        }
    }

    fn emit(&mut self, b: u8) {
        if self.silent {
            return;
        }
        let Some(target) = self.targets.last().copied() else {
            // No target: diagnostic sink.
            if b == b'\n' {
                trace!(instance = %self.shared.key, "untargeted worker output discarded");
            }
            return;
        };
        let buf = self.bufs.entry(target).or_default();
        if b == b'\n' {
            let line = std::mem::take(buf);
            self.deliver(target, &String::from_utf8_lossy(&line));
        } else {
            buf.push(b);
        }
    }

    fn deliver(&self, target: Target, line: &str) {
        let sessions = self.shared.sessions.read();
        match target {
            Target::Player(sid) => {
                if let Some(e) = sessions.get(&sid) {
                    e.player.send_line(line);
                }
                // Unknown or connectionless target: drop silently.
            }
            Target::Announcer => {
                for e in sessions.values() {
                    e.player.send_line(line);
                }
            }
        }
    }

    fn flush_targets(&mut self) {
        let pending: Vec<(Target, Vec<u8>)> = self
            .bufs
            .iter_mut()
            .filter(|(_, b)| !b.is_empty())
            .map(|(t, b)| (*t, std::mem::take(b)))
            .collect();
        for (t, line) in pending {
            self.deliver(t, &String::from_utf8_lossy(&line));
        }
    }

    /// End of the output stream: whatever the scanner still holds as
    /// a possible tag was literal text after all.
    fn finish_stream(&mut self) {
        let actions = self.scan.finish();
        for a in actions {
            self.apply(a);
        }
        self.flush_targets();
    }

    fn transfer(&self, spec: &str) {
        let Some(Target::Player(sid)) = self.targets.last().copied() else {
            warn!(instance = %self.shared.key, spec, "<$b> with no player target");
            return;
        };
        match TransferSpec::parse(spec) {
            Ok(spec) => {
                let _ = self.shared.post.send(Command::Transfer {
                    key: self.shared.key.clone(),
                    sid,
                    spec,
                });
            }
            Err(e) => warn!(instance = %self.shared.key, err = %e, "bad transfer spec"),
        }
    }

    fn session_player(&self, sid: i32) -> Option<Arc<Player>> {
        self.shared.sessions.read().get(&sid).map(|e| e.player.clone())
    }

    /// Complete a transaction the worker just finished producing
    /// output for.
    fn complete_running_txn(&self) {
        let mut slot = self.shared.txn.lock();
        match std::mem::replace(&mut *slot, TxnSlot::Idle) {
            TxnSlot::Running(mut t) => {
                if let Some(done) = t.done.take() {
                    let response = t.buf.lock().clone();
                    let _ = done.send(response);
                }
            }
            other => *slot = other,
        }
    }
}

impl WorkerHost for Bridge {
    fn write(&mut self, chunk: &[u8]) {
        // A running transaction captures the raw stream pre-demux.
        {
            let slot = self.shared.txn.lock();
            if let TxnSlot::Running(t) = &*slot {
                t.buf.lock().push_str(&String::from_utf8_lossy(chunk));
            }
        }

        if self.shared.raw_mode.load(Ordering::SeqCst) {
            // Raw mode: no tag parsing, broadcast verbatim.
            self.targets.push(Target::Announcer);
            for &b in chunk {
                self.emit(b);
            }
            self.targets.pop();
            return;
        }

        let actions = self.scan.push_chunk(chunk);
        for action in actions {
            self.apply(action);
        }
    }

    fn read_line(&mut self) -> Option<String> {
        self.flush_targets();
        self.complete_running_txn();
        self.shared.disarm_watchdog();
        self.silent = false;

        if let Some(line) = self.replay.take() {
            self.shared.arm_watchdog();
            return Some(line);
        }

        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                return None;
            }
            match self.rx.recv() {
                Err(_) => return None,
                Ok(WorkerMsg::Stop) => return None,
                Ok(WorkerMsg::Txn) => {
                    let query = {
                        let mut slot = self.shared.txn.lock();
                        match std::mem::replace(&mut *slot, TxnSlot::Idle) {
                            TxnSlot::Queued(t) => {
                                let q = t.query.clone();
                                *slot = TxnSlot::Running(t);
                                Some(q)
                            }
                            other => {
                                // Stale marker (caller timed out).
                                *slot = other;
                                None
                            }
                        }
                    };
                    if let Some(q) = query {
                        self.shared.arm_watchdog();
                        return Some(q);
                    }
                }
                Ok(WorkerMsg::Line(line)) => {
                    if let Some(sid) = worker::line_session(&line) {
                        let info = self
                            .shared
                            .sessions
                            .write()
                            .get_mut(&sid)
                            .and_then(|e| e.disambig.take());
                        if let Some(info) = info {
                            // Silent replay first, literal line next.
                            self.replay = Some(line);
                            self.silent = true;
                            self.shared.arm_watchdog();
                            return Some(worker::silent_line(&worker::input_line(sid, &info)));
                        }
                    }
                    self.shared.arm_watchdog();
                    return Some(line);
                }
            }
        }
    }

    fn get_word(&mut self, register: &str, arg: i32) -> i32 {
        let Some(reg) = Register::parse(register) else {
            return WORD_SENTINEL;
        };
        let now = Local::now();
        match reg {
            Register::TimeOfDay => now.num_seconds_from_midnight() as i32,
            Register::Day => now.day() as i32,
            Register::Month => now.month() as i32,
            Register::Year => now.year(),
            Register::Weekday => now.weekday().num_days_from_sunday() as i32,
            Register::IdleTime => self
                .session_player(arg)
                .and_then(|p| p.idle())
                .map(|d| d.as_secs() as i32)
                .unwrap_or(WORD_SENTINEL),
            Register::AccessLevel => self
                .session_player(arg)
                .map(|p| self.shared.realm.effective_access(&p).rank())
                .unwrap_or(WORD_SENTINEL),
            Register::RteInterval => self.shared.rte_secs.load(Ordering::SeqCst) as i32,
            _ => WORD_SENTINEL,
        }
    }

    fn put_word(&mut self, register: &str, _arg: i32, value: i32) -> bool {
        match Register::parse(register) {
            Some(Register::RteInterval) if value >= 0 => {
                self.shared.rte_secs.store(value as u32, Ordering::SeqCst);
                let _ = self.shared.post.send(Command::SetEventInterval {
                    key: self.shared.key.clone(),
                    secs: value as u32,
                });
                true
            }
            _ => false,
        }
    }

    fn get_text(&mut self, register: &str, arg: &str) -> Option<String> {
        let reg = Register::parse(register)?;
        match reg {
            Register::Attr => {
                let (sid, key) = split_sid_arg(arg)?;
                let player = self.session_player(sid)?;
                let v = player.state.read().attrs.get(key).cloned();
                v
            }
            Register::RealmStore => self
                .shared
                .kv
                .kv_get(&format!("realm:{}", self.shared.realm.name_lc), arg.trim()),
            Register::PlayerStore => {
                let (sid, key) = split_sid_arg(arg)?;
                let player = self.session_player(sid)?;
                self.shared.kv.kv_get(
                    &format!("player:{}:{}", self.shared.realm.name_lc, player.id),
                    key,
                )
            }
            _ => None,
        }
    }

    fn put_text(&mut self, register: &str, key: &str, value: &str) -> bool {
        let Some(reg) = Register::parse(register) else {
            return false;
        };
        if !reg.writable() {
            return false;
        }
        match reg {
            Register::Attr => {
                let Some((sid, attr)) = split_sid_arg(key) else {
                    return false;
                };
                let Some(player) = self.session_player(sid) else {
                    return false;
                };
                let mut st = player.state.write();
                if value.is_empty() {
                    st.attrs.remove(attr);
                } else {
                    st.attrs.insert(attr.to_string(), value.to_string());
                }
                true
            }
            Register::RealmStore => {
                self.shared.kv.kv_put(
                    &format!("realm:{}", self.shared.realm.name_lc),
                    key.trim(),
                    value,
                );
                true
            }
            Register::PlayerStore => {
                let Some((sid, k)) = split_sid_arg(key) else {
                    return false;
                };
                let Some(player) = self.session_player(sid) else {
                    return false;
                };
                self.shared.kv.kv_put(
                    &format!("player:{}:{}", self.shared.realm.name_lc, player.id),
                    k,
                    value,
                );
                true
            }
            _ => false,
        }
    }
}

/// Player-scoped register arguments lead with the session id:
/// `"5 color"` => `(5, "color")`.
fn split_sid_arg(arg: &str) -> Option<(i32, &str)> {
    let (sid, rest) = arg.trim().split_once(' ')?;
    let sid: i32 = sid.parse().ok()?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    Some((sid, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::{Realm, RealmState};
    use realmproto::access::Privacy;
    use std::path::Path;

    /// Worker driven by a closure: `(line, host)` per input line;
    /// return false to halt.
    struct ScriptWorker<F>(F);

    impl<F> Worker for ScriptWorker<F>
    where
        F: FnMut(&str, &mut dyn WorkerHost) -> bool + Send,
    {
        fn run(&mut self, host: &mut dyn WorkerHost) -> WorkerExit {
            loop {
                let Some(line) = host.read_line() else {
                    return WorkerExit::Stopped;
                };
                if !(self.0)(&line, host) {
                    return WorkerExit::Halted;
                }
            }
        }
    }

    struct ScriptFactory<F>(std::sync::Mutex<Option<ScriptWorker<F>>>);

    impl<F> WorkerFactory for ScriptFactory<F>
    where
        F: FnMut(&str, &mut dyn WorkerHost) -> bool + Send + 'static,
    {
        fn name(&self) -> &str {
            "script"
        }

        fn load(&self, _image: &Path) -> Result<Box<dyn Worker>, String> {
            let w = self
                .0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| "script already loaded".to_string())?;
            Ok(Box::new(w))
        }
    }

    fn test_realm() -> Arc<Realm> {
        Realm::from_parts(
            "lab",
            Path::new("/tmp/lab.src"),
            Path::new("/tmp/lab.img"),
            "script",
            1,
            RealmState {
                privacy: Privacy::Joinable,
                ..RealmState::default()
            },
        )
    }

    fn test_instance<F>(
        script: F,
        store: Arc<Store>,
    ) -> (Arc<InstanceRuntime>, mpsc::UnboundedReceiver<Command>)
    where
        F: FnMut(&str, &mut dyn WorkerHost) -> bool + Send + 'static,
    {
        let (post, events) = mpsc::unbounded_channel();
        let factory = Arc::new(ScriptFactory(std::sync::Mutex::new(Some(ScriptWorker(
            script,
        )))));
        let inst = InstanceRuntime::new(
            test_realm(),
            "default",
            factory,
            "/tmp/lab.img".into(),
            store,
            post,
            InstanceConfig {
                txn_timeout: Duration::from_millis(300),
                watchdog_grace: Duration::from_secs(5),
            },
        );
        (inst, events)
    }

    fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        // Leak the tempdir so the store outlives this helper.
        std::mem::forget(dir);
        store
    }

    fn connected_player(id: i64, name: &str) -> (Arc<Player>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let p = Player::new(id, name, false, false);
        p.state.write().conn = Some(Arc::new(crate::player::Connection::new(tx)));
        (p, rx)
    }

    #[tokio::test]
    async fn routes_targeted_output_to_the_right_player() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.ends_with(":speak") {
                    host.write(b"<$t 1>for one\n</$t><$t 2>for two\n</$t>");
                }
                true
            },
            test_store(),
        );
        let (p1, mut rx1) = connected_player(10, "ada");
        let (p2, mut rx2) = connected_player(11, "bob");

        inst.activate().unwrap();
        let s1 = inst.add_player(&p1, "");
        let s2 = inst.add_player(&p2, "");
        assert_eq!((s1, s2), (1, 2));

        inst.queue_input(&worker::input_line(1, "speak"));
        assert_eq!(rx1.recv().await.unwrap(), "for one");
        assert_eq!(rx2.recv().await.unwrap(), "for two");

        inst.deactivate(true);
    }

    #[tokio::test]
    async fn announcer_broadcasts_to_all_joined_players() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.ends_with(":go") {
                    host.write(b"<$a>all hands\n</$a>");
                }
                true
            },
            test_store(),
        );
        let (p1, mut rx1) = connected_player(10, "ada");
        let (p2, mut rx2) = connected_player(11, "bob");

        inst.activate().unwrap();
        inst.add_player(&p1, "");
        inst.add_player(&p2, "");
        inst.queue_input(&worker::input_line(1, "go"));

        assert_eq!(rx1.recv().await.unwrap(), "all hands");
        assert_eq!(rx2.recv().await.unwrap(), "all hands");
        inst.deactivate(true);
    }

    #[tokio::test]
    async fn transaction_returns_output_collected_before_next_idle() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.starts_with("$locate") {
                    host.write(b"west of the lab\n");
                }
                true
            },
            test_store(),
        );
        inst.activate().unwrap();

        let got = inst.send_and_get("$locate 3").await;
        assert_eq!(got, "west of the lab\n");
        inst.deactivate(true);
    }

    #[tokio::test]
    async fn transaction_timeout_returns_partial_response() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.starts_with("$locate") {
                    host.write(b"partial");
                    // Never yields back: the caller must time out.
                    std::thread::sleep(Duration::from_secs(2));
                }
                true
            },
            test_store(),
        );
        inst.activate().unwrap();

        let started = Instant::now();
        let got = inst.send_and_get("$locate 1").await;
        assert_eq!(got, "partial");
        assert!(started.elapsed() < Duration::from_secs(2));
        inst.deactivate(true);
    }

    #[tokio::test]
    async fn transactions_are_still_issued_while_input_is_queued() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.starts_with("$locate") {
                    host.write(b"here\n");
                }
                true
            },
            test_store(),
        );
        inst.activate().unwrap();
        let (p1, _rx1) = connected_player(10, "ada");
        inst.add_player(&p1, "");
        for _ in 0..10 {
            inst.queue_input(&worker::input_line(1, "wait"));
        }

        let got = inst.send_and_get("$locate 1").await;
        assert_eq!(got, "here\n");
        inst.deactivate(true);
    }

    #[tokio::test]
    async fn disambiguation_replays_silently_before_the_literal_line() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen2 = seen.clone();
        let (inst, _ev) = test_instance(
            move |line, host| {
                seen2.lock().push(line.to_string());
                if line.ends_with(":take lamp") {
                    host.write(b"<$t 1><$d take brass lamp></$t>");
                }
                true
            },
            test_store(),
        );
        let (p1, _rx1) = connected_player(10, "ada");
        inst.activate().unwrap();
        inst.add_player(&p1, "");

        inst.queue_input(&worker::input_line(1, "take lamp"));
        inst.queue_input(&worker::input_line(1, "brass"));
        // Let the worker chew through both lines.
        tokio::time::sleep(Duration::from_millis(150)).await;
        inst.deactivate(true);

        let seen = seen.lock().clone();
        let idx = seen
            .iter()
            .position(|l| l == "1:take lamp")
            .expect("literal first line");
        assert_eq!(seen[idx + 1], "$silent 1:take brass lamp");
        assert_eq!(seen[idx + 2], "1:brass");
    }

    #[tokio::test]
    async fn disambiguation_survives_interleaved_transaction() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen2 = seen.clone();
        let (inst, _ev) = test_instance(
            move |line, host| {
                seen2.lock().push(line.to_string());
                if line.ends_with(":take lamp") {
                    host.write(b"<$t 1><$d take brass lamp></$t>");
                }
                if line.starts_with("$locate") {
                    host.write(b"lab\n");
                }
                true
            },
            test_store(),
        );
        let (p1, _rx1) = connected_player(10, "ada");
        inst.activate().unwrap();
        inst.add_player(&p1, "");

        inst.queue_input(&worker::input_line(1, "take lamp"));
        // A transaction lands between the question and the answer.
        let got = inst.send_and_get("$locate 1").await;
        assert_eq!(got, "lab\n");
        inst.queue_input(&worker::input_line(1, "brass"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        inst.deactivate(true);

        let seen = seen.lock().clone();
        let idx = seen.iter().position(|l| l == "$locate 1").unwrap();
        assert!(seen[idx + 1..].contains(&"$silent 1:take brass lamp".to_string()));
        assert!(seen[idx + 1..].contains(&"1:brass".to_string()));
    }

    #[tokio::test]
    async fn overlong_input_lines_are_truncated() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen2 = seen.clone();
        let (inst, _ev) = test_instance(
            move |line, _host| {
                seen2.lock().push(line.to_string());
                true
            },
            test_store(),
        );
        inst.activate().unwrap();
        let long = "x".repeat(2 * MAX_INPUT_CHARS);
        inst.queue_input(&long);
        tokio::time::sleep(Duration::from_millis(100)).await;
        inst.deactivate(true);

        let seen = seen.lock().clone();
        assert_eq!(seen[0].chars().count(), MAX_INPUT_CHARS);
    }

    #[tokio::test]
    async fn worker_exit_reports_abandoned_players() {
        let (inst, mut ev) = test_instance(|line, _host| !line.ends_with(":halt"), test_store());
        let (p1, _rx1) = connected_player(10, "ada");
        inst.activate().unwrap();
        inst.add_player(&p1, "");

        inst.queue_input(&worker::input_line(1, "halt"));
        let cmd = ev.recv().await.unwrap();
        match cmd {
            Command::InstanceExited {
                key,
                abandoned,
                terminated,
                exit,
            } => {
                assert_eq!(key, "lab/default");
                assert_eq!(abandoned.len(), 1);
                assert_eq!(abandoned[0].id, 10);
                assert!(!terminated);
                assert_eq!(exit, WorkerExit::Halted);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(p1.state.read().instance.is_none());
    }

    #[tokio::test]
    async fn deactivate_is_idempotent_and_releases_transactions() {
        let (inst, _ev) = test_instance(
            |_line, _host| {
                std::thread::sleep(Duration::from_millis(500));
                true
            },
            test_store(),
        );
        inst.activate().unwrap();
        inst.activate().unwrap(); // idempotent

        inst.queue_input("1:spin");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let inst2 = inst.clone();
        let pending = tokio::spawn(async move { inst2.send_and_get("$locate 1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        inst.deactivate(true);
        inst.deactivate(true); // tolerates an exited thread
        let got = pending.await.unwrap();
        assert_eq!(got, "");
    }

    #[tokio::test]
    async fn watchdog_fires_exactly_once_per_episode() {
        let (inst, _ev) = test_instance(|_l, _h| true, test_store());
        inst.force_watchdog_deadline(Instant::now() - Duration::from_secs(1));

        let now = Instant::now();
        assert!(inst.frozen_once(now));
        assert!(!inst.frozen_once(now));
    }

    #[tokio::test]
    async fn unknown_registers_yield_sentinels() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.ends_with(":probe") {
                    let w = host.get_word("frobnicate", 0);
                    let t = host.get_text("frobnicate", "x");
                    let ok = host.put_word("frobnicate", 0, 1);
                    host.write(
                        format!("<$t 1>{} {} {}\n</$t>", w, t.is_none(), ok).as_bytes(),
                    );
                }
                true
            },
            test_store(),
        );
        let (p1, mut rx1) = connected_player(10, "ada");
        inst.activate().unwrap();
        inst.add_player(&p1, "");
        inst.queue_input(&worker::input_line(1, "probe"));
        assert_eq!(rx1.recv().await.unwrap(), "-1 true false");
        inst.deactivate(true);
    }

    #[tokio::test]
    async fn realmstore_round_trips_through_registers() {
        let (inst, _ev) = test_instance(
            |line, host| {
                if line.ends_with(":save") {
                    host.put_text("realmstore", "mood", "stormy");
                }
                if line.ends_with(":load") {
                    let v = host.get_text("realmstore", "mood").unwrap_or_default();
                    host.write(format!("<$t 1>{v}\n</$t>").as_bytes());
                }
                true
            },
            test_store(),
        );
        let (p1, mut rx1) = connected_player(10, "ada");
        inst.activate().unwrap();
        inst.add_player(&p1, "");
        inst.queue_input(&worker::input_line(1, "save"));
        inst.queue_input(&worker::input_line(1, "load"));
        assert_eq!(rx1.recv().await.unwrap(), "stormy");
        inst.deactivate(true);
    }

    #[tokio::test]
    async fn rte_interval_put_posts_a_reschedule() {
        let (inst, mut ev) = test_instance(
            |line, host| {
                if line.ends_with(":tick") {
                    assert!(host.put_word("rteinterval", 0, 30));
                }
                true
            },
            test_store(),
        );
        inst.activate().unwrap();
        let (p1, _rx1) = connected_player(10, "ada");
        inst.add_player(&p1, "");
        inst.queue_input(&worker::input_line(1, "tick"));

        let cmd = ev.recv().await.unwrap();
        match cmd {
            Command::SetEventInterval { key, secs } => {
                assert_eq!(key, "lab/default");
                assert_eq!(secs, 30);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(inst.rte_interval(), 30);
        inst.deactivate(true);
    }
}
