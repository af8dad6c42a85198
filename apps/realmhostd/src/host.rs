//! The host: registries, realm lifecycle, instance supervision, and
//! player placement. Connection tasks and the event loop both talk to
//! the world through this type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use dashmap::DashMap;
use parking_lot::Mutex;
use password_hash::{PasswordHash, SaltString};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use realmproto::access::{AccessLevel, Privacy};
use realmproto::worker::{knock_probe, locate_probe, TransferSpec, WorkerExit, WorkerFactory, PROBE_RTEVENT};
use schedq::SharedQueue;

use crate::compile::Compiler;
use crate::error::HostError;
use crate::events::{Command, TimedEvent};
use crate::instance::{instance_key, InstanceConfig, InstanceRuntime};
use crate::player::{Player, PlayerId, PlayerRegistry};
use crate::realm::{validate_name, Realm, RealmState};
use crate::store::{PlayerRecord, Store};

/// Instance name players land in when none is specified.
pub const DEFAULT_INSTANCE: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub data_dir: PathBuf,
    pub start_realm: String,
    pub admin_name: Option<String>,
    pub txn_timeout: Duration,
    pub watchdog_grace: Duration,
    pub compile_timeout: Duration,
    pub failure_threshold: u32,
    pub poll_interval: Duration,
    pub compiler_cmd: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4000".into(),
            data_dir: "data".into(),
            start_realm: "start".into(),
            admin_name: None,
            txn_timeout: Duration::from_secs(10),
            watchdog_grace: Duration::from_secs(15),
            compile_timeout: Duration::from_secs(60),
            failure_threshold: 3,
            poll_interval: Duration::from_millis(500),
            compiler_cmd: None,
        }
    }
}

pub struct Host {
    pub cfg: Config,
    pub players: PlayerRegistry,
    /// Realms by lowercased name.
    realms: DashMap<String, Arc<Realm>>,
    /// Active instances by `<realm_lc>/<name>`.
    instances: DashMap<String, Arc<InstanceRuntime>>,
    timers: SharedQueue<Instant, TimedEvent>,
    factories: HashMap<String, Arc<dyn WorkerFactory>>,
    compiler: Arc<dyn Compiler>,
    pub store: Arc<Store>,
    post: mpsc::UnboundedSender<Command>,
    /// Registered accounts by lowercased name.
    accounts: Mutex<HashMap<String, PlayerRecord>>,
    next_player_id: AtomicI64,
    /// Serializes realm lifecycle (create / swap / delete).
    admin_gate: tokio::sync::Mutex<()>,
}

impl Host {
    pub fn new(
        cfg: Config,
        store: Arc<Store>,
        compiler: Arc<dyn Compiler>,
        factories: HashMap<String, Arc<dyn WorkerFactory>>,
        post: mpsc::UnboundedSender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            players: PlayerRegistry::new(),
            realms: DashMap::new(),
            instances: DashMap::new(),
            timers: SharedQueue::new(),
            factories,
            compiler,
            store,
            post,
            accounts: Mutex::new(HashMap::new()),
            next_player_id: AtomicI64::new(1),
            admin_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Load persisted state and make sure the start realm exists.
    pub fn bootstrap(&self) -> Result<(), HostError> {
        let mut max_id: PlayerId = 0;
        for rec in self.store.load_players()? {
            max_id = max_id.max(rec.id);
            let admin = rec.admin
                || self
                    .cfg
                    .admin_name
                    .as_deref()
                    .is_some_and(|a| a.eq_ignore_ascii_case(&rec.name));
            let player = Player::new(rec.id, &rec.name, admin, false);
            player.state.write().attrs = rec.attrs.clone();
            self.players.insert(player);
            self.accounts
                .lock()
                .insert(rec.name.to_ascii_lowercase(), rec);
        }
        self.next_player_id.store(max_id + 1, Ordering::SeqCst);

        for rec in self.store.load_realms()? {
            let lc = rec.name.to_ascii_lowercase();
            let realm = Realm::from_record(&rec, self.store.image_path(&lc));
            self.realms.insert(lc, realm);
        }

        let start_lc = self.cfg.start_realm.to_ascii_lowercase();
        if !self.realms.contains_key(&start_lc) {
            let source = self.store.default_source_path(&start_lc);
            if !source.exists() {
                std::fs::write(&source, b"echo chamber\n")?;
            }
            let realm = Realm::from_parts(
                &self.cfg.start_realm,
                &source,
                &self.store.image_path(&start_lc),
                "echo",
                0,
                RealmState {
                    privacy: Privacy::Joinable,
                    ..RealmState::default()
                },
            );
            self.realms.insert(start_lc, realm);
            self.persist_realms();
            info!(realm = %self.cfg.start_realm, "created start realm");
        }
        info!(
            realms = self.realms.len(),
            accounts = self.accounts.lock().len(),
            "host bootstrapped"
        );
        Ok(())
    }

    pub fn post_command(&self, cmd: Command) {
        let _ = self.post.send(cmd);
    }

    pub fn realm(&self, name: &str) -> Option<Arc<Realm>> {
        self.realms
            .get(&name.trim().to_ascii_lowercase())
            .map(|r| r.clone())
    }

    pub fn realm_names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.realms.iter().map(|e| e.value().name.clone()).collect();
        v.sort();
        v
    }

    pub fn instance(&self, key: &str) -> Option<Arc<InstanceRuntime>> {
        self.instances.get(key).map(|i| i.clone())
    }

    pub fn start_realm(&self) -> Option<Arc<Realm>> {
        self.realm(&self.cfg.start_realm)
    }

    fn instance_cfg(&self) -> InstanceConfig {
        InstanceConfig {
            txn_timeout: self.cfg.txn_timeout,
            watchdog_grace: self.cfg.watchdog_grace,
        }
    }

    fn factory(&self, name: &str) -> Result<Arc<dyn WorkerFactory>, HostError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::WorkerLoad(format!("unknown worker factory: {name}")))
    }

    /// Compile the realm's source if the cached image is stale.
    async fn ensure_compiled(&self, realm: &Arc<Realm>) -> Result<(), HostError> {
        let fresh = match (
            std::fs::metadata(&realm.source).and_then(|m| m.modified()),
            std::fs::metadata(&realm.image).and_then(|m| m.modified()),
        ) {
            (Ok(src), Ok(img)) => img >= src,
            _ => false,
        };
        if fresh {
            return Ok(());
        }
        let report = self.store.report_path(&realm.name_lc);
        let outcome = self
            .compiler
            .compile(&realm.name, &realm.source, &realm.image, &report)
            .await;
        if outcome == crate::compile::CompileOutcome::Success {
            debug!(realm = %realm.name, "compiled");
            Ok(())
        } else {
            warn!(realm = %realm.name, ?outcome, "compile failed");
            Err(HostError::Compile(outcome))
        }
    }

    async fn spawn_instance(
        &self,
        realm: &Arc<Realm>,
        name: &str,
    ) -> Result<Arc<InstanceRuntime>, HostError> {
        if realm.is_condemned() {
            return Err(HostError::Condemned(realm.name.clone()));
        }
        validate_name(name)?;
        self.ensure_compiled(realm).await?;
        let factory = self.factory(&realm.factory)?;
        let inst = InstanceRuntime::new(
            realm.clone(),
            name,
            factory,
            realm.image.clone(),
            self.store.clone(),
            self.post.clone(),
            self.instance_cfg(),
        );
        inst.activate()?;
        self.instances.insert(inst.key().to_string(), inst.clone());
        info!(instance = %inst.key(), "instance started");
        Ok(inst)
    }

    pub async fn get_or_spawn(
        &self,
        realm: &Arc<Realm>,
        name: &str,
    ) -> Result<Arc<InstanceRuntime>, HostError> {
        let key = instance_key(&realm.name_lc, name);
        if let Some(inst) = self.instance(&key) {
            if inst.is_active() {
                return Ok(inst);
            }
            self.instances.remove_if(&key, |_, v| !v.is_active());
        }
        self.spawn_instance(realm, name).await
    }

    // ---- player placement -------------------------------------------------

    /// Move a player into a realm, leaving wherever they are first.
    pub async fn join_realm(
        &self,
        player: &Arc<Player>,
        realm_name: &str,
        instance_name: &str,
    ) -> Result<(), HostError> {
        let realm = self
            .realm(realm_name)
            .ok_or_else(|| HostError::UnknownRealm(realm_name.to_string()))?;
        let have = realm.effective_access(player);
        if !have.may_join() {
            return Err(HostError::PermissionDenied {
                need: AccessLevel::Invited,
                have,
            });
        }
        if realm.is_condemned() {
            return Err(HostError::Condemned(realm.name.clone()));
        }
        self.leave_current(player).await;
        let inst = self.get_or_spawn(&realm, instance_name).await?;
        let pos = player
            .state
            .read()
            .attrs
            .get(&position_attr(&realm.name_lc))
            .cloned()
            .unwrap_or_default();
        inst.add_player(player, &pos);
        Ok(())
    }

    /// Remove the player from their current instance, saving their
    /// in-realm position for the next visit.
    pub async fn leave_current(&self, player: &Arc<Player>) {
        let key = player.state.read().instance.clone();
        let Some(key) = key else { return };
        let Some(inst) = self.instance(&key) else {
            player.state.write().instance = None;
            return;
        };
        let Some(sid) = inst.session_of(player.id) else {
            player.state.write().instance = None;
            return;
        };
        if inst.is_active() {
            let answer = inst.send_and_get(&locate_probe(sid)).await;
            let pos = answer.lines().next().unwrap_or("").trim().to_string();
            if !pos.is_empty() {
                player
                    .state
                    .write()
                    .attrs
                    .insert(position_attr(&inst.realm.name_lc), pos);
            }
        }
        inst.remove_player(sid);
    }

    /// Last-resort placement: the start realm, or limbo if even that
    /// fails.
    pub async fn relocate_to_start(&self, player: &Arc<Player>, notice: &str) {
        player.send_line(notice);
        let Some(start) = self.start_realm() else {
            player.send_line("Nowhere to go; you drift in the void.");
            return;
        };
        match self.get_or_spawn(&start, DEFAULT_INSTANCE).await {
            Ok(inst) => {
                inst.add_player(player, "");
            }
            Err(e) => {
                error!(err = %e, "start realm unavailable");
                player.send_line("Nowhere to go; you drift in the void.");
            }
        }
    }

    // ---- event-loop entry points ------------------------------------------

    pub async fn dispatch(&self, cmd: Command) {
        match cmd {
            Command::Transfer { key, sid, spec } => self.handle_transfer(&key, sid, spec).await,
            Command::SetEventInterval { key, secs } => self.schedule_rte(&key, secs),
            Command::InstanceExited {
                key,
                abandoned,
                terminated,
                exit,
            } => {
                self.handle_instance_exited(&key, abandoned, terminated, exit)
                    .await
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_transfer(&self, key: &str, sid: i32, spec: TransferSpec) {
        let Some(inst) = self.instance(key) else { return };
        let Some((_, player)) = inst
            .joined_players()
            .into_iter()
            .find(|(s, _)| *s == sid)
        else {
            return;
        };
        if validate_name(&spec.instance).is_err() {
            warn!(instance = key, target = %spec.instance, "transfer to invalid instance name");
            return;
        }
        inst.remove_player(sid);
        match self.get_or_spawn(&inst.realm, &spec.instance).await {
            Ok(target) => {
                target.add_player(&player, &spec.token);
            }
            Err(e) => {
                warn!(instance = key, err = %e, "transfer target failed to start");
                self.relocate_to_start(&player, "A door slams shut; you are swept back.")
                    .await;
            }
        }
    }

    fn schedule_rte(&self, key: &str, secs: u32) {
        let Some(inst) = self.instance(key) else { return };
        if secs == 0 {
            inst.replace_rte_tombstone(None);
            return;
        }
        let tombstone = Arc::new(AtomicBool::new(false));
        inst.replace_rte_tombstone(Some(tombstone.clone()));
        let interval = Duration::from_secs(u64::from(secs));
        self.timers.enqueue(
            TimedEvent {
                key: key.to_string(),
                interval,
                tombstone,
            },
            Instant::now() + interval,
        );
    }

    pub fn next_timer_in(&self) -> Option<Duration> {
        self.timers
            .peek_priority()
            .ok()
            .map(|due| due.saturating_duration_since(Instant::now()))
    }

    /// Deliver due `$rtevent`s and reschedule them.
    pub fn sweep_timers(&self) {
        let now = Instant::now();
        while let Ok(Some((ev, _))) = self.timers.dequeue_if(|_, pri| *pri <= now) {
            if ev.tombstone.load(Ordering::SeqCst) {
                continue;
            }
            let Some(inst) = self.instance(&ev.key) else {
                continue;
            };
            if !inst.is_active() {
                continue;
            }
            inst.queue_probe(PROBE_RTEVENT);
            self.timers.enqueue(ev.clone(), now + ev.interval);
        }
    }

    /// Scan for frozen workers; each freeze episode is one failure.
    pub async fn sweep_watchdogs(&self) {
        let now = Instant::now();
        let snapshot: Vec<Arc<InstanceRuntime>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        for inst in snapshot {
            if inst.frozen_once(now) {
                self.handle_frozen(inst).await;
            }
        }
    }

    async fn handle_frozen(&self, inst: Arc<InstanceRuntime>) {
        warn!(instance = %inst.key(), "worker frozen past its grace period");
        let condemned_now = inst.realm.note_failure(self.cfg.failure_threshold);
        let players = inst.drain_sessions();
        inst.replace_rte_tombstone(None);
        inst.deactivate(true);
        self.instances
            .remove_if(inst.key(), |_, v| Arc::ptr_eq(v, &inst));
        if condemned_now {
            error!(realm = %inst.realm.name, "realm condemned after repeated failures");
            self.persist_realms();
        }
        self.replace_or_strand(&inst.realm, &inst.name, players, "The realm stops responding.")
            .await;
    }

    async fn handle_instance_exited(
        &self,
        key: &str,
        abandoned: Vec<Arc<Player>>,
        terminated: bool,
        exit: WorkerExit,
    ) {
        let restart_wanted = self
            .instance(key)
            .map(|i| i.restart_requested())
            .unwrap_or(false);
        self.instances.remove_if(key, |_, v| !v.is_active());
        if terminated {
            for p in abandoned {
                self.relocate_to_start(&p, "The realm has shut down.").await;
            }
            return;
        }

        let Some((realm_lc, name)) = key.split_once('/') else {
            return;
        };
        let Some(realm) = self.realm(realm_lc) else {
            for p in abandoned {
                self.relocate_to_start(&p, "The realm is gone.").await;
            }
            return;
        };
        if exit == WorkerExit::Faulted && realm.note_failure(self.cfg.failure_threshold) {
            error!(realm = %realm.name, "realm condemned after repeated failures");
            self.persist_realms();
        }
        if abandoned.is_empty() {
            // Nobody inside; the instance restarts on demand unless a
            // restart was explicitly asked for.
            if restart_wanted && !realm.is_condemned() {
                if let Err(e) = self.spawn_instance(&realm, name).await {
                    warn!(realm = %realm.name, err = %e, "requested restart failed");
                }
            }
            return;
        }
        self.replace_or_strand(&realm, name, abandoned, "The realm winks out around you.")
            .await;
    }

    /// Restart an instance and re-admit its players, or fall back to
    /// the start realm.
    async fn replace_or_strand(
        &self,
        realm: &Arc<Realm>,
        name: &str,
        players: Vec<Arc<Player>>,
        notice: &str,
    ) {
        if players.is_empty() {
            return;
        }
        if !realm.is_condemned() {
            match self.spawn_instance(realm, name).await {
                Ok(fresh) => {
                    for p in players {
                        p.send_line(notice);
                        p.send_line("It restarts around you.");
                        fresh.add_player(&p, "");
                    }
                    return;
                }
                Err(e) => warn!(realm = %realm.name, err = %e, "restart failed"),
            }
        }
        for p in players {
            p.send_line(notice);
            self.relocate_to_start(&p, "You are returned to where it all begins.")
                .await;
        }
    }

    pub async fn shutdown_all(&self) {
        let snapshot: Vec<Arc<InstanceRuntime>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        for inst in &snapshot {
            inst.drain_sessions();
            inst.request_shutdown();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        for inst in snapshot {
            inst.deactivate(true);
            self.instances
                .remove_if(inst.key(), |_, v| Arc::ptr_eq(v, &inst));
        }
    }

    // ---- realm lifecycle --------------------------------------------------

    /// Create a realm from source text, compile it, and verify the
    /// image loads. Nothing is registered unless every step succeeds.
    pub async fn load_realm(
        &self,
        name: &str,
        factory_name: &str,
        owner: PlayerId,
        source_text: &str,
    ) -> Result<Arc<Realm>, HostError> {
        let _gate = self.admin_gate.lock().await;
        validate_name(name)?;
        let lc = name.to_ascii_lowercase();
        if self.realms.contains_key(&lc) {
            return Err(HostError::DuplicateName(name.to_string()));
        }
        let factory = self.factory(factory_name)?;

        let source = self.store.default_source_path(&lc);
        tokio::fs::write(&source, source_text.as_bytes()).await?;
        let realm = Realm::from_parts(
            name,
            &source,
            &self.store.image_path(&lc),
            factory_name,
            owner,
            RealmState::default(),
        );
        self.ensure_compiled(&realm).await?;
        // A compiled image the interpreter rejects is fatal here, not
        // at first join.
        factory
            .load(&realm.image)
            .map_err(HostError::WorkerLoad)?;

        self.realms.insert(lc, realm.clone());
        self.persist_realms();
        info!(realm = %name, factory = factory_name, owner, "realm created");
        Ok(realm)
    }

    /// Hot swap: replace `to`'s program with `from`'s, migrating every
    /// player and preserving `to`'s name, ownership, and access
    /// settings. `from` is consumed.
    pub async fn replace_realm(&self, from_name: &str, to_name: &str) -> Result<(), HostError> {
        let _gate = self.admin_gate.lock().await;
        let from = self
            .realm(from_name)
            .ok_or_else(|| HostError::UnknownRealm(from_name.to_string()))?;
        let to = self
            .realm(to_name)
            .ok_or_else(|| HostError::UnknownRealm(to_name.to_string()))?;
        if Arc::ptr_eq(&from, &to) {
            return Err(HostError::Validation(
                "cannot replace a realm with itself".into(),
            ));
        }
        if from.factory != to.factory {
            return Err(HostError::Validation(format!(
                "factory mismatch: {} vs {}",
                from.factory, to.factory
            )));
        }

        // Export players with their positions, then wind everything
        // down: knock, a polite shutdown window, then the axe.
        let mut exported: Vec<(Arc<Player>, String, String)> = Vec::new();
        for inst in self.instances_of(&to.name_lc) {
            for (sid, player) in inst.joined_players() {
                let answer = inst.send_and_get(&locate_probe(sid)).await;
                let pos = answer.lines().next().unwrap_or("").trim().to_string();
                exported.push((player, pos, inst.name.clone()));
            }
            inst.queue_probe(&knock_probe("swap"));
            self.teardown_instance(&inst).await;
        }
        for inst in self.instances_of(&from.name_lc) {
            for (_, player) in inst.joined_players() {
                exported.push((player, String::new(), DEFAULT_INSTANCE.to_string()));
            }
            self.teardown_instance(&inst).await;
        }

        // Swap the program: staging source becomes the live source,
        // the stale image goes away, the staging entry is consumed.
        tokio::fs::rename(&from.source, &to.source).await?;
        let _ = tokio::fs::remove_file(&to.image).await;
        let _ = tokio::fs::remove_file(&from.image).await;
        self.realms.remove(&from.name_lc);
        self.store.kv_drop_realm(&from.name_lc);

        let rebuilt = self.ensure_compiled(&to).await;
        if let Err(e) = rebuilt {
            self.persist_realms();
            for (player, _, _) in exported {
                self.relocate_to_start(
                    &player,
                    "The realm failed to rebuild; you are returned to the start.",
                )
                .await;
            }
            return Err(e);
        }
        {
            // New code gets a clean slate.
            let mut st = to.state.write();
            st.condemned = false;
            st.failures = 0;
        }
        self.persist_realms();

        for (player, pos, inst_name) in exported {
            player.send_line("Reality flickers as the realm is rebuilt.");
            if !pos.is_empty() {
                player
                    .state
                    .write()
                    .attrs
                    .insert(position_attr(&to.name_lc), pos);
            }
            if let Err(e) = self.place(&player, &to, &inst_name).await {
                warn!(realm = %to.name, err = %e, "re-admission failed");
                self.relocate_to_start(&player, "You are returned to the start.")
                    .await;
            }
        }
        info!(from = from_name, to = to_name, "realm replaced");
        Ok(())
    }

    /// Remove a realm and everything it owns. Its players go back to
    /// the start realm.
    pub async fn delete_realm(&self, name: &str) -> Result<(), HostError> {
        let _gate = self.admin_gate.lock().await;
        let lc = name.trim().to_ascii_lowercase();
        if lc == self.cfg.start_realm.to_ascii_lowercase() {
            return Err(HostError::Validation(
                "the start realm cannot be deleted".into(),
            ));
        }
        let (_, realm) = self
            .realms
            .remove(&lc)
            .ok_or_else(|| HostError::UnknownRealm(name.to_string()))?;

        let mut stranded = Vec::new();
        for inst in self.instances_of(&lc) {
            stranded.extend(inst.joined_players().into_iter().map(|(_, p)| p));
            self.teardown_instance(&inst).await;
        }
        for player in stranded {
            self.relocate_to_start(&player, "The realm has been deleted.")
                .await;
        }

        let _ = tokio::fs::remove_file(&realm.source).await;
        let _ = tokio::fs::remove_file(&realm.image).await;
        let _ = tokio::fs::remove_file(self.store.report_path(&lc)).await;
        self.store.kv_drop_realm(&lc);
        self.persist_realms();
        info!(realm = %name, "realm deleted");
        Ok(())
    }

    fn instances_of(&self, realm_lc: &str) -> Vec<Arc<InstanceRuntime>> {
        let prefix = format!("{realm_lc}/");
        self.instances
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect()
    }

    async fn teardown_instance(&self, inst: &Arc<InstanceRuntime>) {
        // Drain before the shutdown probe: once the worker exits it
        // reports whatever sessions remain as abandoned, and these
        // players are already spoken for.
        inst.drain_sessions();
        inst.request_shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        inst.replace_rte_tombstone(None);
        inst.deactivate(true);
        self.instances
            .remove_if(inst.key(), |_, v| Arc::ptr_eq(v, inst));
    }

    async fn place(
        &self,
        player: &Arc<Player>,
        realm: &Arc<Realm>,
        instance_name: &str,
    ) -> Result<(), HostError> {
        let inst = self.get_or_spawn(realm, instance_name).await?;
        let pos = player
            .state
            .read()
            .attrs
            .get(&position_attr(&realm.name_lc))
            .cloned()
            .unwrap_or_default();
        inst.add_player(player, &pos);
        Ok(())
    }

    pub fn persist_realms(&self) {
        let mut records: Vec<_> = self.realms.iter().map(|e| e.value().to_record()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        if let Err(e) = self.store.save_realms(&records) {
            error!(err = %e, "failed to persist realm index");
        }
    }

    // ---- accounts ---------------------------------------------------------

    pub fn login(&self, name: &str, password: &str) -> Result<Arc<Player>, HostError> {
        let lc = name.trim().to_ascii_lowercase();
        let hash = {
            let accounts = self.accounts.lock();
            let rec = accounts
                .get(&lc)
                .ok_or_else(|| HostError::UnknownPlayer(name.to_string()))?;
            rec.pass_hash.clone()
        };
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| HostError::Validation(format!("stored hash unreadable: {e}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| HostError::Validation("wrong password".into()))?;
        self.players
            .get(&lc)
            .ok_or_else(|| HostError::UnknownPlayer(name.to_string()))
    }

    pub fn create_account(&self, name: &str, password: &str) -> Result<Arc<Player>, HostError> {
        let name = name.trim();
        validate_name(name)?;
        if password.len() < 4 {
            return Err(HostError::Validation(
                "password must be at least 4 characters".into(),
            ));
        }
        let lc = name.to_ascii_lowercase();
        if self.accounts.lock().contains_key(&lc) || self.players.get(&lc).is_some() {
            return Err(HostError::DuplicateName(name.to_string()));
        }
        let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| HostError::Validation(format!("hash failure: {e}")))?
            .to_string();

        let id = self.next_player_id.fetch_add(1, Ordering::SeqCst);
        let admin = self
            .cfg
            .admin_name
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(name));
        let rec = PlayerRecord {
            id,
            name: name.to_string(),
            pass_hash: hash,
            admin,
            attrs: HashMap::new(),
        };
        self.accounts.lock().insert(lc, rec);
        let player = Player::new(id, name, admin, false);
        self.players.insert(player.clone());
        self.persist_players();
        info!(player = name, id, admin, "account created");
        Ok(player)
    }

    pub fn guest_player(&self, wanted: &str) -> Arc<Player> {
        let id = self.players.next_guest_id();
        let base = if validate_name(wanted).is_ok() {
            wanted.to_string()
        } else {
            "Guest".to_string()
        };
        // Suffix until the name is free.
        let mut name = base.clone();
        let mut n = 1;
        loop {
            let player = Player::new(id, &name, false, true);
            if self.players.insert(player.clone()) {
                return player;
            }
            n += 1;
            name = format!("{base}{n}");
        }
    }

    /// Persist attrs back to the account and drop guests entirely.
    pub fn on_disconnect(&self, player: &Arc<Player>) {
        if player.guest {
            self.players.remove(&player.name);
            return;
        }
        let attrs = player.state.read().attrs.clone();
        let mut accounts = self.accounts.lock();
        if let Some(rec) = accounts.get_mut(&player.name.to_ascii_lowercase()) {
            rec.attrs = attrs;
        }
        drop(accounts);
        self.persist_players();
    }

    fn persist_players(&self) {
        let mut records: Vec<_> = self.accounts.lock().values().cloned().collect();
        records.sort_by_key(|r| r.id);
        if let Err(e) = self.store.save_players(&records) {
            error!(err = %e, "failed to persist player index");
        }
    }
}

fn position_attr(realm_lc: &str) -> String {
    format!("pos:{realm_lc}")
}
