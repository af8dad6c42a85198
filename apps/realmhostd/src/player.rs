use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

pub type PlayerId = i64;

/// A live transport session. Created on accept, dropped on disconnect.
#[derive(Debug)]
pub struct Connection {
    pub tx: mpsc::UnboundedSender<String>,
    pub started: Instant,
    last_input: Mutex<Instant>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        let now = Instant::now();
        Self {
            tx,
            started: now,
            last_input: Mutex::new(now),
        }
    }

    pub fn note_input(&self) {
        *self.last_input.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_input.lock().elapsed()
    }

    pub fn connected(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn send(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}

#[derive(Debug, Default)]
pub struct PlayerState {
    pub attrs: HashMap<String, String>,
    pub conn: Option<Arc<Connection>>,
    /// Registry key of the occupied instance, if any.
    pub instance: Option<String>,
    pub last_command: Option<String>,
}

/// An account or guest actor. Negative ids are ephemeral (guests and
/// system actors); registered players keep their id forever.
#[derive(Debug)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub admin: bool,
    pub guest: bool,
    pub state: RwLock<PlayerState>,
}

impl Player {
    pub fn new(id: PlayerId, name: &str, admin: bool, guest: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            admin,
            guest,
            state: RwLock::new(PlayerState::default()),
        })
    }

    /// Deliver one output line if a connection is bound; otherwise the
    /// line is dropped silently.
    pub fn send_line(&self, line: &str) {
        if let Some(conn) = self.state.read().conn.as_ref() {
            conn.send(line);
        }
    }

    pub fn idle(&self) -> Option<Duration> {
        self.state.read().conn.as_ref().map(|c| c.idle())
    }
}

/// Players by lowercased name, with an id index on the side.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    by_name: DashMap<String, Arc<Player>>,
    by_id: DashMap<PlayerId, Arc<Player>>,
    next_guest: AtomicI64,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            next_guest: AtomicI64::new(-1),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Player>> {
        self.by_name.get(&name.trim().to_ascii_lowercase()).map(|p| p.clone())
    }

    pub fn get_by_id(&self, id: PlayerId) -> Option<Arc<Player>> {
        self.by_id.get(&id).map(|p| p.clone())
    }

    /// Insert a player; fails (returns false) on a name collision.
    pub fn insert(&self, player: Arc<Player>) -> bool {
        let key = player.name.to_ascii_lowercase();
        match self.by_name.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(player.clone());
                self.by_id.insert(player.id, player);
                true
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Player>> {
        let (_, p) = self.by_name.remove(&name.trim().to_ascii_lowercase())?;
        self.by_id.remove(&p.id);
        Some(p)
    }

    /// Allocate the next guest id (negative, counting down).
    pub fn next_guest_id(&self) -> PlayerId {
        self.next_guest.fetch_sub(1, Ordering::Relaxed)
    }

    pub fn connected(&self) -> Vec<Arc<Player>> {
        self.by_name
            .iter()
            .filter(|e| e.value().state.read().conn.is_some())
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> mpsc::UnboundedSender<String> {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[test]
    fn registry_is_case_insensitive_and_unique() {
        let reg = PlayerRegistry::new();
        assert!(reg.insert(Player::new(1, "Ada", false, false)));
        assert!(!reg.insert(Player::new(2, "ada", false, false)));
        assert_eq!(reg.get("ADA").unwrap().id, 1);
        assert_eq!(reg.get_by_id(1).unwrap().name, "Ada");
        reg.remove("aDa").unwrap();
        assert!(reg.get("ada").is_none());
        assert!(reg.get_by_id(1).is_none());
    }

    #[test]
    fn guest_ids_count_down_from_minus_one() {
        let reg = PlayerRegistry::new();
        assert_eq!(reg.next_guest_id(), -1);
        assert_eq!(reg.next_guest_id(), -2);
    }

    #[test]
    fn send_line_without_connection_is_dropped() {
        let p = Player::new(1, "ada", false, false);
        p.send_line("hello");

        p.state.write().conn = Some(Arc::new(Connection::new(channel())));
        p.send_line("hello again");
    }
}
