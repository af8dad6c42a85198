//! On-disk state: realm index, player index, and realm key/value
//! storage. All files are JSON and replaced atomically
//! (write-temp-then-rename), so a crash mid-save never corrupts an
//! index.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use realmproto::access::{AccessLevel, Privacy};

use crate::player::PlayerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRecord {
    pub player: PlayerId,
    pub level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmRecord {
    pub name: String,
    pub source: PathBuf,
    pub factory: String,
    pub owner: PlayerId,
    pub privacy: Privacy,
    #[serde(default)]
    pub acl: Vec<AclRecord>,
    #[serde(default)]
    pub condemned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub pass_hash: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
}

#[derive(Debug)]
pub struct Store {
    data_dir: PathBuf,
    /// Key/value namespaces (`realm:<name>` and
    /// `player:<realm>:<id>`), cached in memory and written through.
    kv: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Store {
    pub fn open(data_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir.join("kv"))?;
        std::fs::create_dir_all(data_dir.join("cache"))?;
        std::fs::create_dir_all(data_dir.join("realms"))?;
        std::fs::create_dir_all(data_dir.join("reports"))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            kv: Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Cached compiled image location for a realm.
    pub fn image_path(&self, realm_lc: &str) -> PathBuf {
        self.data_dir.join("cache").join(format!("{realm_lc}.img"))
    }

    /// Compiler diagnostics location for a realm.
    pub fn report_path(&self, realm_lc: &str) -> PathBuf {
        self.data_dir.join("reports").join(format!("{realm_lc}.txt"))
    }

    pub fn default_source_path(&self, realm_lc: &str) -> PathBuf {
        self.data_dir.join("realms").join(format!("{realm_lc}.src"))
    }

    pub fn load_realms(&self) -> std::io::Result<Vec<RealmRecord>> {
        read_json_or_default(&self.data_dir.join("realms.json"))
    }

    pub fn save_realms(&self, records: &[RealmRecord]) -> std::io::Result<()> {
        write_json_atomic(&self.data_dir.join("realms.json"), records)
    }

    pub fn load_players(&self) -> std::io::Result<Vec<PlayerRecord>> {
        read_json_or_default(&self.data_dir.join("players.json"))
    }

    pub fn save_players(&self, records: &[PlayerRecord]) -> std::io::Result<()> {
        write_json_atomic(&self.data_dir.join("players.json"), records)
    }

    pub fn kv_get(&self, namespace: &str, key: &str) -> Option<String> {
        let mut kv = self.kv.lock();
        let ns = self.namespace_mut(&mut kv, namespace);
        ns.get(key).cloned()
    }

    pub fn kv_put(&self, namespace: &str, key: &str, value: &str) {
        let snapshot = {
            let mut kv = self.kv.lock();
            let ns = self.namespace_mut(&mut kv, namespace);
            if value.is_empty() {
                ns.remove(key);
            } else {
                ns.insert(key.to_string(), value.to_string());
            }
            ns.clone()
        };
        let path = self.kv_path(namespace);
        if let Err(e) = write_json_atomic(&path, &snapshot) {
            warn!(namespace, err = %e, "kv write-through failed");
        }
    }

    /// Drop a realm's namespaces (realm deletion).
    pub fn kv_drop_realm(&self, realm_lc: &str) {
        let prefix_player = format!("player:{realm_lc}:");
        let ns_realm = format!("realm:{realm_lc}");
        let removed: Vec<String> = {
            let mut kv = self.kv.lock();
            let keys: Vec<String> = kv
                .keys()
                .filter(|k| *k == &ns_realm || k.starts_with(&prefix_player))
                .cloned()
                .collect();
            for k in &keys {
                kv.remove(k);
            }
            keys
        };
        for ns in removed {
            let _ = std::fs::remove_file(self.kv_path(&ns));
        }
        // Files may exist without having been loaded yet.
        let _ = std::fs::remove_file(self.kv_path(&ns_realm));
    }

    fn namespace_mut<'a>(
        &self,
        kv: &'a mut HashMap<String, HashMap<String, String>>,
        namespace: &str,
    ) -> &'a mut HashMap<String, String> {
        kv.entry(namespace.to_string())
            .or_insert_with(|| read_json_or_default(&self.kv_path(namespace)).unwrap_or_default())
    }

    fn kv_path(&self, namespace: &str) -> PathBuf {
        // Namespaces contain ':'; keep filenames tame.
        let safe = namespace.replace([':', '/', '\\'], "_");
        self.data_dir.join("kv").join(format!("{safe}.json"))
    }
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> std::io::Result<T> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e),
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realm_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(store.load_realms().unwrap().is_empty());
        let recs = vec![RealmRecord {
            name: "Lobby".into(),
            source: dir.path().join("lobby.src"),
            factory: "echo".into(),
            owner: 1,
            privacy: Privacy::Joinable,
            acl: vec![AclRecord {
                player: 7,
                level: AccessLevel::EditSource,
            }],
            condemned: false,
        }];
        store.save_realms(&recs).unwrap();

        let back = store.load_realms().unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].name, "Lobby");
        assert_eq!(back[0].acl[0].level, AccessLevel::EditSource);
    }

    #[test]
    fn player_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let recs = vec![PlayerRecord {
            id: 3,
            name: "Ada".into(),
            pass_hash: "$argon2id$stub".into(),
            admin: true,
            attrs: HashMap::from([("pos:lobby".to_string(), "center".to_string())]),
        }];
        store.save_players(&recs).unwrap();

        let back = store.load_players().unwrap();
        assert_eq!(back.len(), 1);
        assert!(back[0].admin);
        assert_eq!(back[0].attrs.get("pos:lobby").map(String::as_str), Some("center"));
    }

    #[test]
    fn kv_survives_reopen_and_deletes_on_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.kv_put("realm:lobby", "mood", "cheerful");
            assert_eq!(store.kv_get("realm:lobby", "mood").as_deref(), Some("cheerful"));
        }
        {
            let store = Store::open(dir.path()).unwrap();
            assert_eq!(store.kv_get("realm:lobby", "mood").as_deref(), Some("cheerful"));
            store.kv_put("realm:lobby", "mood", "");
            assert_eq!(store.kv_get("realm:lobby", "mood"), None);
        }
    }

    #[test]
    fn drop_realm_removes_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.kv_put("realm:lobby", "k", "v");
        store.kv_put("player:lobby:4", "seen", "yes");
        store.kv_drop_realm("lobby");
        assert_eq!(store.kv_get("realm:lobby", "k"), None);
        assert_eq!(store.kv_get("player:lobby:4", "seen"), None);
    }
}
