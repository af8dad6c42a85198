//! Realm definitions: named, owned, access-controlled programs.
//!
//! A realm is the unit of naming and storage; running copies of it
//! are instances (see `instance`). Mutable settings live behind one
//! lock so compile/swap paths can snapshot them cheaply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use realmproto::access::{effective_access, AccessLevel, Privacy};

use crate::error::HostError;
use crate::player::{Player, PlayerId};
use crate::store::{AclRecord, RealmRecord};

#[derive(Debug, Clone)]
pub struct RealmState {
    pub privacy: Privacy,
    pub acl: HashMap<PlayerId, AccessLevel>,
    pub condemned: bool,
    /// Consecutive runtime failures since the last clean run.
    pub failures: u32,
}

impl Default for RealmState {
    fn default() -> Self {
        Self {
            privacy: Privacy::Private,
            acl: HashMap::new(),
            condemned: false,
            failures: 0,
        }
    }
}

#[derive(Debug)]
pub struct Realm {
    pub name: String,
    pub name_lc: String,
    pub source: PathBuf,
    pub image: PathBuf,
    pub factory: String,
    pub owner: PlayerId,
    pub state: RwLock<RealmState>,
}

impl Realm {
    pub fn from_parts(
        name: &str,
        source: &Path,
        image: &Path,
        factory: &str,
        owner: PlayerId,
        state: RealmState,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            name_lc: name.to_ascii_lowercase(),
            source: source.to_path_buf(),
            image: image.to_path_buf(),
            factory: factory.to_string(),
            owner,
            state: RwLock::new(state),
        })
    }

    pub fn from_record(rec: &RealmRecord, image: PathBuf) -> Arc<Self> {
        Self::from_parts(
            &rec.name,
            &rec.source,
            &image,
            &rec.factory,
            rec.owner,
            RealmState {
                privacy: rec.privacy,
                acl: rec.acl.iter().map(|a| (a.player, a.level)).collect(),
                condemned: rec.condemned,
                failures: 0,
            },
        )
    }

    pub fn to_record(&self) -> RealmRecord {
        let st = self.state.read();
        let mut acl: Vec<AclRecord> = st
            .acl
            .iter()
            .map(|(&player, &level)| AclRecord { player, level })
            .collect();
        acl.sort_by_key(|a| a.player);
        RealmRecord {
            name: self.name.clone(),
            source: self.source.clone(),
            factory: self.factory.clone(),
            owner: self.owner,
            privacy: st.privacy,
            acl,
            condemned: st.condemned,
        }
    }

    pub fn effective_access(&self, player: &Player) -> AccessLevel {
        let st = self.state.read();
        effective_access(
            player.admin,
            player.id == self.owner,
            st.acl.get(&player.id).copied(),
            st.privacy,
        )
    }

    pub fn is_condemned(&self) -> bool {
        self.state.read().condemned
    }

    /// Record one runtime failure; condemns the realm when the count
    /// reaches `threshold`. Returns true if this call condemned it.
    pub fn note_failure(&self, threshold: u32) -> bool {
        let mut st = self.state.write();
        st.failures += 1;
        if !st.condemned && st.failures >= threshold {
            st.condemned = true;
            true
        } else {
            false
        }
    }

    /// A clean (uncounted) run resets the failure streak.
    pub fn note_clean_run(&self) {
        self.state.write().failures = 0;
    }

    pub fn set_privacy(&self, privacy: Privacy) {
        self.state.write().privacy = privacy;
    }

    /// Set or clear (with `None`) a player's ACL entry.
    pub fn set_acl(&self, player: PlayerId, level: Option<AccessLevel>) {
        let mut st = self.state.write();
        match level {
            Some(level) => {
                st.acl.insert(player, level);
            }
            None => {
                st.acl.remove(&player);
            }
        }
    }
}

/// Realm and instance names share one shape: short identifiers, no
/// whitespace, safe to embed in filenames and instance keys.
pub fn validate_name(name: &str) -> Result<(), HostError> {
    if name.is_empty() || name.len() > 32 {
        return Err(HostError::Validation(format!(
            "name must be 1-32 characters: {name:?}"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !first.is_ascii_alphanumeric() {
        return Err(HostError::Validation(format!(
            "name must start with a letter or digit: {name:?}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(HostError::Validation(format!(
            "name may only contain letters, digits, '_' and '-': {name:?}"
        )));
    }
    Ok(())
}
