//! Realm privacy and the access-control lattice.

use serde::{Deserialize, Serialize};

/// How visible a realm is to players with no ACL entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    #[default]
    Private,
    Hidden,
    Public,
    Joinable,
    Viewable,
}

impl Privacy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => Some(Privacy::Private),
            "hidden" => Some(Privacy::Hidden),
            "public" => Some(Privacy::Public),
            "joinable" => Some(Privacy::Joinable),
            "viewable" => Some(Privacy::Viewable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Privacy::Private => "private",
            Privacy::Hidden => "hidden",
            Privacy::Public => "public",
            Privacy::Joinable => "joinable",
            Privacy::Viewable => "viewable",
        }
    }

    /// The access level a player gets from privacy alone.
    pub fn implied_level(self) -> AccessLevel {
        match self {
            Privacy::Private => AccessLevel::Invalid,
            Privacy::Hidden => AccessLevel::Hidden,
            Privacy::Public => AccessLevel::Visible,
            Privacy::Joinable => AccessLevel::Invited,
            Privacy::Viewable => AccessLevel::ViewSource,
        }
    }
}

/// Single total order; every realm operation gates on "at least" some
/// level. `Owner` is the ceiling shared by the realm owner and admins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Invalid,
    Banned,
    Hidden,
    Visible,
    Invited,
    ViewSource,
    EditSource,
    EditSettings,
    EditAccess,
    Owner,
}

impl AccessLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invalid" => Some(AccessLevel::Invalid),
            "banned" => Some(AccessLevel::Banned),
            "hidden" => Some(AccessLevel::Hidden),
            "visible" => Some(AccessLevel::Visible),
            "invited" => Some(AccessLevel::Invited),
            "viewsource" => Some(AccessLevel::ViewSource),
            "editsource" => Some(AccessLevel::EditSource),
            "editsettings" => Some(AccessLevel::EditSettings),
            "editaccess" => Some(AccessLevel::EditAccess),
            "owner" => Some(AccessLevel::Owner),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Invalid => "invalid",
            AccessLevel::Banned => "banned",
            AccessLevel::Hidden => "hidden",
            AccessLevel::Visible => "visible",
            AccessLevel::Invited => "invited",
            AccessLevel::ViewSource => "viewsource",
            AccessLevel::EditSource => "editsource",
            AccessLevel::EditSettings => "editsettings",
            AccessLevel::EditAccess => "editaccess",
            AccessLevel::Owner => "owner",
        }
    }

    /// Numeric rank, exposed to workers through the `accesslevel`
    /// register.
    pub fn rank(self) -> i32 {
        self as i32
    }

    pub fn may_join(self) -> bool {
        self >= AccessLevel::Invited
    }

    pub fn may_view_source(self) -> bool {
        self >= AccessLevel::ViewSource
    }

    pub fn may_edit_settings(self) -> bool {
        self >= AccessLevel::EditSettings
    }
}

/// Resolve a player's effective access to a realm.
///
/// Admin/owner override everything; an explicit ACL entry (including
/// `Banned`) beats privacy; otherwise privacy implies the level.
pub fn effective_access(
    is_admin: bool,
    is_owner: bool,
    acl_entry: Option<AccessLevel>,
    privacy: Privacy,
) -> AccessLevel {
    if is_admin || is_owner {
        return AccessLevel::Owner;
    }
    if let Some(level) = acl_entry {
        return level;
    }
    privacy.implied_level()
}
