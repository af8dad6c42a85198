//! Side-channel register vocabulary.
//!
//! Workers query/update host state through named get/put word/text
//! operations. The vocabulary is fixed; unknown names must be
//! rejected with a sentinel (`-1` / `None` / `false`), never treated
//! as fatal.

/// Word sentinel for unknown registers or failed reads.
pub const WORD_SENTINEL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Seconds since local midnight.
    TimeOfDay,
    /// Day of month, 1-31.
    Day,
    /// Month, 1-12.
    Month,
    /// Four-digit year.
    Year,
    /// Day of week, 0 = Sunday.
    Weekday,
    /// Selected player's idle seconds.
    IdleTime,
    /// Selected player's effective access rank in the owning realm.
    AccessLevel,
    /// Real-time event interval in seconds; putting it reschedules
    /// the instance's timer (0 cancels).
    RteInterval,
    /// Selected player's string attributes.
    Attr,
    /// Per-realm persistent key/value text.
    RealmStore,
    /// Per-player (within this realm) persistent key/value text.
    PlayerStore,
}

impl Register {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "timeofday" => Some(Register::TimeOfDay),
            "day" => Some(Register::Day),
            "month" => Some(Register::Month),
            "year" => Some(Register::Year),
            "weekday" => Some(Register::Weekday),
            "idletime" => Some(Register::IdleTime),
            "accesslevel" => Some(Register::AccessLevel),
            "rteinterval" => Some(Register::RteInterval),
            "attr" => Some(Register::Attr),
            "realmstore" => Some(Register::RealmStore),
            "playerstore" => Some(Register::PlayerStore),
            _ => None,
        }
    }

    /// Registers a worker may write through `put_word`/`put_text`.
    pub fn writable(self) -> bool {
        matches!(
            self,
            Register::RteInterval | Register::Attr | Register::RealmStore | Register::PlayerStore
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_parse_case_insensitively() {
        assert_eq!(Register::parse("timeofday"), Some(Register::TimeOfDay));
        assert_eq!(Register::parse("RteInterval"), Some(Register::RteInterval));
        assert_eq!(Register::parse(" attr "), Some(Register::Attr));
    }

    #[test]
    fn unknown_names_are_rejected_not_fatal() {
        assert_eq!(Register::parse("frobnicate"), None);
        assert_eq!(Register::parse(""), None);
    }

    #[test]
    fn only_mutable_registers_are_writable() {
        assert!(Register::RteInterval.writable());
        assert!(Register::PlayerStore.writable());
        assert!(!Register::TimeOfDay.writable());
        assert!(!Register::AccessLevel.writable());
    }
}
