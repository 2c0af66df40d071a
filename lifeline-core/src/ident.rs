use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::OnceLock;

use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// A stable 64-bit identity derived from a human-readable dotted path
/// (e.g. `"MainPG/Startup"`).
///
/// Two identifiers compare by hash only, which makes them cheap to copy
/// through shared memory and atomics. The hash is the first eight bytes of
/// the SHA-256 of the path, so it is stable across toolchains and machines.
/// Collisions cannot be ruled out; configuration load registers every name
/// it sees and rejects a configuration that produces two different strings
/// with the same hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u64);

/// Process-wide reverse mapping hash → original string, for logging only.
fn registry() -> &'static Mutex<HashMap<u64, String>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn hash_of(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap_or([0u8; 8]))
}

impl Identifier {
    /// The identifier of the empty string. Used as the "nothing requested"
    /// sentinel in pending-state slots.
    pub fn empty() -> Self {
        Identifier(hash_of(""))
    }

    /// Hash `id` and record the reverse mapping for logging.
    pub fn new(id: &str) -> Self {
        let hash = hash_of(id);
        let mut map = match registry().lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(hash).or_insert_with(|| id.to_string());
        Identifier(hash)
    }

    /// Hash `id`, rejecting a collision with a previously registered name.
    /// Configuration load uses this so that identity equality stays
    /// equivalent to string equality for every name actually in use.
    pub fn try_new(id: &str) -> Result<Self, CoreError> {
        let hash = hash_of(id);
        let mut map = match registry().lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        match map.entry(hash) {
            Entry::Vacant(slot) => {
                slot.insert(id.to_string());
                Ok(Identifier(hash))
            }
            Entry::Occupied(existing) if existing.get() == id => Ok(Identifier(hash)),
            Entry::Occupied(existing) => Err(CoreError::IdentifierCollision {
                first: existing.get().clone(),
                second: id.to_string(),
            }),
        }
    }

    /// Rebuild an identifier from a raw hash, e.g. one read back out of a
    /// shared-memory message. No registration happens.
    pub fn from_raw(hash: u64) -> Self {
        Identifier(hash)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The registered string for this identifier, if any.
    pub fn resolve(&self) -> Option<String> {
        let map = match registry().lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&self.0).cloned()
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Identifier::empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "#{:016x}", self.0),
        }
    }
}

// Debug delegates to Display so log output shows names, not hashes.
impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_hash_equal() {
        let a = Identifier::new("MainPG/Startup");
        let b = Identifier::new("MainPG/Startup");
        assert_eq!(a, b);
        assert_eq!(a.raw(), b.raw());
    }

    #[test]
    fn distinct_strings_hash_distinct() {
        let a = Identifier::new("MainPG/Startup");
        let b = Identifier::new("MainPG/Off");
        assert_ne!(a, b);
    }

    #[test]
    fn resolves_registered_name() {
        let a = Identifier::new("PgA/Recovery");
        assert_eq!(a.resolve().as_deref(), Some("PgA/Recovery"));
        assert_eq!(format!("{a}"), "PgA/Recovery");
    }

    #[test]
    fn raw_round_trip_compares_equal() {
        let a = Identifier::new("PgB");
        let b = Identifier::from_raw(a.raw());
        assert_eq!(a, b);
    }

    #[test]
    fn try_new_accepts_re_registration() {
        let a = Identifier::try_new("PgC").unwrap();
        let b = Identifier::try_new("PgC").unwrap();
        assert_eq!(a, b);
    }
}
