//! Identity types for Engram entities
//!
//! Entity ids are prefixed, time-sorted and fixed-length: a lowercase table
//! prefix, an underscore, then the 26-character Crockford-base32 rendering of
//! a UUIDv7. Lexicographic order on the rendered form equals creation order,
//! so ids are monotonic per tenant-day without any extra bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// CROCKFORD BASE32 (ULID alphabet, order-preserving)
// ============================================================================

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Rendered length of the id body (26 chars cover 130 bits; the top 2 are 0).
pub const ID_BODY_LEN: usize = 26;

fn encode_base32(bytes: &[u8; 16]) -> String {
    let mut value = u128::from_be_bytes(*bytes);
    let mut out = [b'0'; ID_BODY_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value & 0x1f) as usize];
        value >>= 5;
    }
    // value is now the top 2 bits, which are always zero for a 128-bit input
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_base32(body: &str) -> Option<[u8; 16]> {
    if body.len() != ID_BODY_LEN {
        return None;
    }
    let mut value: u128 = 0;
    for ch in body.bytes() {
        let digit = match ch {
            b'0'..=b'9' => ch - b'0',
            b'A'..=b'H' => ch - b'A' + 10,
            b'J' | b'K' => ch - b'J' + 18,
            b'M' | b'N' => ch - b'M' + 20,
            b'P'..=b'T' => ch - b'P' + 22,
            b'V'..=b'Z' => ch - b'V' + 27,
            _ => return None,
        };
        value = value.checked_shl(5)?;
        value |= digit as u128;
    }
    Some(value.to_be_bytes())
}

// ============================================================================
// ENTITY ID TYPE SYSTEM
// ============================================================================

/// Trait for type-safe entity ids.
///
/// Each table has its own strongly-typed id so ids cannot be mixed up at
/// compile time. The rendered form is `<prefix>_<26-char base32>`.
pub trait MemoryIdType:
    Copy
    + Clone
    + Eq
    + PartialEq
    + Ord
    + PartialOrd
    + Hash
    + fmt::Debug
    + fmt::Display
    + FromStr
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The table prefix (e.g. "evt", "chk").
    const PREFIX: &'static str;

    /// Create an id from a UUID.
    fn from_uuid(uuid: Uuid) -> Self;

    /// Get the underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// Create a new time-sorted id.
    fn generate() -> Self {
        Self::from_uuid(Uuid::now_v7())
    }

    /// Create a nil (all zeros) id.
    fn nil() -> Self {
        Self::from_uuid(Uuid::nil())
    }

    /// Render the prefixed, fixed-length ASCII form.
    fn render(&self) -> String {
        format!("{}_{}", Self::PREFIX, encode_base32(self.as_uuid().as_bytes()))
    }
}

/// Error type for parsing entity ids from strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryIdParseError {
    pub prefix: &'static str,
    pub input: String,
}

impl fmt::Display for MemoryIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to parse '{}' as a {}_ id",
            self.input, self.prefix
        )
    }
}

impl std::error::Error for MemoryIdParseError {}

/// Macro to define a type-safe entity id newtype.
///
/// Generates a newtype wrapper around UUID that serializes as the prefixed
/// string form and parses back from it.
macro_rules! define_memory_id {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Uuid);

        impl MemoryIdType for $name {
            const PREFIX: &'static str = $prefix;

            fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.render())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.render())
            }
        }

        impl FromStr for $name {
            type Err = MemoryIdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let err = || MemoryIdParseError {
                    prefix: Self::PREFIX,
                    input: s.to_string(),
                };
                let body = s
                    .strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .ok_or_else(err)?;
                let bytes = decode_base32(body).ok_or_else(err)?;
                Ok(Self(Uuid::from_bytes(bytes)))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.render())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// ============================================================================
// ENTITY ID TYPES
// ============================================================================

define_memory_id!(EventId, "evt", "Type-safe id for event rows.");
define_memory_id!(ChunkId, "chk", "Type-safe id for chunk rows.");
define_memory_id!(DecisionId, "dec", "Type-safe id for decision rows.");
define_memory_id!(TaskId, "tsk", "Type-safe id for task rows.");
define_memory_id!(ArtifactId, "art", "Type-safe id for artifact rows.");
define_memory_id!(HandoffId, "ho", "Type-safe id for handoff rows.");
define_memory_id!(PrincipleId, "sp", "Type-safe id for semantic principle rows.");
define_memory_id!(NoteId, "kn", "Type-safe id for knowledge note rows.");
define_memory_id!(CapsuleId, "cap", "Type-safe id for capsule rows.");
define_memory_id!(EditId, "med", "Type-safe id for memory edit rows.");

// ============================================================================
// MEMORY REF (prefix-dispatched reference)
// ============================================================================

/// A reference to another memory entity, parsed by id prefix.
///
/// `refs` fields carry these: an event cites prior events/chunks, a decision
/// cites its evidence and (when superseding) the predecessor decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryRef {
    Event(EventId),
    Chunk(ChunkId),
    Decision(DecisionId),
    Artifact(ArtifactId),
    Handoff(HandoffId),
    Capsule(CapsuleId),
}

impl MemoryRef {
    /// Render the underlying prefixed id.
    pub fn render(&self) -> String {
        match self {
            MemoryRef::Event(id) => id.render(),
            MemoryRef::Chunk(id) => id.render(),
            MemoryRef::Decision(id) => id.render(),
            MemoryRef::Artifact(id) => id.render(),
            MemoryRef::Handoff(id) => id.render(),
            MemoryRef::Capsule(id) => id.render(),
        }
    }

    /// The decision id, if this ref points at a decision.
    pub fn as_decision(&self) -> Option<DecisionId> {
        match self {
            MemoryRef::Decision(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl FromStr for MemoryRef {
    type Err = MemoryIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("evt_") {
            s.parse().map(MemoryRef::Event)
        } else if s.starts_with("chk_") {
            s.parse().map(MemoryRef::Chunk)
        } else if s.starts_with("dec_") {
            s.parse().map(MemoryRef::Decision)
        } else if s.starts_with("art_") {
            s.parse().map(MemoryRef::Artifact)
        } else if s.starts_with("ho_") {
            s.parse().map(MemoryRef::Handoff)
        } else if s.starts_with("cap_") {
            s.parse().map(MemoryRef::Capsule)
        } else {
            Err(MemoryIdParseError {
                prefix: "ref",
                input: s.to_string(),
            })
        }
    }
}

impl Serialize for MemoryRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.render())
    }
}

impl<'de> Deserialize<'de> for MemoryRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// ISOLATION KEYS (caller-supplied)
// ============================================================================

/// Error for malformed isolation keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeKeyError {
    pub key: &'static str,
    pub reason: &'static str,
}

impl fmt::Display for ScopeKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.reason)
    }
}

impl std::error::Error for ScopeKeyError {}

/// Macro to define a caller-supplied isolation key newtype.
///
/// Keys are opaque ASCII strings: non-empty, at most 128 bytes, no control
/// characters. They are validated at the daemon boundary and treated as
/// opaque everywhere below it.
macro_rules! define_scope_key {
    ($name:ident, $key:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw key.
            pub fn new(raw: impl Into<String>) -> Result<Self, ScopeKeyError> {
                let raw = raw.into();
                if raw.is_empty() {
                    return Err(ScopeKeyError {
                        key: $key,
                        reason: "must be non-empty",
                    });
                }
                if raw.len() > 128 {
                    return Err(ScopeKeyError {
                        key: $key,
                        reason: "must be at most 128 bytes",
                    });
                }
                if !raw.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
                    return Err(ScopeKeyError {
                        key: $key,
                        reason: "must be printable ASCII",
                    });
                }
                Ok(Self(raw))
            }

            /// Borrow the raw key.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ScopeKeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_scope_key!(TenantId, "tenant_id", "Tenant isolation key. Every query filters by it.");
define_scope_key!(SessionId, "session_id", "Session key; write ordering is per session.");
define_scope_key!(AgentId, "agent_id", "Agent identity within a tenant.");

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_render_shape() {
        let id = EventId::generate();
        let rendered = id.render();
        assert!(rendered.starts_with("evt_"));
        assert_eq!(rendered.len(), "evt_".len() + ID_BODY_LEN);
        assert!(rendered.is_ascii());
    }

    #[test]
    fn test_id_roundtrip() {
        let id = ChunkId::generate();
        let parsed: ChunkId = id.render().parse().expect("rendered id should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_rejects_wrong_prefix() {
        let id = EventId::generate();
        let result: Result<ChunkId, _> = id.render().parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_id_serde_as_string() {
        let id = DecisionId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert!(json.starts_with("\"dec_"));
        let back: DecisionId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, back);
    }

    #[test]
    fn test_rendered_order_matches_uuid_order() {
        // UUIDv7 is time-ordered; the base32 rendering must preserve that.
        let a = EventId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = EventId::generate();
        assert!(a.as_uuid() < b.as_uuid());
        assert!(a.render() < b.render());
    }

    #[test]
    fn test_memory_ref_dispatch() {
        let chunk = ChunkId::generate();
        let parsed: MemoryRef = chunk.render().parse().expect("chunk ref should parse");
        assert_eq!(parsed, MemoryRef::Chunk(chunk));
        assert!("xyz_123".parse::<MemoryRef>().is_err());
    }

    #[test]
    fn test_scope_key_validation() {
        assert!(TenantId::new("t1").is_ok());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("a".repeat(129)).is_err());
        assert!(TenantId::new("bad\nkey").is_err());
    }

    #[test]
    fn test_base32_roundtrip_extremes() {
        for bytes in [[0u8; 16], [0xff; 16]] {
            let encoded = encode_base32(&bytes);
            assert_eq!(decode_base32(&encoded), Some(bytes));
        }
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Rendered ids always round-trip through the parser.
        #[test]
        fn prop_id_roundtrip(bytes in any::<[u8; 16]>()) {
            let id = EventId::from_uuid(Uuid::from_bytes(bytes));
            let parsed: EventId = id.render().parse().expect("roundtrip");
            prop_assert_eq!(id, parsed);
        }

        /// Base32 rendering preserves byte order.
        #[test]
        fn prop_base32_order_preserving(a in any::<[u8; 16]>(), b in any::<[u8; 16]>()) {
            let ea = encode_base32(&a);
            let eb = encode_base32(&b);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }
    }
}
