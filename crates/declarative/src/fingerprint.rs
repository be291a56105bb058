//! Content hashes used to detect changes between applies
//!
//! Fingerprints are persisted next to each record, so sensitive literals
//! never enter them in a form that can be checked offline. With a
//! [`FingerprintKey`] they are sealed with a keyed hash; without one they
//! are left out entirely and a credential change goes unnoticed.

use crate::backend::Properties;
use crate::resource::{Resource, ResourceType};
use serde_json::{Value as Json, json};
use std::fmt;
use uuid::Uuid;

const KEY_CONTEXT: &str = "stackform 2026-01 sensitive fingerprint key";
const UNSEALED: &str = "***";

/// Per-stack key for sealing sensitive values into fingerprints
///
/// Must be kept apart from the records it protects.
#[derive(Clone, PartialEq, Eq)]
pub struct FingerprintKey([u8; blake3::KEY_LEN]);

impl FingerprintKey {
    pub fn generate() -> Self {
        let mut material = [0_u8; 32];
        material[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        material[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self(blake3::derive_key(KEY_CONTEXT, &material))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex.trim())
            .ok()
            .map(|hash| Self(*hash.as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    fn seal(&self, secret: &str) -> String {
        blake3::keyed_hash(&self.0, secret.as_bytes())
            .to_hex()
            .to_string()
    }
}

impl fmt::Debug for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FingerprintKey(***)")
    }
}

/// Stand-in for a sensitive literal inside a fingerprint
pub fn seal(key: Option<&FingerprintKey>, secret: &str) -> String {
    key.map_or_else(|| UNSEALED.to_string(), |key| key.seal(secret))
}

fn hash(value: &Json) -> String {
    // serde_json maps are ordered (no preserve_order), so output is canonical
    blake3::hash(value.to_string().as_bytes())
        .to_hex()
        .to_string()
}

/// Hash of a declaration: type, properties with references left symbolic,
/// and explicit dependencies
pub fn declared(resource: &Resource, key: Option<&FingerprintKey>) -> String {
    let properties: serde_json::Map<String, Json> = resource
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.canonical(key)))
        .collect();
    let depends_on: Vec<&str> = resource.depends_on.iter().map(|d| d.as_str()).collect();

    hash(&json!({
        "type": resource.kind.as_str(),
        "properties": properties,
        "depends_on": depends_on,
    }))
}

/// Hash of resolved properties, as the backend would receive them
///
/// Callers pass properties resolved with sensitive values sealed.
pub fn resolved(kind: &ResourceType, properties: &Properties) -> String {
    hash(&json!({
        "type": kind.as_str(),
        "properties": properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Reference, Value};

    #[test]
    fn test_declared_fingerprint_is_stable_and_sensitive_to_changes() {
        let a = Resource::new("Sg", ResourceType::SecurityGroup).with("vpc_id", Reference::id("VPC"));
        let b = a.clone();
        assert_eq!(declared(&a, None), declared(&b, None));

        let c = a.clone().with("description", "db tier");
        assert_ne!(declared(&a, None), declared(&c, None));

        let d = a.clone().depends_on("Role");
        assert_ne!(declared(&a, None), declared(&d, None));
    }

    #[test]
    fn test_resolved_fingerprint_ignores_insertion_order() {
        let mut first = Properties::new();
        first.insert("a".into(), json!(1));
        first.insert("b".into(), json!("x"));
        let mut second = Properties::new();
        second.insert("b".into(), json!("x"));
        second.insert("a".into(), json!(1));

        assert_eq!(
            resolved(&ResourceType::Subnet, &first),
            resolved(&ResourceType::Subnet, &second)
        );
        assert_ne!(
            resolved(&ResourceType::Subnet, &first),
            resolved(&ResourceType::RouteTable, &first)
        );
    }

    fn database(password: &str) -> Resource {
        Resource::new("Db", ResourceType::Database)
            .with("master_user_password", Value::sensitive(password))
    }

    #[test]
    fn test_password_cannot_be_confirmed_without_the_key() {
        let key = FingerprintKey::generate();
        let stored = declared(&database("hunter2"), Some(&key));

        // an attacker holding the record but not the key
        for guess in ["password", "admin", "hunter2"] {
            assert_ne!(declared(&database(guess), None), stored);
            assert_ne!(
                declared(&database(guess), Some(&FingerprintKey::generate())),
                stored
            );
        }
        assert!(!stored.contains(blake3::hash(b"hunter2").to_hex().as_str()));
    }

    #[test]
    fn test_keyed_fingerprint_tracks_password_changes() {
        let key = FingerprintKey::generate();
        assert_eq!(
            declared(&database("hunter2"), Some(&key)),
            declared(&database("hunter2"), Some(&key))
        );
        assert_ne!(
            declared(&database("hunter2"), Some(&key)),
            declared(&database("hunter3"), Some(&key))
        );

        // without a key only the presence of a credential is recorded
        assert_eq!(
            declared(&database("hunter2"), None),
            declared(&database("hunter3"), None)
        );
    }

    #[test]
    fn test_key_hex_round_trip() {
        let key = FingerprintKey::generate();
        assert_eq!(FingerprintKey::from_hex(&key.to_hex()), Some(key.clone()));
        assert_eq!(FingerprintKey::from_hex("not hex"), None);
        assert_eq!(format!("{key:?}"), "FingerprintKey(***)");
    }
}
