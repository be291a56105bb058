//! Property values and symbolic references between resources
//!
//! A property is either a literal, a reference to another resource's
//! identity or runtime attribute, or an interpolation that concatenates
//! resolved parts. References are values, so the dependency graph can be
//! built by walking properties instead of tracking object identity.

use crate::fingerprint::{self, FingerprintKey};
use crate::resource::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute of a resource that a reference points at
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Attribute {
    /// Stable identifier, assigned as soon as the create call is accepted
    Id,
    /// Runtime attribute, only known once the resource is ready
    Runtime(String),
}

impl Attribute {
    /// Whether this attribute resolves before the target is ready
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Id)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id => write!(f, "Id"),
            Self::Runtime(name) => write!(f, "{name}"),
        }
    }
}

/// A pointer from a property to another resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub target: ResourceId,
    pub attribute: Attribute,
}

impl Reference {
    /// Reference to the target's stable identifier
    pub fn id(target: impl Into<ResourceId>) -> Self {
        Self {
            target: target.into(),
            attribute: Attribute::Id,
        }
    }

    /// Reference to a runtime attribute of the target (e.g. `DnsName`)
    pub fn attr(target: impl Into<ResourceId>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: Attribute::Runtime(name.into()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Deploy-wide value supplied by the [`DeployContext`](crate::DeployContext)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContextKey {
    Region,
    Account,
    Environment,
    StackName,
}

impl ContextKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Region => "region",
            Self::Account => "account",
            Self::Environment => "environment",
            Self::StackName => "stack_name",
        }
    }
}

/// A declared property value
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Another resource's identifier or runtime attribute
    Ref(Reference),
    /// Resolved parts concatenated into one string
    Join(Vec<Value>),
    /// A deploy context value such as region or account
    Context(ContextKey),
    /// The resolved inner value encoded as JSON text
    ToJson(Box<Value>),
    /// Write-only credential; never displayed or logged
    Sensitive(String),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn join(parts: impl IntoIterator<Item = Value>) -> Self {
        Self::Join(parts.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn to_json(inner: Value) -> Self {
        Self::ToJson(Box::new(inner))
    }

    pub fn sensitive(secret: impl Into<String>) -> Self {
        Self::Sensitive(secret.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// All references contained in this value, depth-first
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) | Self::Join(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            Self::ToJson(inner) => inner.collect_references(out),
            Self::Bool(_)
            | Self::Integer(_)
            | Self::String(_)
            | Self::Context(_)
            | Self::Sensitive(_) => {}
        }
    }

    /// Whether a sensitive literal appears anywhere in this value
    pub fn contains_sensitive(&self) -> bool {
        match self {
            Self::Sensitive(_) => true,
            Self::List(items) | Self::Join(items) => items.iter().any(Value::contains_sensitive),
            Self::Map(entries) => entries.values().any(Value::contains_sensitive),
            Self::ToJson(inner) => inner.contains_sensitive(),
            _ => false,
        }
    }

    /// Canonical JSON form of the declaration, used for fingerprints.
    ///
    /// References stay symbolic and sensitive literals are sealed with
    /// `key` (or masked without one), so the result is safe to store.
    pub fn canonical(&self, key: Option<&FingerprintKey>) -> serde_json::Value {
        use serde_json::{Value as Json, json};

        match self {
            Self::Bool(b) => Json::Bool(*b),
            Self::Integer(i) => json!(i),
            Self::String(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(items.iter().map(|v| v.canonical(key)).collect()),
            Self::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.canonical(key)))
                    .collect(),
            ),
            Self::Ref(r) => json!({ "$ref": r.to_string() }),
            Self::Join(parts) => {
                json!({ "$join": parts.iter().map(|v| v.canonical(key)).collect::<Vec<_>>() })
            }
            Self::Context(key) => json!({ "$context": key.as_str() }),
            Self::ToJson(inner) => json!({ "$json": inner.canonical(key) }),
            Self::Sensitive(secret) => json!({ "$sensitive": fingerprint::seal(key, secret) }),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Integer(i) => write!(f, "Integer({i})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(entries) => f.debug_map().entries(entries).finish(),
            Self::Ref(r) => write!(f, "Ref({r})"),
            Self::Join(parts) => f.debug_tuple("Join").field(parts).finish(),
            Self::Context(key) => write!(f, "Context({})", key.as_str()),
            Self::ToJson(inner) => f.debug_tuple("ToJson").field(inner).finish(),
            Self::Sensitive(_) => write!(f, "Sensitive(***)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "{s}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Ref(r) => write!(f, "${{{r}}}"),
            Self::Join(parts) => {
                for part in parts {
                    write!(f, "{part}")?;
                }
                Ok(())
            }
            Self::Context(key) => write!(f, "${{{}}}", key.as_str()),
            Self::ToJson(inner) => write!(f, "json({inner})"),
            Self::Sensitive(_) => write!(f, "***"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Ref(r)
    }
}

impl From<ContextKey> for Value {
    fn from(key: ContextKey) -> Self {
        Self::Context(key)
    }
}
