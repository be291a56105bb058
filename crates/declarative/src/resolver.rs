//! Reference resolution
//!
//! Two tiers: a structural reference (`Id`) resolves once the target's
//! create call has been accepted, a runtime attribute (`DnsName`,
//! `EndpointAddress`, ...) only once the target is ready. The engine
//! resolves each resource's properties right before calling the backend,
//! after every dependency has reached a terminal state.

use crate::backend::Properties;
use crate::context::DeployContext;
use crate::fingerprint::{self, FingerprintKey};
use crate::resource::Resource;
use crate::types::{ResourceStatus, StateTable};
use crate::value::{Attribute, Reference, Value};
use serde_json::Value as Json;
use std::fmt;
use thiserror::Error;

/// Why a reference could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// Target has no record at all
    UnknownResource,
    /// Target has not been assigned an identifier yet
    NoIdentifier,
    /// Target exists but is not ready
    NotReady,
    /// Target is ready but does not expose the attribute
    MissingAttribute,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UnknownResource => "target is unknown",
            Self::NoIdentifier => "target has no identifier yet",
            Self::NotReady => "target is not ready",
            Self::MissingAttribute => "target does not expose this attribute",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved reference {reference}: {reason}")]
    UnresolvedReference {
        reference: Reference,
        reason: UnresolvedReason,
    },

    #[error("cannot interpolate a {0} into a string")]
    NonScalarInterpolation(&'static str),
}

/// Resolves values against the records of the current deployment
pub struct Resolver<'a> {
    context: &'a DeployContext,
    records: &'a StateTable,
    /// Resolve sensitive literals to their sealed form
    sealing: Option<Option<&'a FingerprintKey>>,
}

impl<'a> Resolver<'a> {
    pub fn new(context: &'a DeployContext, records: &'a StateTable) -> Self {
        Self {
            context,
            records,
            sealing: None,
        }
    }

    /// A resolver for fingerprints: sensitive literals come out sealed
    /// with `key` instead of in clear text
    pub fn sealed(mut self, key: Option<&'a FingerprintKey>) -> Self {
        self.sealing = Some(key);
        self
    }

    pub fn resolve_reference(&self, reference: &Reference) -> Result<String, ResolveError> {
        let fail = |reason| ResolveError::UnresolvedReference {
            reference: reference.clone(),
            reason,
        };

        let record = self
            .records
            .get(&reference.target)
            .ok_or_else(|| fail(UnresolvedReason::UnknownResource))?;

        match &reference.attribute {
            Attribute::Id => match (&record.physical_id, record.status) {
                (Some(id), ResourceStatus::Provisioning | ResourceStatus::Created) => {
                    Ok(id.clone())
                }
                _ => Err(fail(UnresolvedReason::NoIdentifier)),
            },
            Attribute::Runtime(name) => {
                if record.status != ResourceStatus::Created {
                    return Err(fail(UnresolvedReason::NotReady));
                }
                record
                    .attributes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| fail(UnresolvedReason::MissingAttribute))
            }
        }
    }

    /// Resolve a value into the concrete form sent to the backend
    ///
    /// Unless sealed, sensitive literals come out in clear text; callers
    /// must not log the result.
    pub fn resolve(&self, value: &Value) -> Result<Json, ResolveError> {
        Ok(match value {
            Value::Bool(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::String(s) => Json::String(s.clone()),
            Value::Sensitive(s) => match self.sealing {
                Some(key) => Json::String(fingerprint::seal(key, s)),
                None => Json::String(s.clone()),
            },
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok::<_, ResolveError>((k.clone(), self.resolve(v)?)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Ref(reference) => Json::String(self.resolve_reference(reference)?),
            Value::Join(parts) => {
                let mut out = String::new();
                for part in parts {
                    match self.resolve(part)? {
                        Json::String(s) => out.push_str(&s),
                        Json::Number(n) => out.push_str(&n.to_string()),
                        Json::Bool(b) => out.push_str(if b { "true" } else { "false" }),
                        Json::Null => {}
                        Json::Array(_) => return Err(ResolveError::NonScalarInterpolation("list")),
                        Json::Object(_) => return Err(ResolveError::NonScalarInterpolation("map")),
                    }
                }
                Json::String(out)
            }
            Value::Context(key) => Json::String(self.context.value(*key).to_string()),
            Value::ToJson(inner) => Json::String(self.resolve(inner)?.to_string()),
        })
    }

    pub fn resolve_properties(&self, resource: &Resource) -> Result<Properties, ResolveError> {
        resource
            .properties
            .iter()
            .map(|(k, v)| Ok::<_, ResolveError>((k.clone(), self.resolve(v)?)))
            .collect()
    }
}
