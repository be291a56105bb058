//! In-memory provisioner
//!
//! Simulates an eventually-consistent control plane: creates are accepted
//! immediately and become ready after a number of `describe` polls. Failure
//! injection (permanent, transient, failed-on-ready, replace-only types)
//! makes it usable as the test backend. The world is serializable so the CLI
//! can persist it between runs.

use super::{
    Created, Description, Properties, ProvisionError, Provisioner, RemoteState, UpdateOutcome,
};
use crate::resource::{ResourceType, props};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Failure injection and timing knobs
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// `describe` calls before a resource reports ready
    pub ready_after_polls: u32,
    /// Logical ids whose create is rejected outright
    pub permanent_failures: BTreeSet<String>,
    /// Logical ids whose first `n` create calls fail transiently
    pub transient_failures: BTreeMap<String, u32>,
    /// Logical ids accepted at create but reported failed when polled
    pub fail_on_ready: BTreeSet<String>,
    /// Types whose properties cannot be updated in place
    pub replace_only: BTreeSet<ResourceType>,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            ready_after_polls: 1,
            permanent_failures: BTreeSet::new(),
            transient_failures: BTreeMap::new(),
            fail_on_ready: BTreeSet::new(),
            replace_only: [
                ResourceType::Network,
                ResourceType::Subnet,
                ResourceType::TargetGroup,
                ResourceType::TaskDefinition,
                ResourceType::Database,
            ]
            .into_iter()
            .collect(),
        }
    }
}

/// A resource as the simulated control plane sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub kind: ResourceType,
    pub logical_id: String,
    pub properties: Properties,
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub polls: u32,
}

/// Everything the simulated control plane knows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct World {
    #[serde(default)]
    pub next_serial: u64,
    #[serde(default)]
    pub resources: BTreeMap<String, RemoteResource>,
}

/// Number of backend calls by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub describe: usize,
    pub update: usize,
    pub delete: usize,
}

#[derive(Debug, Default)]
struct Inner {
    world: World,
    calls: CallCounts,
    transient_seen: BTreeMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    options: MemoryOptions,
    inner: Mutex<Inner>,
}

impl MemoryProvisioner {
    pub fn new(options: MemoryOptions) -> Self {
        Self::with_world(options, World::default())
    }

    /// Resume from a previously saved world
    pub fn with_world(options: MemoryOptions, world: World) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner {
                world,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking worker must not take the simulated world down with it
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn world(&self) -> World {
        self.lock().world.clone()
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    pub fn reset_calls(&self) {
        self.lock().calls = CallCounts::default();
    }

    pub fn len(&self) -> usize {
        self.lock().world.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, physical_id: &str) -> bool {
        self.lock().world.resources.contains_key(physical_id)
    }

    /// Look up a stored secret string by the secret's name
    pub fn secret_string(&self, name: &str) -> Option<String> {
        self.lock()
            .world
            .resources
            .values()
            .filter(|r| r.kind == ResourceType::Secret)
            .find(|r| r.properties.get(props::NAME).and_then(Json::as_str) == Some(name))
            .and_then(|r| r.properties.get(props::SECRET_STRING))
            .and_then(Json::as_str)
            .map(str::to_string)
    }
}

fn prefix(kind: &ResourceType) -> String {
    match kind {
        ResourceType::Network => "vpc".to_string(),
        ResourceType::Subnet => "subnet".to_string(),
        ResourceType::SecurityGroup => "sg".to_string(),
        ResourceType::RouteTable => "rtb".to_string(),
        ResourceType::InternetGateway => "igw".to_string(),
        ResourceType::NatGateway => "nat".to_string(),
        ResourceType::ElasticIp => "eipalloc".to_string(),
        ResourceType::NetworkAcl => "acl".to_string(),
        ResourceType::VpcEndpoint => "vpce".to_string(),
        ResourceType::Instance => "i".to_string(),
        other => other.as_str().replace('_', "-"),
    }
}

/// Stored properties never keep write-only credentials
fn stored(properties: &Properties) -> Properties {
    let mut stored = properties.clone();
    stored.remove(props::MASTER_USER_PASSWORD);
    stored
}

fn attributes_for(
    kind: &ResourceType,
    logical_id: &str,
    physical_id: &str,
    hex: &str,
    properties: &Properties,
) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        "Arn".to_string(),
        format!("arn:sim:{kind}::{physical_id}"),
    );
    let host = logical_id.to_lowercase();
    match kind {
        ResourceType::LoadBalancer => {
            attributes.insert("DnsName".to_string(), format!("{host}-{hex}.elb.internal"));
        }
        ResourceType::Database => {
            let port = match properties.get("port") {
                Some(Json::Number(n)) => n.to_string(),
                Some(Json::String(s)) => s.clone(),
                _ => "3306".to_string(),
            };
            attributes.insert(
                "EndpointAddress".to_string(),
                format!("{host}.{hex}.db.internal"),
            );
            attributes.insert("EndpointPort".to_string(), port);
        }
        ResourceType::RestApi => {
            attributes.insert("RootResourceId".to_string(), format!("root-{hex}"));
        }
        ResourceType::ElasticIp => {
            attributes.insert("AllocationId".to_string(), physical_id.to_string());
        }
        _ => {}
    }
    attributes
}

impl Provisioner for MemoryProvisioner {
    fn create(
        &self,
        kind: &ResourceType,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<Created, ProvisionError> {
        let mut inner = self.lock();
        inner.calls.create += 1;

        if self.options.permanent_failures.contains(logical_id) {
            return Err(ProvisionError::permanent(format!(
                "{kind} {logical_id} rejected by backend"
            )));
        }

        let budget = self
            .options
            .transient_failures
            .get(logical_id)
            .copied()
            .unwrap_or(0);
        let seen = inner.transient_seen.entry(logical_id.to_string()).or_insert(0);
        if *seen < budget {
            *seen += 1;
            return Err(ProvisionError::transient("rate exceeded"));
        }

        inner.world.next_serial += 1;
        let serial = inner.world.next_serial;
        let digest = blake3::hash(format!("{logical_id}/{serial}").as_bytes()).to_hex();
        let hex = &digest.as_str()[..12];
        let physical_id = format!("{}-{hex}", prefix(kind));
        let attributes = attributes_for(kind, logical_id, &physical_id, hex, properties);

        inner.world.resources.insert(
            physical_id.clone(),
            RemoteResource {
                kind: kind.clone(),
                logical_id: logical_id.to_string(),
                properties: stored(properties),
                attributes: attributes.clone(),
                polls: 0,
            },
        );

        Ok(Created {
            physical_id,
            attributes,
        })
    }

    fn describe(
        &self,
        _kind: &ResourceType,
        physical_id: &str,
    ) -> Result<Description, ProvisionError> {
        let mut inner = self.lock();
        inner.calls.describe += 1;

        let resource = inner
            .world
            .resources
            .get_mut(physical_id)
            .ok_or_else(|| ProvisionError::permanent(format!("{physical_id} does not exist")))?;
        resource.polls += 1;

        let ready = resource.polls >= self.options.ready_after_polls.max(1);
        let state = if !ready {
            RemoteState::InProgress
        } else if self.options.fail_on_ready.contains(&resource.logical_id) {
            RemoteState::Failed {
                reason: format!("{} entered a failed state", resource.logical_id),
            }
        } else {
            RemoteState::Ready
        };

        Ok(Description {
            state,
            attributes: resource.attributes.clone(),
        })
    }

    fn update(
        &self,
        kind: &ResourceType,
        physical_id: &str,
        properties: &Properties,
    ) -> Result<UpdateOutcome, ProvisionError> {
        let mut inner = self.lock();
        inner.calls.update += 1;

        if self.options.replace_only.contains(kind) {
            return Ok(UpdateOutcome::NotSupported);
        }

        let resource = inner
            .world
            .resources
            .get_mut(physical_id)
            .ok_or_else(|| ProvisionError::permanent(format!("{physical_id} does not exist")))?;
        resource.properties = stored(properties);
        resource.polls = 0;
        Ok(UpdateOutcome::Updated)
    }

    fn delete(&self, _kind: &ResourceType, physical_id: &str) -> Result<(), ProvisionError> {
        let mut inner = self.lock();
        inner.calls.delete += 1;
        inner.world.resources.remove(physical_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn properties(entries: &[(&str, Json)]) -> Properties {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_create_then_ready_after_polls() {
        let backend = MemoryProvisioner::new(MemoryOptions {
            ready_after_polls: 2,
            ..MemoryOptions::default()
        });
        let created = backend
            .create(&ResourceType::LoadBalancer, "Nlb", &Properties::new())
            .unwrap();
        assert!(created.physical_id.starts_with("load-balancer-"));

        let first = backend.describe(&ResourceType::LoadBalancer, &created.physical_id).unwrap();
        assert_eq!(first.state, RemoteState::InProgress);
        let second = backend.describe(&ResourceType::LoadBalancer, &created.physical_id).unwrap();
        assert_eq!(second.state, RemoteState::Ready);
        assert!(second.attributes["DnsName"].ends_with(".elb.internal"));
    }

    #[test]
    fn test_failure_injection() {
        let backend = MemoryProvisioner::new(MemoryOptions {
            permanent_failures: ["Bad".to_string()].into(),
            transient_failures: [("Flaky".to_string(), 1)].into(),
            ..MemoryOptions::default()
        });

        assert!(matches!(
            backend.create(&ResourceType::Role, "Bad", &Properties::new()),
            Err(ProvisionError::Permanent { .. })
        ));
        assert!(matches!(
            backend.create(&ResourceType::Role, "Flaky", &Properties::new()),
            Err(ProvisionError::Transient { .. })
        ));
        assert!(backend.create(&ResourceType::Role, "Flaky", &Properties::new()).is_ok());
        assert_eq!(backend.calls().create, 3);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_replace_only_types_refuse_update() {
        let backend = MemoryProvisioner::default();
        let created = backend
            .create(&ResourceType::Network, "VPC", &Properties::new())
            .unwrap();
        assert_eq!(
            backend.update(&ResourceType::Network, &created.physical_id, &Properties::new()),
            Ok(UpdateOutcome::NotSupported)
        );
    }

    #[test]
    fn test_database_password_is_not_stored() {
        let backend = MemoryProvisioner::default();
        let created = backend
            .create(
                &ResourceType::Database,
                "Db",
                &properties(&[
                    ("master_user_password", json!("hunter2")),
                    ("port", json!(3306)),
                ]),
            )
            .unwrap();

        assert_eq!(created.attributes["EndpointPort"], "3306");
        let world = serde_json::to_string(&backend.world()).unwrap();
        assert!(!world.contains("hunter2"));
    }

    #[test]
    fn test_secret_lookup_by_name() {
        let backend = MemoryProvisioner::default();
        backend
            .create(
                &ResourceType::Secret,
                "DbSecret",
                &properties(&[
                    ("name", json!("Sample/Production/DB/Connection")),
                    ("secret_string", json!("{\"Server\":\"db\"}")),
                ]),
            )
            .unwrap();

        assert_eq!(
            backend.secret_string("Sample/Production/DB/Connection").as_deref(),
            Some("{\"Server\":\"db\"}")
        );
        assert_eq!(backend.secret_string("missing"), None);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let backend = MemoryProvisioner::default();
        let created = backend.create(&ResourceType::Role, "Role", &Properties::new()).unwrap();
        backend.delete(&ResourceType::Role, &created.physical_id).unwrap();
        backend.delete(&ResourceType::Role, &created.physical_id).unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn test_world_round_trips_through_json() {
        let backend = MemoryProvisioner::default();
        backend.create(&ResourceType::Subnet, "Public", &Properties::new()).unwrap();
        let world = backend.world();

        let restored: World = serde_json::from_str(&serde_json::to_string(&world).unwrap()).unwrap();
        let resumed = MemoryProvisioner::with_world(MemoryOptions::default(), restored);
        let next = resumed.create(&ResourceType::Subnet, "Private", &Properties::new()).unwrap();
        assert_eq!(resumed.len(), 2);
        assert!(resumed.contains(&next.physical_id));
    }
}
