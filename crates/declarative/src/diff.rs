//! Planned changes, computed from declared fingerprints and saved state
//!
//! This is a preview: the engine decides on resolved properties at apply
//! time, so a dependency's replacement can still turn a `NoChange` here
//! into an update.

use crate::fingerprint::{self, FingerprintKey};
use crate::graph::ResourceGraph;
use crate::resource::{Resource, ResourceId, ResourceType};
use crate::scheduler::Plan;
use crate::types::StateTable;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Create,
    Update,
    NoChange,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::NoChange => "unchanged",
        })
    }
}

/// Planned action for one resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    pub resource_id: ResourceId,
    pub resource_type: ResourceType,
    pub description: String,
    pub stage: usize,
    pub action: PlannedAction,
}

impl ResourceDiff {
    pub fn is_change(&self) -> bool {
        self.action != PlannedAction::NoChange
    }
}

fn planned_action(
    resource: &Resource,
    records: &StateTable,
    key: Option<&FingerprintKey>,
) -> PlannedAction {
    match records.get(&resource.id) {
        Some(record) if record.is_created() => {
            let declared = fingerprint::declared(resource, key);
            if record.declared_fingerprint.as_deref() == Some(declared.as_str()) {
                PlannedAction::NoChange
            } else {
                PlannedAction::Update
            }
        }
        _ => PlannedAction::Create,
    }
}

/// Diffs for every resource, in plan order
///
/// `key` must be the one the engine applied with, or every resource
/// holding a credential shows as an update.
pub fn compute_diffs(
    graph: &ResourceGraph,
    plan: &Plan,
    records: &StateTable,
    key: Option<&FingerprintKey>,
) -> Vec<ResourceDiff> {
    plan.stages()
        .iter()
        .enumerate()
        .flat_map(|(stage, ids)| ids.iter().map(move |id| (stage, id)))
        .filter_map(|(stage, id)| {
            let resource = graph.get(id.as_str())?;
            Some(ResourceDiff {
                resource_id: resource.id.clone(),
                resource_type: resource.kind.clone(),
                description: resource.description(),
                stage,
                action: planned_action(resource, records, key),
            })
        })
        .collect()
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub additions: usize,
    pub modifications: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn from_diffs(diffs: &[ResourceDiff]) -> Self {
        let mut summary = Self::default();
        for diff in diffs {
            match diff.action {
                PlannedAction::Create => summary.additions += 1,
                PlannedAction::Update => summary.modifications += 1,
                PlannedAction::NoChange => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.additions + self.modifications
    }

    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group diffs by resource type
pub fn group_by_type(diffs: &[ResourceDiff]) -> BTreeMap<ResourceType, Vec<&ResourceDiff>> {
    let mut groups: BTreeMap<ResourceType, Vec<&ResourceDiff>> = BTreeMap::new();
    for diff in diffs {
        groups.entry(diff.resource_type.clone()).or_default().push(diff);
    }
    groups
}

/// A `type` or `type.name` filter over resources
///
/// A bare word that is not a known type matches resource ids instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetFilter {
    pub resource_type: Option<ResourceType>,
    pub name: Option<String>,
}

impl TargetFilter {
    pub fn parse(target: &str) -> Self {
        match target.split_once('.') {
            Some((kind, name)) if !name.contains('.') => Self {
                resource_type: Some(ResourceType::from(kind.to_string())),
                name: Some(name.to_string()),
            },
            Some(_) => Self {
                resource_type: None,
                name: Some(target.to_string()),
            },
            None => match ResourceType::from(target.to_string()) {
                ResourceType::Other(_) => Self {
                    resource_type: None,
                    name: Some(target.to_string()),
                },
                kind => Self {
                    resource_type: Some(kind),
                    name: None,
                },
            },
        }
    }

    pub fn matches(&self, id: &ResourceId, kind: &ResourceType) -> bool {
        if let Some(rt) = &self.resource_type
            && rt != kind
        {
            return false;
        }
        if let Some(name) = &self.name
            && !id.as_str().to_lowercase().contains(&name.to_lowercase())
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;
    use crate::types::{ResourceRecord, ResourceStatus};
    use crate::value::Reference;

    fn graph(cidr: &str) -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(Resource::new("VPC", ResourceType::Network).with("cidr_block", "10.0.0.0/16"))
            .unwrap();
        graph
            .add_resource(
                Resource::new("PublicSubnet", ResourceType::Subnet)
                    .with("vpc_id", Reference::id("VPC"))
                    .with("cidr_block", cidr),
            )
            .unwrap();
        graph
    }

    fn created(resource: &Resource) -> ResourceRecord {
        let mut record = ResourceRecord::pending(resource.kind.clone(), resource.retention);
        record.status = ResourceStatus::Created;
        record.physical_id = Some(format!("{}-1", resource.id));
        record.declared_fingerprint = Some(fingerprint::declared(resource, None));
        record
    }

    #[test]
    fn test_diffs_against_saved_state() {
        let before = graph("10.0.0.0/24");
        let mut records = StateTable::new();
        for resource in before.resources() {
            records.insert(resource.id.clone(), created(resource));
        }

        let after = graph("10.0.9.0/24");
        let plan = scheduler::plan(&after).unwrap();
        let diffs = compute_diffs(&after, &plan, &records, None);

        assert_eq!(diffs[0].action, PlannedAction::NoChange);
        assert_eq!(diffs[1].action, PlannedAction::Update);
        assert_eq!(diffs[1].stage, 1);

        let summary = DiffSummary::from_diffs(&diffs);
        assert_eq!(summary.modifications, 1);
        assert!(summary.has_changes());

        let fresh = compute_diffs(&after, &plan, &StateTable::new(), None);
        assert!(fresh.iter().all(|d| d.action == PlannedAction::Create));
        assert_eq!(group_by_type(&fresh).len(), 2);
    }

    #[test]
    fn test_target_filter() {
        let subnet = ResourceId::new("PublicSubnet");

        let by_type = TargetFilter::parse("subnet");
        assert!(by_type.matches(&subnet, &ResourceType::Subnet));
        assert!(!by_type.matches(&subnet, &ResourceType::Network));

        let by_both = TargetFilter::parse("subnet.public");
        assert!(by_both.matches(&subnet, &ResourceType::Subnet));
        assert!(!by_both.matches(&ResourceId::new("PrivateSubnet1"), &ResourceType::Subnet));

        let by_name = TargetFilter::parse("Bastion");
        assert_eq!(by_name.resource_type, None);
        assert!(by_name.matches(&ResourceId::new("BastionHost"), &ResourceType::Instance));
    }
}
