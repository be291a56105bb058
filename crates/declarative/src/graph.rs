//! The resource graph: resources, dependency edges and declared outputs
//!
//! Pure data structure. Edges are derived from references in properties
//! plus explicit `depends_on` constraints; nothing here performs I/O.

use crate::outputs::Output;
use crate::resource::{Resource, ResourceId, ResourceType};
use crate::rules::{self, Direction, Peer, RuleError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors from mutating the graph
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate resource id: {0}")]
    DuplicateId(ResourceId),

    #[error("unknown resource: {0}")]
    UnknownResource(ResourceId),

    #[error("duplicate output name: {0}")]
    DuplicateOutput(String),
}

/// Structural errors found by [`ResourceGraph::validate`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("{resource} references unknown resource {target}")]
    UnresolvedReference {
        resource: ResourceId,
        target: ResourceId,
    },

    #[error("output {output} references unknown resource {target}")]
    UnresolvedOutput { output: String, target: ResourceId },

    #[error("cyclic dependency: {}", join_ids(cycle))]
    CyclicDependency { cycle: Vec<ResourceId> },

    #[error("malformed {direction} rule #{index} on {group}: {reason}")]
    MalformedRule {
        group: ResourceId,
        direction: Direction,
        index: usize,
        reason: RuleError,
    },
}

pub(crate) fn join_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ResourceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A directed edge: `dependency` must exist before `dependent`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub dependency: ResourceId,
    pub dependent: ResourceId,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: BTreeMap<ResourceId, Resource>,
    outputs: Vec<Output>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource, failing if its id is already taken
    pub fn add_resource(&mut self, resource: Resource) -> Result<ResourceId, GraphError> {
        if self.resources.contains_key(&resource.id) {
            return Err(GraphError::DuplicateId(resource.id));
        }
        let id = resource.id.clone();
        self.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Declare that `dependent` must be created after `dependency`
    /// even though none of its properties reference it
    pub fn add_explicit_dependency(
        &mut self,
        dependent: &ResourceId,
        dependency: &ResourceId,
    ) -> Result<(), GraphError> {
        if !self.resources.contains_key(dependency) {
            return Err(GraphError::UnknownResource(dependency.clone()));
        }
        let resource = self
            .resources
            .get_mut(dependent)
            .ok_or_else(|| GraphError::UnknownResource(dependent.clone()))?;
        resource.depends_on.insert(dependency.clone());
        Ok(())
    }

    pub fn add_output(&mut self, output: Output) -> Result<(), GraphError> {
        if self.outputs.iter().any(|o| o.name == output.name) {
            return Err(GraphError::DuplicateOutput(output.name));
        }
        self.outputs.push(output);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn kind_of(&self, id: &str) -> Option<&ResourceType> {
        self.resources.get(id).map(|r| &r.kind)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.keys()
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Dependencies of `id` that exist in the graph
    pub fn dependencies_of(&self, id: &str) -> BTreeSet<ResourceId> {
        self.resources
            .get(id)
            .map(|r| {
                r.dependencies()
                    .into_iter()
                    .filter(|dep| self.resources.contains_key(dep))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resources that depend on `id`
    pub fn dependents_of(&self, id: &str) -> BTreeSet<ResourceId> {
        self.resources
            .values()
            .filter(|r| r.dependencies().iter().any(|dep| dep.as_str() == id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// All edges between resources present in the graph
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        for resource in self.resources.values() {
            for dependency in self.dependencies_of(resource.id.as_str()) {
                edges.push(DependencyEdge {
                    dependency,
                    dependent: resource.id.clone(),
                });
            }
        }
        edges
    }

    /// Collect every structural error in the graph
    ///
    /// An empty result means the graph can be scheduled.
    pub fn validate(&self) -> Vec<DefinitionError> {
        let mut errors = Vec::new();

        for resource in self.resources.values() {
            for target in resource.dependencies() {
                if !self.resources.contains_key(&target) {
                    errors.push(DefinitionError::UnresolvedReference {
                        resource: resource.id.clone(),
                        target,
                    });
                }
            }
        }

        for output in &self.outputs {
            if !self.resources.contains_key(&output.source.target) {
                errors.push(DefinitionError::UnresolvedOutput {
                    output: output.name.clone(),
                    target: output.source.target.clone(),
                });
            }
        }

        for group in self
            .resources
            .values()
            .filter(|r| r.kind == ResourceType::SecurityGroup)
        {
            errors.extend(self.validate_rules(group));
        }

        for cycle in self.find_cycles() {
            errors.push(DefinitionError::CyclicDependency { cycle });
        }

        errors
    }

    fn validate_rules(&self, group: &Resource) -> Vec<DefinitionError> {
        let mut errors = Vec::new();
        for (direction, index, rule) in rules::security_rules(group) {
            let reason = match rule {
                Err(reason) => reason,
                Ok(rule) => match &rule.peer {
                    Peer::Group(reference) => match self.kind_of(reference.target.as_str()) {
                        // unknown targets are already reported as unresolved references
                        None | Some(ResourceType::SecurityGroup) => continue,
                        Some(_) => RuleError::PeerNotSecurityGroup(reference.target.to_string()),
                    },
                    Peer::Cidr(_) => continue,
                },
            };
            errors.push(DefinitionError::MalformedRule {
                group: group.id.clone(),
                direction,
                index,
                reason,
            });
        }
        errors
    }

    /// Find dependency cycles with a depth-first walk and a recursion stack
    ///
    /// Each returned cycle lists its members in dependency order, starting
    /// and ending at the same resource.
    pub fn find_cycles(&self) -> Vec<Vec<ResourceId>> {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();
        let mut on_stack = BTreeSet::new();
        let mut cycles = Vec::new();

        for id in self.resources.keys() {
            if !visited.contains(id) {
                self.visit(id, &mut visited, &mut stack, &mut on_stack, &mut cycles);
            }
        }
        cycles
    }

    fn visit(
        &self,
        id: &ResourceId,
        visited: &mut BTreeSet<ResourceId>,
        stack: &mut Vec<ResourceId>,
        on_stack: &mut BTreeSet<ResourceId>,
        cycles: &mut Vec<Vec<ResourceId>>,
    ) {
        visited.insert(id.clone());
        stack.push(id.clone());
        on_stack.insert(id.clone());

        for dependency in self.dependencies_of(id.as_str()) {
            if on_stack.contains(&dependency) {
                let start = stack.iter().position(|s| *s == dependency).unwrap_or(0);
                let mut cycle: Vec<ResourceId> = stack[start..].to_vec();
                cycle.push(dependency);
                cycles.push(cycle);
            } else if !visited.contains(&dependency) {
                self.visit(&dependency, visited, stack, on_stack, cycles);
            }
        }

        stack.pop();
        on_stack.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::SecurityRule;
    use crate::value::{Reference, Value};

    fn vpc() -> Resource {
        Resource::new("VPC", ResourceType::Network).with("cidr_block", "10.0.0.0/16")
    }

    #[test]
    fn test_add_resource_rejects_duplicates() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(vpc()).unwrap();
        assert_eq!(
            graph.add_resource(vpc()),
            Err(GraphError::DuplicateId(ResourceId::new("VPC")))
        );
    }

    #[test]
    fn test_add_explicit_dependency_requires_both_ids() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(vpc()).unwrap();
        let err = graph
            .add_explicit_dependency(&"VPC".into(), &"Role".into())
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownResource("Role".into()));

        let err = graph
            .add_explicit_dependency(&"Ghost".into(), &"VPC".into())
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownResource("Ghost".into()));
    }

    #[test]
    fn test_edges_are_inferred_from_references() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(vpc()).unwrap();
        graph
            .add_resource(
                Resource::new("Subnet", ResourceType::Subnet).with("vpc_id", Reference::id("VPC")),
            )
            .unwrap();

        assert_eq!(
            graph.edges(),
            vec![DependencyEdge {
                dependency: "VPC".into(),
                dependent: "Subnet".into(),
            }]
        );
        assert!(graph.dependents_of("VPC").contains("Subnet"));
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_validate_reports_missing_target_group() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(
                Resource::new("Listener", ResourceType::Listener)
                    .with("target_group_arn", Reference::id("ODataTargetGroup")),
            )
            .unwrap();

        let errors = graph.validate();
        assert_eq!(
            errors,
            vec![DefinitionError::UnresolvedReference {
                resource: "Listener".into(),
                target: "ODataTargetGroup".into(),
            }]
        );
    }

    #[test]
    fn test_validate_finds_cycle() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(Resource::new("A", ResourceType::Role).depends_on("B"))
            .unwrap();
        graph
            .add_resource(Resource::new("B", ResourceType::Role).depends_on("A"))
            .unwrap();

        let errors = graph.validate();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            DefinitionError::CyclicDependency { cycle } => {
                assert!(cycle.contains(&"A".into()));
                assert!(cycle.contains(&"B".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(
                Resource::new("Loop", ResourceType::Function).with("role", Reference::id("Loop")),
            )
            .unwrap();
        assert_eq!(graph.find_cycles(), vec![vec!["Loop".into(), "Loop".into()]]);
    }

    #[test]
    fn test_validate_rejects_rule_peer_that_is_not_a_group() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(vpc()).unwrap();
        graph
            .add_resource(Resource::new("Sg", ResourceType::SecurityGroup).with(
                "ingress",
                Value::list([SecurityRule::tcp(
                    Direction::Ingress,
                    443,
                    Peer::Group(Reference::id("VPC")),
                )
                .to_value()]),
            ))
            .unwrap();

        let errors = graph.validate();
        assert!(matches!(
            &errors[..],
            [DefinitionError::MalformedRule {
                reason: RuleError::PeerNotSecurityGroup(_),
                ..
            }]
        ));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(vpc()).unwrap();
        let output = Output::new("VPCId", Reference::id("VPC"), "The VPC ID");
        graph.add_output(output.clone()).unwrap();
        assert_eq!(
            graph.add_output(output),
            Err(GraphError::DuplicateOutput("VPCId".into()))
        );
    }
}
