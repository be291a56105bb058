//! Dependency scheduling with Kahn's algorithm
//!
//! Resources are grouped into stages: every resource in stage `n` depends
//! only on resources in stages `< n`, so members of a stage can be applied
//! concurrently. Teardown walks the same stages in reverse.

use crate::graph::{ResourceGraph, join_ids};
use crate::resource::ResourceId;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cyclic dependency between: {}", join_ids(participants))]
    CyclicDependency { participants: Vec<ResourceId> },

    #[error("{resource} depends on unknown resource {dependency}")]
    UnknownDependency {
        resource: ResourceId,
        dependency: ResourceId,
    },
}

/// Creation order as a list of stages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    stages: Vec<Vec<ResourceId>>,
}

impl Plan {
    pub fn stages(&self) -> &[Vec<ResourceId>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    /// Stage index of a resource
    pub fn stage_of(&self, id: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|r| r.as_str() == id))
    }

    /// Deletion order: the creation stages reversed
    pub fn teardown(&self) -> Vec<Vec<ResourceId>> {
        self.stages.iter().rev().cloned().collect()
    }

    /// All resources in creation order
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceId> {
        self.stages.iter().flatten()
    }
}

/// Compute creation stages over explicit and inferred edges
pub fn plan(graph: &ResourceGraph) -> Result<Plan, ScheduleError> {
    let mut in_degree: BTreeMap<&ResourceId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();

    for resource in graph.resources() {
        in_degree.entry(&resource.id).or_insert(0);
    }

    for resource in graph.resources() {
        for dependency in resource.dependencies() {
            let Some((key, _)) = in_degree.get_key_value(&dependency) else {
                return Err(ScheduleError::UnknownDependency {
                    resource: resource.id.clone(),
                    dependency,
                });
            };
            let key = *key;
            dependents.entry(key).or_default().push(&resource.id);
            if let Some(degree) = in_degree.get_mut(&resource.id) {
                *degree += 1;
            }
        }
    }

    let mut stages = Vec::new();
    let mut ready: Vec<&ResourceId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort();
        let mut next = Vec::new();
        for id in &ready {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        stages.push(ready.into_iter().cloned().collect());
        ready = next;
    }

    if placed < in_degree.len() {
        return Err(ScheduleError::CyclicDependency {
            participants: cycle_participants(&in_degree, &dependents),
        });
    }

    log::debug!(
        "Planned {} resources in {} stages",
        placed,
        stages.len()
    );
    Ok(Plan { stages })
}

/// Nodes left after Kahn's algorithm include cycle members and anything
/// downstream of them; pruning nodes with no remaining dependents leaves
/// only the cycles.
fn cycle_participants(
    in_degree: &BTreeMap<&ResourceId, usize>,
    dependents: &BTreeMap<&ResourceId, Vec<&ResourceId>>,
) -> Vec<ResourceId> {
    let mut remaining: BTreeSet<&ResourceId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| *id)
        .collect();

    loop {
        let leaves: Vec<&ResourceId> = remaining
            .iter()
            .filter(|id| {
                !dependents
                    .get(*id)
                    .into_iter()
                    .flatten()
                    .any(|d| remaining.contains(d))
            })
            .copied()
            .collect();
        if leaves.is_empty() {
            break;
        }
        for leaf in leaves {
            remaining.remove(leaf);
        }
    }

    remaining.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceType};
    use crate::value::Reference;

    fn chain(len: usize) -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        for i in 1..=len {
            let mut resource = Resource::new(format!("R{i:02}"), ResourceType::Other("step".into()));
            if i > 1 {
                resource = resource.with("previous", Reference::id(format!("R{:02}", i - 1)));
            }
            graph.add_resource(resource).unwrap();
        }
        graph
    }

    #[test]
    fn test_every_edge_crosses_to_a_later_stage() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(Resource::new("VPC", ResourceType::Network)).unwrap();
        graph
            .add_resource(Resource::new("Public", ResourceType::Subnet).with("vpc_id", Reference::id("VPC")))
            .unwrap();
        graph
            .add_resource(Resource::new("Private", ResourceType::Subnet).with("vpc_id", Reference::id("VPC")))
            .unwrap();
        graph
            .add_resource(
                Resource::new("Nat", ResourceType::NatGateway)
                    .with("subnet_id", Reference::id("Public"))
                    .depends_on("Private"),
            )
            .unwrap();

        let plan = plan(&graph).unwrap();
        for edge in graph.edges() {
            let from = plan.stage_of(edge.dependency.as_str()).unwrap();
            let to = plan.stage_of(edge.dependent.as_str()).unwrap();
            assert!(from < to, "{} -> {}", edge.dependency, edge.dependent);
        }
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.stages()[1], vec![ResourceId::new("Private"), ResourceId::new("Public")]);
    }

    #[test]
    fn test_chain_is_one_resource_per_stage() {
        let plan = plan(&chain(10)).unwrap();
        assert_eq!(plan.len(), 10);
        assert_eq!(plan.resource_count(), 10);
        assert_eq!(plan.stage_of("R07"), Some(6));
    }

    #[test]
    fn test_teardown_is_reverse_of_creation() {
        let plan = plan(&chain(3)).unwrap();
        let teardown: Vec<String> = plan.teardown().concat().iter().map(ToString::to_string).collect();
        assert_eq!(teardown, vec!["R03", "R02", "R01"]);
    }

    #[test]
    fn test_mutual_dependency_reports_both() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(Resource::new("A", ResourceType::Role)).unwrap();
        graph.add_resource(Resource::new("B", ResourceType::Role)).unwrap();
        graph.add_resource(Resource::new("C", ResourceType::Role).depends_on("A")).unwrap();
        graph.add_explicit_dependency(&"A".into(), &"B".into()).unwrap();
        graph.add_explicit_dependency(&"B".into(), &"A".into()).unwrap();

        assert_eq!(
            plan(&graph),
            Err(ScheduleError::CyclicDependency {
                participants: vec!["A".into(), "B".into()],
            })
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(Resource::new("Listener", ResourceType::Listener).with("tg", Reference::id("Missing")))
            .unwrap();
        assert!(matches!(plan(&graph), Err(ScheduleError::UnknownDependency { .. })));
    }

    #[test]
    fn test_empty_graph() {
        let plan = plan(&ResourceGraph::new()).unwrap();
        assert!(plan.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn node(i: usize) -> ResourceId {
            ResourceId::new(format!("N{i:02}"))
        }

        /// A node count and forward edges `(dependency, dependent)` with
        /// `dependency < dependent`, which can never form a cycle
        fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
            (2_usize..16).prop_flat_map(|n| {
                let pairs: Vec<(usize, usize)> = (0..n)
                    .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
                    .collect();
                let len = pairs.len();
                (Just(n), proptest::sample::subsequence(pairs, 0..=len))
            })
        }

        fn build(n: usize, edges: &[(usize, usize)]) -> ResourceGraph {
            let mut graph = ResourceGraph::new();
            for i in 0..n {
                graph.add_resource(Resource::new(node(i), ResourceType::Role)).unwrap();
            }
            for (dependency, dependent) in edges {
                graph
                    .add_explicit_dependency(&node(*dependent), &node(*dependency))
                    .unwrap();
            }
            graph
        }

        proptest! {
            /// Every dependency lands in an earlier stage than its dependent
            #[test]
            fn prop_edges_cross_to_later_stages((n, edges) in dag()) {
                let plan = plan(&build(n, &edges)).unwrap();

                prop_assert_eq!(plan.resource_count(), n);
                for (dependency, dependent) in &edges {
                    let before = plan.stage_of(node(*dependency).as_str()).unwrap();
                    let after = plan.stage_of(node(*dependent).as_str()).unwrap();
                    prop_assert!(before < after, "N{:02} must precede N{:02}", dependency, dependent);
                }
            }

            /// Reversing any one edge closes a cycle through its endpoints
            #[test]
            fn prop_back_edge_is_reported_as_cycle(
                (n, edges) in dag(),
                pick in any::<prop::sample::Index>(),
            ) {
                prop_assume!(!edges.is_empty());
                let (dependency, dependent) = *pick.get(&edges);
                let mut graph = build(n, &edges);
                graph
                    .add_explicit_dependency(&node(dependency), &node(dependent))
                    .unwrap();

                match plan(&graph) {
                    Err(ScheduleError::CyclicDependency { participants }) => {
                        prop_assert!(
                            participants.contains(&node(dependency))
                                || participants.contains(&node(dependent)),
                            "cycle {:?} misses N{:02} and N{:02}",
                            participants,
                            dependency,
                            dependent
                        );
                    }
                    other => prop_assert!(false, "expected a cycle, got {:?}", other),
                }
            }
        }
    }
}
