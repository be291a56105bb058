//! Network and security posture checks
//!
//! Run after [`ResourceGraph::validate`] and before any backend call.
//! `Error` violations block an apply; `Warning` violations are advisory.

use crate::graph::ResourceGraph;
use crate::resource::{Resource, ResourceId, ResourceType, props};
use crate::rules::{self, Direction, Peer};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    /// Database-tier groups admit only peer groups
    DatabaseIngress,
    /// Private subnets reach the internet only through NAT
    PrivateSubnetEgress,
    /// Public subnets route through the internet gateway
    PublicSubnetEgress,
    /// World-open ingress needs a documented reason
    OpenIngress,
    /// Credentials only on types that take write-only values
    SensitiveExposure,
}

impl Rule {
    pub fn code(self) -> &'static str {
        match self {
            Self::DatabaseIngress => "database-ingress",
            Self::PrivateSubnetEgress => "private-subnet-egress",
            Self::PublicSubnetEgress => "public-subnet-egress",
            Self::OpenIngress => "open-ingress",
            Self::SensitiveExposure => "sensitive-exposure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: Rule,
    pub severity: Severity,
    pub resource: ResourceId,
    pub message: String,
}

impl Violation {
    fn error(rule: Rule, resource: &ResourceId, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Error,
            resource: resource.clone(),
            message: message.into(),
        }
    }

    fn warning(rule: Rule, resource: &ResourceId, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, resource, message)
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.severity,
            self.rule.code(),
            self.resource,
            self.message
        )
    }
}

pub fn has_blocking(violations: &[Violation]) -> bool {
    violations.iter().any(Violation::is_blocking)
}

/// Run every posture check
pub fn check(graph: &ResourceGraph) -> Vec<Violation> {
    let db_groups = database_groups(graph);
    let mut violations = Vec::new();

    check_database_ingress(graph, &db_groups, &mut violations);
    check_subnet_routes(graph, &mut violations);
    check_open_ingress(graph, &db_groups, &mut violations);
    check_sensitive_values(graph, &mut violations);

    violations.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.resource.cmp(&b.resource))
    });
    violations
}

fn of_kind(graph: &ResourceGraph, kind: ResourceType) -> impl Iterator<Item = &Resource> {
    graph.resources().filter(move |r| r.kind == kind)
}

/// Id references held by a property, directly or in a list
fn referenced_ids<'a>(resource: &'a Resource, key: &str) -> Vec<&'a ResourceId> {
    resource
        .property(key)
        .map(|value| {
            value
                .references()
                .into_iter()
                .filter(|r| r.attribute.is_structural())
                .map(|r| &r.target)
                .collect()
        })
        .unwrap_or_default()
}

fn refers_to(resource: &Resource, key: &str, target: &ResourceId) -> bool {
    referenced_ids(resource, key).contains(&target)
}

/// Security groups attached to a database
fn database_groups(graph: &ResourceGraph) -> BTreeSet<&ResourceId> {
    of_kind(graph, ResourceType::Database)
        .flat_map(|db| referenced_ids(db, props::DB_SECURITY_GROUPS))
        .filter(|id| graph.kind_of(id.as_str()) == Some(&ResourceType::SecurityGroup))
        .collect()
}

fn check_database_ingress(
    graph: &ResourceGraph,
    db_groups: &BTreeSet<&ResourceId>,
    violations: &mut Vec<Violation>,
) {
    for id in db_groups {
        let Some(group) = graph.get(id.as_str()) else {
            continue;
        };
        for rule in rules::valid_rules(group, Direction::Ingress) {
            if let Peer::Cidr(cidr) = &rule.peer {
                violations.push(Violation::error(
                    Rule::DatabaseIngress,
                    id,
                    format!("database-tier group admits CIDR {cidr}; use a peer security group"),
                ));
            }
        }
    }
}

enum RouteTarget {
    Nat,
    InternetGateway,
    Other(String),
}

fn route_target(graph: &ResourceGraph, route: &Resource) -> RouteTarget {
    for key in [props::NAT_GATEWAY_ID, props::GATEWAY_ID] {
        if let Some(target) = referenced_ids(route, key).first() {
            return match graph.kind_of(target.as_str()) {
                Some(ResourceType::NatGateway) => RouteTarget::Nat,
                Some(ResourceType::InternetGateway) => RouteTarget::InternetGateway,
                Some(kind) => RouteTarget::Other(format!("{kind} {target}")),
                None => RouteTarget::Other(target.to_string()),
            };
        }
    }
    RouteTarget::Other("an unknown target".to_string())
}

/// Default routes of every route table associated with `subnet`
fn default_routes<'a>(graph: &'a ResourceGraph, subnet: &ResourceId) -> Vec<&'a Resource> {
    let tables: Vec<&ResourceId> = of_kind(graph, ResourceType::SubnetRouteTableAssociation)
        .filter(|assoc| refers_to(assoc, props::SUBNET_ID, subnet))
        .flat_map(|assoc| referenced_ids(assoc, props::ROUTE_TABLE_ID))
        .collect();

    of_kind(graph, ResourceType::Route)
        .filter(|route| {
            route
                .property(props::DESTINATION_CIDR)
                .and_then(|v| v.as_str())
                == Some(DEFAULT_ROUTE)
        })
        .filter(|route| {
            tables
                .iter()
                .any(|table| refers_to(route, props::ROUTE_TABLE_ID, table))
        })
        .collect()
}

fn check_subnet_routes(graph: &ResourceGraph, violations: &mut Vec<Violation>) {
    for subnet in of_kind(graph, ResourceType::Subnet) {
        let public = subnet
            .property(props::MAP_PUBLIC_IP)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let routes = default_routes(graph, &subnet.id);

        if public {
            let via_igw = routes
                .iter()
                .any(|r| matches!(route_target(graph, r), RouteTarget::InternetGateway));
            if !via_igw {
                violations.push(Violation::error(
                    Rule::PublicSubnetEgress,
                    &subnet.id,
                    "public subnet has no default route through the internet gateway",
                ));
            }
            continue;
        }

        // isolated private subnets (no default route) are allowed
        for route in routes {
            let problem = match route_target(graph, route) {
                RouteTarget::Nat => continue,
                RouteTarget::InternetGateway => "the internet gateway".to_string(),
                RouteTarget::Other(target) => target,
            };
            violations.push(Violation::error(
                Rule::PrivateSubnetEgress,
                &subnet.id,
                format!(
                    "private subnet routes default traffic through {problem} (route {})",
                    route.id
                ),
            ));
        }
    }
}

fn check_open_ingress(
    graph: &ResourceGraph,
    db_groups: &BTreeSet<&ResourceId>,
    violations: &mut Vec<Violation>,
) {
    for group in of_kind(graph, ResourceType::SecurityGroup) {
        if group.public_ingress.is_some() || db_groups.contains(&group.id) {
            continue;
        }
        for rule in rules::valid_rules(group, Direction::Ingress) {
            if rule.is_open_to_world() {
                violations.push(Violation::warning(
                    Rule::OpenIngress,
                    &group.id,
                    "ingress open to the internet without a documented bastion or public role",
                ));
                break;
            }
        }
    }
}

fn check_sensitive_values(graph: &ResourceGraph, violations: &mut Vec<Violation>) {
    for resource in graph.resources() {
        if resource.kind.accepts_sensitive() {
            continue;
        }
        for (key, value) in &resource.properties {
            if value.contains_sensitive() {
                violations.push(Violation::error(
                    Rule::SensitiveExposure,
                    &resource.id,
                    format!("property {key} carries a credential on a {}", resource.kind),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{SecurityRule, rules_value};
    use crate::value::{Reference, Value};

    fn network() -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph.add_resource(Resource::new("VPC", ResourceType::Network)).unwrap();
        graph
            .add_resource(
                Resource::new("Private", ResourceType::Subnet)
                    .with("vpc_id", Reference::id("VPC"))
                    .with("map_public_ip_on_launch", false),
            )
            .unwrap();
        graph
            .add_resource(
                Resource::new("AppSg", ResourceType::SecurityGroup).with("vpc_id", Reference::id("VPC")),
            )
            .unwrap();
        graph
    }

    fn database(graph: &mut ResourceGraph, ingress: &[SecurityRule]) {
        graph
            .add_resource(
                Resource::new("DbSg", ResourceType::SecurityGroup)
                    .with("vpc_id", Reference::id("VPC"))
                    .with("ingress", rules_value(ingress)),
            )
            .unwrap();
        graph
            .add_resource(
                Resource::new("Db", ResourceType::Database)
                    .with("vpc_security_groups", Value::list([Reference::id("DbSg").into()]))
                    .with("subnet_ids", Value::list([Reference::id("Private").into()]))
                    .with("master_user_password", Value::sensitive("pw")),
            )
            .unwrap();
    }

    fn routed(graph: &mut ResourceGraph, subnet: &str, target_key: &str, target: &str) {
        let table = format!("{subnet}Rt");
        graph
            .add_resource(Resource::new(table.as_str(), ResourceType::RouteTable).with("vpc_id", Reference::id("VPC")))
            .unwrap();
        graph
            .add_resource(
                Resource::new(format!("{subnet}Assoc"), ResourceType::SubnetRouteTableAssociation)
                    .with("subnet_id", Reference::id(subnet))
                    .with("route_table_id", Reference::id(table.as_str())),
            )
            .unwrap();
        graph
            .add_resource(
                Resource::new(format!("{subnet}Default"), ResourceType::Route)
                    .with("route_table_id", Reference::id(table.as_str()))
                    .with("destination_cidr_block", "0.0.0.0/0")
                    .with(target_key, Reference::id(target)),
            )
            .unwrap();
    }

    #[test]
    fn test_peer_only_database_tier_has_no_errors() {
        let mut graph = network();
        database(
            &mut graph,
            &[SecurityRule::tcp(Direction::Ingress, 3306, Peer::Group(Reference::id("AppSg")))],
        );

        assert!(graph.validate().is_empty());
        let violations = check(&graph);
        assert!(!has_blocking(&violations), "{violations:?}");
    }

    #[test]
    fn test_database_cidr_ingress_is_error() {
        let mut graph = network();
        database(
            &mut graph,
            &[SecurityRule::tcp(Direction::Ingress, 3306, Peer::Cidr("10.0.0.0/16".into()))],
        );

        let violations = check(&graph);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, Rule::DatabaseIngress);
        assert_eq!(violations[0].resource, ResourceId::new("DbSg"));
        assert!(has_blocking(&violations));
    }

    #[test]
    fn test_private_subnet_through_internet_gateway_is_error() {
        let mut graph = network();
        graph.add_resource(Resource::new("Igw", ResourceType::InternetGateway)).unwrap();
        routed(&mut graph, "Private", "gateway_id", "Igw");

        let violations = check(&graph);
        assert!(matches!(
            &violations[..],
            [Violation { rule: Rule::PrivateSubnetEgress, severity: Severity::Error, .. }]
        ));
    }

    #[test]
    fn test_private_subnet_through_nat_is_fine() {
        let mut graph = network();
        graph.add_resource(Resource::new("Nat", ResourceType::NatGateway)).unwrap();
        routed(&mut graph, "Private", "nat_gateway_id", "Nat");
        assert!(check(&graph).is_empty());
    }

    #[test]
    fn test_public_subnet_requires_internet_gateway_route() {
        let mut graph = network();
        graph
            .add_resource(
                Resource::new("Public", ResourceType::Subnet)
                    .with("vpc_id", Reference::id("VPC"))
                    .with("map_public_ip_on_launch", true),
            )
            .unwrap();

        let violations = check(&graph);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, Rule::PublicSubnetEgress);

        graph.add_resource(Resource::new("Igw", ResourceType::InternetGateway)).unwrap();
        routed(&mut graph, "Public", "gateway_id", "Igw");
        assert!(check(&graph).is_empty());
    }

    #[test]
    fn test_open_ingress_needs_justification() {
        let open = rules_value(&[SecurityRule::tcp(
            Direction::Ingress,
            22,
            Peer::Cidr("0.0.0.0/0".into()),
        )]);

        let mut graph = network();
        graph
            .add_resource(Resource::new("BastionSg", ResourceType::SecurityGroup).with("ingress", open.clone()))
            .unwrap();
        let violations = check(&graph);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Warning);
        assert!(!has_blocking(&violations));

        let mut graph = network();
        graph
            .add_resource(
                Resource::new("BastionSg", ResourceType::SecurityGroup)
                    .with("ingress", open)
                    .with_public_ingress("bastion host SSH"),
            )
            .unwrap();
        assert!(check(&graph).is_empty());
    }

    #[test]
    fn test_sensitive_value_outside_secret_is_error() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(
                Resource::new("Fn", ResourceType::Function)
                    .with("environment", Value::map([("DB_PASSWORD", Value::sensitive("pw"))])),
            )
            .unwrap();

        let violations = check(&graph);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, Rule::SensitiveExposure);
        assert!(!violations[0].to_string().contains("pw\""));
    }
}
