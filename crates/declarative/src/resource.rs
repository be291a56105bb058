//! Resources: typed units of infrastructure with a property bag
//!
//! A resource is a tagged variant: an open [`ResourceType`] plus a map of
//! [`Value`]s. Type-specific rules live in free functions (see
//! [`rules`](crate::rules) and [`checker`](crate::checker)) dispatched on
//! the tag, not in per-type structs.

use crate::value::{Reference, Value};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Logical identifier of a resource within a graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ResourceId> for ResourceId {
    fn from(id: &ResourceId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for ResourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Resource type category
///
/// Open enum: unknown types round-trip through [`ResourceType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ResourceType {
    Network,
    InternetGateway,
    GatewayAttachment,
    ElasticIp,
    NatGateway,
    Subnet,
    RouteTable,
    Route,
    SubnetRouteTableAssociation,
    NetworkAcl,
    NetworkAclEntry,
    SecurityGroup,
    VpcEndpoint,
    LoadBalancer,
    TargetGroup,
    Listener,
    Cluster,
    TaskDefinition,
    Service,
    ScalableTarget,
    ScalingPolicy,
    Role,
    Policy,
    InstanceProfile,
    LogGroup,
    Function,
    Permission,
    Instance,
    DbSubnetGroup,
    Database,
    Secret,
    RestApi,
    ApiResource,
    ApiAuthorizer,
    ApiMethod,
    VpcLink,
    Other(String),
}

const KNOWN_TYPES: &[ResourceType] = &[
    ResourceType::Network,
    ResourceType::InternetGateway,
    ResourceType::GatewayAttachment,
    ResourceType::ElasticIp,
    ResourceType::NatGateway,
    ResourceType::Subnet,
    ResourceType::RouteTable,
    ResourceType::Route,
    ResourceType::SubnetRouteTableAssociation,
    ResourceType::NetworkAcl,
    ResourceType::NetworkAclEntry,
    ResourceType::SecurityGroup,
    ResourceType::VpcEndpoint,
    ResourceType::LoadBalancer,
    ResourceType::TargetGroup,
    ResourceType::Listener,
    ResourceType::Cluster,
    ResourceType::TaskDefinition,
    ResourceType::Service,
    ResourceType::ScalableTarget,
    ResourceType::ScalingPolicy,
    ResourceType::Role,
    ResourceType::Policy,
    ResourceType::InstanceProfile,
    ResourceType::LogGroup,
    ResourceType::Function,
    ResourceType::Permission,
    ResourceType::Instance,
    ResourceType::DbSubnetGroup,
    ResourceType::Database,
    ResourceType::Secret,
    ResourceType::RestApi,
    ResourceType::ApiResource,
    ResourceType::ApiAuthorizer,
    ResourceType::ApiMethod,
    ResourceType::VpcLink,
];

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Network => "network",
            Self::InternetGateway => "internet_gateway",
            Self::GatewayAttachment => "gateway_attachment",
            Self::ElasticIp => "elastic_ip",
            Self::NatGateway => "nat_gateway",
            Self::Subnet => "subnet",
            Self::RouteTable => "route_table",
            Self::Route => "route",
            Self::SubnetRouteTableAssociation => "subnet_route_table_association",
            Self::NetworkAcl => "network_acl",
            Self::NetworkAclEntry => "network_acl_entry",
            Self::SecurityGroup => "security_group",
            Self::VpcEndpoint => "vpc_endpoint",
            Self::LoadBalancer => "load_balancer",
            Self::TargetGroup => "target_group",
            Self::Listener => "listener",
            Self::Cluster => "cluster",
            Self::TaskDefinition => "task_definition",
            Self::Service => "service",
            Self::ScalableTarget => "scalable_target",
            Self::ScalingPolicy => "scaling_policy",
            Self::Role => "role",
            Self::Policy => "policy",
            Self::InstanceProfile => "instance_profile",
            Self::LogGroup => "log_group",
            Self::Function => "function",
            Self::Permission => "permission",
            Self::Instance => "instance",
            Self::DbSubnetGroup => "db_subnet_group",
            Self::Database => "database",
            Self::Secret => "secret",
            Self::RestApi => "rest_api",
            Self::ApiResource => "api_resource",
            Self::ApiAuthorizer => "api_authorizer",
            Self::ApiMethod => "api_method",
            Self::VpcLink => "vpc_link",
            Self::Other(name) => name,
        }
    }

    /// Whether this type takes write-only credentials
    pub fn accepts_sensitive(&self) -> bool {
        matches!(self, Self::Secret | Self::Database)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ResourceType {
    fn from(name: String) -> Self {
        KNOWN_TYPES
            .iter()
            .find(|t| t.as_str() == name)
            .cloned()
            .unwrap_or(Self::Other(name))
    }
}

impl From<ResourceType> for String {
    fn from(kind: ResourceType) -> Self {
        kind.as_str().to_string()
    }
}

/// What happens to a created resource when a later stage fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Left in place after a failed apply
    #[default]
    Retain,
    /// Deleted when the apply that created it fails
    Ephemeral,
}

/// Well-known property keys understood by rule parsing and the checker
pub mod props {
    pub const VPC_ID: &str = "vpc_id";
    pub const INGRESS: &str = "ingress";
    pub const EGRESS: &str = "egress";
    pub const IP_PROTOCOL: &str = "ip_protocol";
    pub const FROM_PORT: &str = "from_port";
    pub const TO_PORT: &str = "to_port";
    pub const CIDR_IP: &str = "cidr_ip";
    pub const SOURCE_GROUP: &str = "source_security_group_id";
    pub const DESTINATION_GROUP: &str = "destination_security_group_id";
    pub const DB_SECURITY_GROUPS: &str = "vpc_security_groups";
    pub const MAP_PUBLIC_IP: &str = "map_public_ip_on_launch";
    pub const SUBNET_ID: &str = "subnet_id";
    pub const ROUTE_TABLE_ID: &str = "route_table_id";
    pub const DESTINATION_CIDR: &str = "destination_cidr_block";
    pub const GATEWAY_ID: &str = "gateway_id";
    pub const NAT_GATEWAY_ID: &str = "nat_gateway_id";
    pub const NAME: &str = "name";
    pub const SECRET_STRING: &str = "secret_string";
    pub const MASTER_USER_PASSWORD: &str = "master_user_password";
}

/// A declared resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceType,
    pub properties: BTreeMap<String, Value>,
    /// Ordering constraints that carry no data reference
    pub depends_on: BTreeSet<ResourceId>,
    pub retention: Retention,
    /// Documented reason for accepting traffic from anywhere (bastion, public ingress)
    pub public_ingress: Option<String>,
}

impl Resource {
    pub fn new(id: impl Into<ResourceId>, kind: ResourceType) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            retention: Retention::default(),
            public_ingress: None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.retention = Retention::Ephemeral;
        self
    }

    pub fn with_public_ingress(mut self, reason: impl Into<String>) -> Self {
        self.public_ingress = Some(reason.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Every reference in this resource's properties
    pub fn references(&self) -> Vec<&Reference> {
        self.properties
            .values()
            .flat_map(Value::references)
            .collect()
    }

    /// Dependencies implied by references
    pub fn inferred_dependencies(&self) -> BTreeSet<ResourceId> {
        self.references()
            .into_iter()
            .map(|r| r.target.clone())
            .collect()
    }

    /// Inferred and explicit dependencies together
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.inferred_dependencies();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }

    pub fn description(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }
}
