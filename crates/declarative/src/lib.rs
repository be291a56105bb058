//! # Declarative
//!
//! Declarative provisioning of interdependent cloud resources.
//!
//! A stack is declared as a [`ResourceGraph`] of typed resources whose
//! properties may reference other resources. The engine orders them into
//! dependency stages, resolves references against live state and
//! converges a [`Provisioner`] backend to match the declaration.
//!
//! ## Core Concepts
//!
//! - **Resource**: A logical id, a type and a property map ([`Value`]s)
//! - **Reference**: A typed edge to another resource's id or attribute
//! - **Plan**: Kahn stages; stage N depends only on stages before it
//! - **Engine**: Reconciles one stage at a time with bounded parallelism
//! - **Checker**: Topology invariants checked before any backend call
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     DeployContext, Engine, MemoryProvisioner, Reference, Resource,
//!     ResourceGraph, ResourceType, StateTable, scheduler,
//! };
//!
//! let mut graph = ResourceGraph::new();
//! graph.add_resource(Resource::new("VPC", ResourceType::Network).with("cidr_block", "10.0.0.0/16"))?;
//! graph.add_resource(
//!     Resource::new("PublicSubnet", ResourceType::Subnet)
//!         .with("vpc_id", Reference::id("VPC"))
//!         .with("cidr_block", "10.0.0.0/24"),
//! )?;
//!
//! let plan = scheduler::plan(&graph)?;
//! let backend = MemoryProvisioner::default();
//! let mut records = StateTable::new();
//! let result = Engine::new(&backend, Default::default())
//!     .apply(&graph, &plan, &DeployContext::default(), &mut records)?;
//! assert!(result.is_success());
//! ```
//!
//! ## Seams
//!
//! - [`Provisioner`]: The cloud backend (create, describe, update, delete)
//! - [`ProgressCallback`]: Receives stage and resource progress
//! - [`CancelToken`]: Stops new work between backend calls
//!
//! The crate has no UI or persistence; callers own the state table.

pub mod backend;
pub mod checker;
pub mod context;
pub mod diff;
pub mod engine;
pub mod fingerprint;
pub mod graph;
pub mod outputs;
pub mod resolver;
pub mod resource;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod secret;
pub mod types;
pub mod value;

// Re-export main types at crate root
pub use backend::{
    ErrorCategory, MemoryOptions, MemoryProvisioner, ProvisionError, Provisioner,
};
pub use checker::{Rule, Severity, Violation};
pub use context::{CancelToken, DeployContext, NoProgress, ProgressCallback};
pub use diff::{compute_diffs, group_by_type, DiffSummary, PlannedAction, ResourceDiff, TargetFilter};
pub use engine::{Engine, EngineError};
pub use fingerprint::FingerprintKey;
pub use graph::{DefinitionError, GraphError, ResourceGraph};
pub use outputs::{Output, OutputError};
pub use resolver::{ResolveError, Resolver};
pub use resource::{Resource, ResourceId, ResourceType, Retention};
pub use retry::RetryConfig;
pub use rules::{Direction, Peer, PortRange, Protocol, SecurityRule};
pub use scheduler::{Plan, ScheduleError};
pub use secret::{SecretError, SecretPayload};
pub use types::{
    ApplyOptions, ApplyResult, ApplyStatus, ApplySummary, ResourceChange, ResourceOutcome,
    ResourceRecord, ResourceStatus, StateTable,
};
pub use value::{Attribute, ContextKey, Reference, Value};
