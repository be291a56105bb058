//! Core types for resource reconciliation

use crate::backend::ProvisionError;
use crate::resource::{ResourceId, ResourceType, Retention};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Lifecycle status of a resource in a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    /// Create accepted, identifier known, not yet ready
    Provisioning,
    Created,
    Failed,
    Deleted,
}

impl ResourceStatus {
    /// `Created` and `Failed` end a stage's wait
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Created | Self::Failed)
    }
}

/// What the engine knows about one resource after an apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceType,
    pub physical_id: Option<String>,
    pub status: ResourceStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Hash of the declaration, references kept symbolic
    #[serde(default)]
    pub declared_fingerprint: Option<String>,
    /// Hash of the fully resolved properties sent to the backend
    #[serde(default)]
    pub resolved_fingerprint: Option<String>,
    #[serde(default)]
    pub retention: Retention,
    /// Physical ids superseded by a replacement, deleted once an apply succeeds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired: Vec<String>,
    /// Dependencies at the last apply, for tearing down undeclared records
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<ResourceId>,
}

impl ResourceRecord {
    pub fn pending(kind: ResourceType, retention: Retention) -> Self {
        Self {
            kind,
            physical_id: None,
            status: ResourceStatus::Pending,
            attributes: BTreeMap::new(),
            declared_fingerprint: None,
            resolved_fingerprint: None,
            retention,
            retired: Vec::new(),
            depends_on: BTreeSet::new(),
        }
    }

    pub fn is_created(&self) -> bool {
        self.status == ResourceStatus::Created
    }
}

/// Per-resource records keyed by logical id
pub type StateTable = BTreeMap<ResourceId, ResourceRecord>;

/// Result of reconciling a single resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChange {
    /// Resolved properties unchanged since the last apply
    NoChange,
    Created,
    /// Updated in place
    Modified,
    /// Recreated; `retired` is the old physical id, deleted after the apply
    Replaced { retired: String },
    Removed,
    Failed { error: ProvisionError },
    Skipped { reason: String },
}

impl ResourceChange {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Modified | Self::Replaced { .. } | Self::Removed
        )
    }
}

/// Outcome of one resource within an apply or destroy
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub id: ResourceId,
    pub kind: ResourceType,
    pub stage: usize,
    pub change: ResourceChange,
}

/// Counts of outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub modified: usize,
    pub replaced: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
}

impl ApplySummary {
    pub fn total_changes(&self) -> usize {
        self.created + self.modified + self.replaced + self.removed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn total(&self) -> usize {
        self.total_changes() + self.skipped + self.failed + self.no_change
    }

    pub fn merge(&mut self, other: &ApplySummary) {
        self.created += other.created;
        self.modified += other.modified;
        self.replaced += other.replaced;
        self.removed += other.removed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.no_change += other.no_change;
    }

    pub fn add_change(&mut self, change: &ResourceChange) {
        match change {
            ResourceChange::NoChange => self.no_change += 1,
            ResourceChange::Created => self.created += 1,
            ResourceChange::Modified => self.modified += 1,
            ResourceChange::Replaced { .. } => self.replaced += 1,
            ResourceChange::Removed => self.removed += 1,
            ResourceChange::Failed { .. } => self.failed += 1,
            ResourceChange::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Terminal status of an apply or destroy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    Succeeded,
    /// The first resource that failed, in stage order
    Failed {
        resource: ResourceId,
        kind: ResourceType,
        cause: ProvisionError,
    },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub status: ApplyStatus,
    pub summary: ApplySummary,
    pub outcomes: Vec<ResourceOutcome>,
    /// Resources in stages after the halt, never attempted
    pub not_attempted: Vec<ResourceId>,
    /// Ephemeral resources deleted after a failure
    pub rolled_back: Vec<ResourceId>,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.status == ApplyStatus::Succeeded
    }

    pub fn failed_resource(&self) -> Option<&ResourceId> {
        match &self.status {
            ApplyStatus::Failed { resource, .. } => Some(resource),
            _ => None,
        }
    }

    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id.as_str() == id)
    }
}

/// Options for apply and destroy
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Concurrent backend calls within a stage
    pub jobs: usize,
    pub retry: RetryConfig,
    /// Covers the provisioning call and the wait for a terminal state
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}
