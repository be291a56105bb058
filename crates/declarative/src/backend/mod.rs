//! Provisioning backend interface
//!
//! The engine talks to the control plane only through [`Provisioner`].
//! Backends categorize their errors so the engine knows which ones are
//! worth retrying.

pub mod memory;

use crate::resource::ResourceType;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use memory::{MemoryOptions, MemoryProvisioner};

/// Fully resolved properties as sent to a backend
pub type Properties = Map<String, Json>;

/// Categories of provisioning errors for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Throttling, eventual consistency, dropped connections
    Transient,
    /// The backend rejected the request
    Permanent,
    /// Per-resource deadline exceeded
    Timeout,
    Cancelled,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Transient => "Transient backend error",
            Self::Permanent => "Request rejected by backend",
            Self::Timeout => "Resource did not become ready in time",
            Self::Cancelled => "Operation cancelled",
        }
    }

    pub fn advice(self) -> &'static str {
        match self {
            Self::Transient => "Retry the deploy; the backend may be throttling",
            Self::Permanent => "Fix the resource declaration and deploy again",
            Self::Timeout => "Raise engine.timeout_secs or check the backend",
            Self::Cancelled => "Deploy again to finish the remaining stages",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("{message}")]
    Permanent { message: String },

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl ProvisionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Permanent,
            Self::TimedOut(_) => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Response to an accepted create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub physical_id: String,
    pub attributes: BTreeMap<String, String>,
}

/// Remote lifecycle state reported by `describe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    InProgress,
    Ready,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub state: RemoteState,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The change requires a replacement
    NotSupported,
}

/// The control plane, per resource type
///
/// Calls may run concurrently from the engine's worker pool.
pub trait Provisioner: Send + Sync {
    fn create(
        &self,
        kind: &ResourceType,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<Created, ProvisionError>;

    fn describe(&self, kind: &ResourceType, physical_id: &str)
    -> Result<Description, ProvisionError>;

    fn update(
        &self,
        kind: &ResourceType,
        physical_id: &str,
        properties: &Properties,
    ) -> Result<UpdateOutcome, ProvisionError>;

    /// Deleting something that no longer exists succeeds
    fn delete(&self, kind: &ResourceType, physical_id: &str) -> Result<(), ProvisionError>;
}
