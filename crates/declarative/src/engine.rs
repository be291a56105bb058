//! Reconciliation engine
//!
//! Applies a [`Plan`] stage by stage. Within a stage, backend calls run on a
//! bounded rayon pool; the engine waits for every resource in the stage to
//! reach a terminal state before advancing. The first failure halts the
//! apply.

use crate::backend::{Properties, ProvisionError, Provisioner, RemoteState, UpdateOutcome};
use crate::checker::{self, Violation};
use crate::context::{CancelToken, DeployContext, NoProgress, ProgressCallback};
use crate::fingerprint::{self, FingerprintKey};
use crate::graph::{DefinitionError, ResourceGraph};
use crate::resolver::{ResolveError, Resolver};
use crate::resource::{Resource, ResourceId, ResourceType, Retention};
use crate::retry::{LogCallback, with_retry};
use crate::scheduler::Plan;
use crate::types::{
    ApplyOptions, ApplyResult, ApplyStatus, ApplySummary, ResourceChange, ResourceOutcome,
    ResourceRecord, ResourceStatus, StateTable,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resource graph is invalid ({} error(s))", .0.len())]
    Invalid(Vec<DefinitionError>),

    #[error("apply blocked by {} security violation(s)", .0.len())]
    Blocked(Vec<Violation>),

    #[error("plan references unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),
}

enum Action {
    Unchanged,
    Create,
    Update(String),
    /// Existing physical resource is failed; create a fresh one
    Replace(String),
    /// Properties could not be resolved; nothing is sent to the backend
    Unresolvable(ResolveError),
}

struct Work<'g> {
    resource: &'g Resource,
    properties: Properties,
    declared: String,
    resolved: String,
    action: Action,
}

struct Reconciled {
    change: ResourceChange,
    physical_id: Option<String>,
    attributes: BTreeMap<String, String>,
    /// On failure, the recorded physical resource was left untouched
    intact: bool,
}

impl Reconciled {
    fn ok(change: ResourceChange, physical_id: String, attributes: BTreeMap<String, String>) -> Self {
        Self {
            change,
            physical_id: Some(physical_id),
            attributes,
            intact: false,
        }
    }

    fn unchanged() -> Self {
        Self {
            change: ResourceChange::NoChange,
            physical_id: None,
            attributes: BTreeMap::new(),
            intact: false,
        }
    }
}

/// A failed backend interaction, with the physical id that now stands for
/// the resource (if any)
struct Failure {
    physical_id: Option<String>,
    error: ProvisionError,
    intact: bool,
}

impl Failure {
    fn new(physical_id: Option<String>, error: ProvisionError) -> Self {
        Self {
            physical_id,
            error,
            intact: false,
        }
    }

    /// The failure left the previously recorded resource as it was
    fn intact(physical_id: Option<String>, error: ProvisionError) -> Self {
        Self {
            physical_id,
            error,
            intact: true,
        }
    }
}

pub struct Engine<'a> {
    backend: &'a dyn Provisioner,
    options: ApplyOptions,
    progress: &'a dyn ProgressCallback,
    cancel: CancelToken,
    fingerprint_key: Option<FingerprintKey>,
}

impl<'a> Engine<'a> {
    pub fn new(backend: &'a dyn Provisioner, options: ApplyOptions) -> Self {
        Self {
            backend,
            options,
            progress: &NoProgress,
            cancel: CancelToken::new(),
            fingerprint_key: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seal sensitive values into fingerprints so credential changes are
    /// detected; without a key they are masked
    pub fn with_fingerprint_key(mut self, key: FingerprintKey) -> Self {
        self.fingerprint_key = Some(key);
        self
    }

    fn pool(&self) -> Result<rayon::ThreadPool, EngineError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.max(1))
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))
    }

    /// Validate and check the graph; nothing reaches the backend otherwise
    pub fn preflight(graph: &ResourceGraph) -> Result<Vec<Violation>, EngineError> {
        let errors = graph.validate();
        if !errors.is_empty() {
            return Err(EngineError::Invalid(errors));
        }

        let (blocking, advisory): (Vec<_>, Vec<_>) = checker::check(graph)
            .into_iter()
            .partition(Violation::is_blocking);
        if !blocking.is_empty() {
            return Err(EngineError::Blocked(blocking));
        }
        for violation in &advisory {
            log::warn!("{violation}");
        }
        Ok(advisory)
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Create or update every resource in plan order
    ///
    /// `records` carries state from previous applies in and the new state
    /// out; it is updated even when the apply fails.
    pub fn apply(
        &self,
        graph: &ResourceGraph,
        plan: &Plan,
        context: &DeployContext,
        records: &mut StateTable,
    ) -> Result<ApplyResult, EngineError> {
        Self::preflight(graph)?;
        let pool = self.pool()?;
        let stages = plan.stages();

        let mut status = ApplyStatus::Succeeded;
        let mut summary = ApplySummary::default();
        let mut outcomes = Vec::new();
        let mut created_this_run = Vec::new();
        let mut halted_at = None;

        for (index, stage) in stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Cancelled before stage {}", index + 1);
                status = ApplyStatus::Cancelled;
                halted_at = Some(index);
                break;
            }

            log::debug!("Stage {}/{}: {} resource(s)", index + 1, stages.len(), stage.len());
            self.progress.on_stage_start(index, stages.len(), stage.len());

            let work = self.prepare(graph, stage, context, records)?;
            let results: Vec<Reconciled> =
                pool.install(|| work.par_iter().map(|w| self.reconcile(w)).collect());

            let mut stage_failure = None;
            let mut stage_cancelled = false;
            for (work, reconciled) in work.iter().zip(results) {
                let resource = work.resource;
                Self::record(records, work, &reconciled);

                match &reconciled.change {
                    ResourceChange::Created => created_this_run.push(resource.id.clone()),
                    ResourceChange::Failed { error } if stage_failure.is_none() => {
                        stage_failure = Some(ApplyStatus::Failed {
                            resource: resource.id.clone(),
                            kind: resource.kind.clone(),
                            cause: error.clone(),
                        });
                    }
                    ResourceChange::Skipped { .. } => stage_cancelled = true,
                    _ => {}
                }

                summary.add_change(&reconciled.change);
                outcomes.push(ResourceOutcome {
                    id: resource.id.clone(),
                    kind: resource.kind.clone(),
                    stage: index,
                    change: reconciled.change,
                });
            }

            self.progress.on_stage_complete(index);

            if let Some(failure) = stage_failure {
                status = failure;
                halted_at = Some(index + 1);
                break;
            }
            if stage_cancelled {
                status = ApplyStatus::Cancelled;
                halted_at = Some(index + 1);
                break;
            }
        }

        let not_attempted: Vec<ResourceId> = halted_at
            .map(|start| stages[start..].iter().flatten().cloned().collect())
            .unwrap_or_default();

        let mut rolled_back = Vec::new();
        match &status {
            ApplyStatus::Failed { resource, cause, .. } => {
                log::info!("Apply failed at {resource}: {cause}");
                rolled_back = self.roll_back(&created_this_run, records);
            }
            ApplyStatus::Succeeded => self.delete_retired(plan, records),
            ApplyStatus::Cancelled => {}
        }

        Ok(ApplyResult {
            status,
            summary,
            outcomes,
            not_attempted,
            rolled_back,
        })
    }

    /// Resolve properties and decide what to do for each resource in a stage
    fn prepare<'g>(
        &self,
        graph: &'g ResourceGraph,
        stage: &[ResourceId],
        context: &DeployContext,
        records: &StateTable,
    ) -> Result<Vec<Work<'g>>, EngineError> {
        let key = self.fingerprint_key.as_ref();
        let resolver = Resolver::new(context, records);
        let sealed = Resolver::new(context, records).sealed(key);
        stage
            .iter()
            .map(|id| -> Result<Work<'g>, EngineError> {
                let resource = graph
                    .get(id.as_str())
                    .ok_or_else(|| EngineError::UnknownResource(id.clone()))?;
                let declared = fingerprint::declared(resource, key);

                // the fingerprint never sees credentials in clear text
                let (properties, resolved) = match (
                    resolver.resolve_properties(resource),
                    sealed.resolve_properties(resource),
                ) {
                    (Ok(properties), Ok(masked)) => {
                        (properties, fingerprint::resolved(&resource.kind, &masked))
                    }
                    (Err(error), _) | (_, Err(error)) => {
                        return Ok(Work {
                            resource,
                            properties: Properties::new(),
                            declared,
                            resolved: String::new(),
                            action: Action::Unresolvable(error),
                        });
                    }
                };

                let action = match records.get(id) {
                    Some(record) if record.is_created() => match &record.physical_id {
                        Some(_) if record.resolved_fingerprint.as_deref() == Some(&resolved) => {
                            Action::Unchanged
                        }
                        Some(physical_id) => Action::Update(physical_id.clone()),
                        None => Action::Create,
                    },
                    Some(ResourceRecord {
                        status: ResourceStatus::Failed | ResourceStatus::Provisioning,
                        physical_id: Some(physical_id),
                        ..
                    }) => Action::Replace(physical_id.clone()),
                    _ => Action::Create,
                };

                Ok(Work {
                    resource,
                    properties,
                    declared,
                    resolved,
                    action,
                })
            })
            .collect()
    }

    fn reconcile(&self, work: &Work<'_>) -> Reconciled {
        let resource = work.resource;
        self.progress
            .on_resource_start(&resource.id, &resource.description());

        let deadline = Instant::now() + self.options.timeout;
        let result = match &work.action {
            Action::Unchanged => Ok(Reconciled::unchanged()),
            Action::Create => self
                .create_and_wait(resource, &work.properties, deadline)
                .map(|(id, attributes)| Reconciled::ok(ResourceChange::Created, id, attributes)),
            Action::Update(physical_id) => {
                self.update(resource, physical_id, &work.properties, deadline)
            }
            Action::Replace(physical_id) => {
                self.replace(resource, physical_id, false, &work.properties, deadline)
            }
            Action::Unresolvable(error) => Err(Failure::intact(
                None,
                ProvisionError::permanent(format!("cannot resolve properties: {error}")),
            )),
        };

        let reconciled = result.unwrap_or_else(|failure| Reconciled {
            change: match failure.error {
                ProvisionError::Cancelled => ResourceChange::Skipped {
                    reason: "cancelled".to_string(),
                },
                error => ResourceChange::Failed { error },
            },
            physical_id: failure.physical_id,
            attributes: BTreeMap::new(),
            intact: failure.intact,
        });

        match &reconciled.change {
            ResourceChange::Failed { error } => {
                log::info!("{} failed: {error}", resource.id);
            }
            ResourceChange::NoChange | ResourceChange::Skipped { .. } => {
                log::debug!("{}: {:?}", resource.id, reconciled.change);
            }
            change => log::info!(
                "{} {:?} ({})",
                resource.id,
                change,
                reconciled.physical_id.as_deref().unwrap_or("-")
            ),
        }
        self.progress
            .on_resource_complete(&resource.id, &reconciled.change);
        reconciled
    }

    fn create_and_wait(
        &self,
        resource: &Resource,
        properties: &Properties,
        deadline: Instant,
    ) -> Result<(String, BTreeMap<String, String>), Failure> {
        let callback = LogCallback {
            resource: resource.id.as_str(),
        };
        let created = with_retry(
            &self.options.retry,
            &self.cancel,
            Some(deadline),
            Some(&callback),
            |_| {
                self.backend
                    .create(&resource.kind, resource.id.as_str(), properties)
            },
        )
        .map_err(|error| Failure::new(None, error))?;

        log::debug!("{} accepted as {}", resource.id, created.physical_id);
        let attributes = self
            .wait_ready(&resource.kind, &created.physical_id, created.attributes, deadline)
            .map_err(|error| Failure::new(Some(created.physical_id.clone()), error))?;
        Ok((created.physical_id, attributes))
    }

    fn update(
        &self,
        resource: &Resource,
        physical_id: &str,
        properties: &Properties,
        deadline: Instant,
    ) -> Result<Reconciled, Failure> {
        let callback = LogCallback {
            resource: resource.id.as_str(),
        };
        let outcome = with_retry(
            &self.options.retry,
            &self.cancel,
            Some(deadline),
            Some(&callback),
            |_| self.backend.update(&resource.kind, physical_id, properties),
        )
        .map_err(|error| Failure::new(Some(physical_id.to_string()), error))?;

        match outcome {
            UpdateOutcome::Updated => {
                let attributes = self
                    .wait_ready(&resource.kind, physical_id, BTreeMap::new(), deadline)
                    .map_err(|error| Failure::new(Some(physical_id.to_string()), error))?;
                Ok(Reconciled::ok(
                    ResourceChange::Modified,
                    physical_id.to_string(),
                    attributes,
                ))
            }
            UpdateOutcome::NotSupported => {
                log::debug!("{} cannot be updated in place; replacing", resource.id);
                self.replace(resource, physical_id, true, properties, deadline)
            }
        }
    }

    /// Create a new physical resource; the old one is retired, not deleted,
    /// until dependents have been rewired by the rest of the apply
    ///
    /// `old_healthy` says whether the old resource is still serving, in
    /// which case a failed replacement leaves it recorded as it was.
    fn replace(
        &self,
        resource: &Resource,
        old: &str,
        old_healthy: bool,
        properties: &Properties,
        deadline: Instant,
    ) -> Result<Reconciled, Failure> {
        match self.create_and_wait(resource, properties, deadline) {
            Ok((new, attributes)) => Ok(Reconciled::ok(
                ResourceChange::Replaced {
                    retired: old.to_string(),
                },
                new,
                attributes,
            )),
            Err(failure) => {
                if let Some(new) = &failure.physical_id
                    && let Err(e) = self.backend.delete(&resource.kind, new)
                {
                    log::warn!("Failed to clean up replacement {new} of {}: {e}", resource.id);
                }
                if old_healthy {
                    Err(Failure::intact(Some(old.to_string()), failure.error))
                } else {
                    Err(Failure::new(Some(old.to_string()), failure.error))
                }
            }
        }
    }

    /// Poll until ready, failed or past the deadline
    ///
    /// Cancellation does not interrupt this wait: an accepted create is
    /// allowed to finish.
    fn wait_ready(
        &self,
        kind: &ResourceType,
        physical_id: &str,
        mut attributes: BTreeMap<String, String>,
        deadline: Instant,
    ) -> Result<BTreeMap<String, String>, ProvisionError> {
        let in_flight = CancelToken::new();
        loop {
            let description = with_retry(&self.options.retry, &in_flight, Some(deadline), None, |_| {
                self.backend.describe(kind, physical_id)
            })?;
            attributes.extend(description.attributes);

            match description.state {
                RemoteState::Ready => return Ok(attributes),
                RemoteState::Failed { reason } => return Err(ProvisionError::permanent(reason)),
                RemoteState::InProgress => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::TimedOut(self.options.timeout));
            }
            thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }

    fn record(records: &mut StateTable, work: &Work<'_>, reconciled: &Reconciled) {
        let resource = work.resource;
        if matches!(reconciled.change, ResourceChange::Skipped { .. }) {
            return;
        }

        let record = records
            .entry(resource.id.clone())
            .or_insert_with(|| ResourceRecord::pending(resource.kind.clone(), resource.retention));
        record.kind = resource.kind.clone();
        record.retention = resource.retention;
        record.depends_on = resource.dependencies();

        match &reconciled.change {
            ResourceChange::NoChange => {
                record.declared_fingerprint = Some(work.declared.clone());
            }
            ResourceChange::Created | ResourceChange::Modified | ResourceChange::Replaced { .. } => {
                if let ResourceChange::Replaced { retired } = &reconciled.change {
                    record.retired.push(retired.clone());
                }
                record.status = ResourceStatus::Created;
                record.physical_id.clone_from(&reconciled.physical_id);
                record.attributes.clone_from(&reconciled.attributes);
                record.declared_fingerprint = Some(work.declared.clone());
                record.resolved_fingerprint = Some(work.resolved.clone());
            }
            ResourceChange::Failed { .. } if reconciled.intact => {
                if record.status == ResourceStatus::Pending {
                    record.status = ResourceStatus::Failed;
                }
            }
            ResourceChange::Failed { .. } => {
                record.status = ResourceStatus::Failed;
                record.physical_id.clone_from(&reconciled.physical_id);
                record.resolved_fingerprint = None;
            }
            ResourceChange::Removed | ResourceChange::Skipped { .. } => {}
        }
    }

    /// Delete ephemeral resources created by a failed apply, newest first
    fn roll_back(&self, created: &[ResourceId], records: &mut StateTable) -> Vec<ResourceId> {
        let mut rolled_back = Vec::new();
        for id in created.iter().rev() {
            let Some(record) = records.get_mut(id) else {
                continue;
            };
            if record.retention != Retention::Ephemeral {
                continue;
            }
            let Some(physical_id) = record.physical_id.clone() else {
                continue;
            };

            match self.delete_with_retry(id.as_str(), &record.kind, &physical_id) {
                Ok(()) => {
                    log::info!("Rolled back {id} ({physical_id})");
                    record.status = ResourceStatus::Deleted;
                    record.physical_id = None;
                    record.attributes.clear();
                    record.resolved_fingerprint = None;
                    rolled_back.push(id.clone());
                }
                Err(e) => log::warn!("Failed to roll back {id}: {e}"),
            }
        }
        rolled_back
    }

    /// Delete physical resources superseded by replacements, in teardown order
    fn delete_retired(&self, plan: &Plan, records: &mut StateTable) {
        let order: Vec<ResourceId> = plan.teardown().into_iter().flatten().collect();
        for id in order {
            let Some(record) = records.get_mut(&id) else {
                continue;
            };
            let kind = record.kind.clone();
            record.retired.retain(|old| {
                match self.delete_with_retry(id.as_str(), &kind, old) {
                    Ok(()) => {
                        log::info!("Deleted retired {id} ({old})");
                        false
                    }
                    Err(e) => {
                        log::warn!("Failed to delete retired {id} ({old}): {e}");
                        true
                    }
                }
            });
        }
    }

    fn delete_with_retry(
        &self,
        id: &str,
        kind: &ResourceType,
        physical_id: &str,
    ) -> Result<(), ProvisionError> {
        let callback = LogCallback { resource: id };
        with_retry(
            &self.options.retry,
            &CancelToken::new(),
            None,
            Some(&callback),
            |_| self.backend.delete(kind, physical_id),
        )
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    /// Delete every recorded resource in reverse creation order
    ///
    /// Records no longer in the plan are deleted first. Teardown stops after
    /// the first stage with a failure.
    pub fn destroy(&self, plan: &Plan, records: &mut StateTable) -> Result<ApplyResult, EngineError> {
        let pool = self.pool()?;

        let orphans: BTreeSet<ResourceId> = records
            .keys()
            .filter(|id| plan.stage_of(id.as_str()).is_none())
            .cloned()
            .collect();
        let mut stages = orphan_teardown(records, &orphans);
        stages.extend(plan.teardown());

        let mut status = ApplyStatus::Succeeded;
        let mut summary = ApplySummary::default();
        let mut outcomes = Vec::new();
        let mut halted_at = None;

        for (index, stage) in stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                status = ApplyStatus::Cancelled;
                halted_at = Some(index);
                break;
            }

            let work: Vec<(ResourceId, ResourceType, Vec<String>)> = stage
                .iter()
                .filter_map(|id| {
                    let record = records.get(id)?;
                    let mut physical_ids = record.retired.clone();
                    if record.status != ResourceStatus::Deleted
                        && let Some(physical_id) = &record.physical_id
                    {
                        physical_ids.push(physical_id.clone());
                    }
                    Some((id.clone(), record.kind.clone(), physical_ids))
                })
                .collect();
            if work.is_empty() {
                continue;
            }

            self.progress.on_stage_start(index, stages.len(), work.len());
            let results: Vec<ResourceChange> = pool.install(|| {
                work.par_iter()
                    .map(|(id, kind, physical_ids)| self.teardown_one(id, kind, physical_ids))
                    .collect()
            });

            let mut stage_failure = None;
            let mut stage_cancelled = false;
            for ((id, kind, _), change) in work.into_iter().zip(results) {
                match &change {
                    ResourceChange::Removed => {
                        records.remove(&id);
                    }
                    ResourceChange::Failed { error } => {
                        if let Some(record) = records.get_mut(&id) {
                            record.status = ResourceStatus::Failed;
                        }
                        if stage_failure.is_none() {
                            stage_failure = Some(ApplyStatus::Failed {
                                resource: id.clone(),
                                kind: kind.clone(),
                                cause: error.clone(),
                            });
                        }
                    }
                    ResourceChange::Skipped { .. } => stage_cancelled = true,
                    _ => {}
                }
                summary.add_change(&change);
                outcomes.push(ResourceOutcome {
                    id,
                    kind,
                    stage: index,
                    change,
                });
            }
            self.progress.on_stage_complete(index);

            if let Some(failure) = stage_failure {
                status = failure;
                halted_at = Some(index + 1);
                break;
            }
            if stage_cancelled {
                status = ApplyStatus::Cancelled;
                halted_at = Some(index + 1);
                break;
            }
        }

        let not_attempted: Vec<ResourceId> = halted_at
            .map(|start| stages[start..].iter().flatten().cloned().collect())
            .unwrap_or_default();

        Ok(ApplyResult {
            status,
            summary,
            outcomes,
            not_attempted,
            rolled_back: Vec::new(),
        })
    }

    fn teardown_one(&self, id: &ResourceId, kind: &ResourceType, physical_ids: &[String]) -> ResourceChange {
        self.progress.on_resource_start(id, &format!("{kind} {id}"));
        let callback = LogCallback { resource: id.as_str() };
        let deadline = Instant::now() + self.options.timeout;

        let mut change = ResourceChange::Removed;
        for physical_id in physical_ids {
            let result = with_retry(
                &self.options.retry,
                &self.cancel,
                Some(deadline),
                Some(&callback),
                |_| self.backend.delete(kind, physical_id),
            );
            match result {
                Ok(()) => log::info!("Deleted {id} ({physical_id})"),
                Err(ProvisionError::Cancelled) => {
                    change = ResourceChange::Skipped {
                        reason: "cancelled".to_string(),
                    };
                    break;
                }
                Err(error) => {
                    log::info!("Failed to delete {id}: {error}");
                    change = ResourceChange::Failed { error };
                    break;
                }
            }
        }

        self.progress.on_resource_complete(id, &change);
        change
    }
}

/// Teardown stages for records no longer declared, dependents first
///
/// Ordered by the dependencies recorded at their last apply.
fn orphan_teardown(records: &StateTable, orphans: &BTreeSet<ResourceId>) -> Vec<Vec<ResourceId>> {
    let mut remaining: BTreeMap<&ResourceId, BTreeSet<&ResourceId>> = orphans
        .iter()
        .map(|id| {
            let dependencies = records
                .get(id)
                .map(|record| {
                    record
                        .depends_on
                        .iter()
                        .filter(|d| orphans.contains(*d))
                        .collect()
                })
                .unwrap_or_default();
            (id, dependencies)
        })
        .collect();

    let mut stages = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<ResourceId> = remaining
            .iter()
            .filter(|(_, dependencies)| dependencies.is_empty())
            .map(|(id, _)| (*id).clone())
            .collect();
        if ready.is_empty() {
            // recorded dependencies form a cycle; delete the rest together
            ready = remaining.keys().map(|id| (*id).clone()).collect();
        }
        for id in &ready {
            remaining.remove(id);
        }
        for dependencies in remaining.values_mut() {
            for id in &ready {
                dependencies.remove(id);
            }
        }
        stages.push(ready);
    }
    stages.reverse();
    stages
}
