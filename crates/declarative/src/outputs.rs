//! Named outputs published after a successful apply

use crate::context::DeployContext;
use crate::graph::ResourceGraph;
use crate::resolver::{ResolveError, Resolver};
use crate::resource::ResourceId;
use crate::types::StateTable;
use crate::value::Reference;
use std::collections::BTreeMap;
use thiserror::Error;

/// A value exported for downstream consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub name: String,
    pub source: Reference,
    pub description: String,
}

impl Output {
    pub fn new(name: impl Into<String>, source: Reference, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source,
            description: description.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutputError {
    #[error("output {output} is not ready: {resource} has not been created")]
    OutputNotReady { output: String, resource: ResourceId },

    #[error("output {output}: {source}")]
    Resolve {
        output: String,
        #[source]
        source: ResolveError,
    },
}

/// Resolve every declared output
///
/// Fails if any source resource has not reached `Created`; outputs are
/// all-or-nothing.
pub fn project(
    graph: &ResourceGraph,
    records: &StateTable,
    context: &DeployContext,
) -> Result<BTreeMap<String, String>, OutputError> {
    let resolver = Resolver::new(context, records);
    let mut projected = BTreeMap::new();

    for output in graph.outputs() {
        let ready = records
            .get(&output.source.target)
            .is_some_and(|record| record.is_created());
        if !ready {
            return Err(OutputError::OutputNotReady {
                output: output.name.clone(),
                resource: output.source.target.clone(),
            });
        }

        let value = resolver
            .resolve_reference(&output.source)
            .map_err(|source| OutputError::Resolve {
                output: output.name.clone(),
                source,
            })?;
        projected.insert(output.name.clone(), value);
    }

    Ok(projected)
}
