//! Read back the database connection secret
//!
//! The password is checked for presence but never printed.

use anyhow::Result;
use declarative::{MemoryProvisioner, SecretError, SecretPayload};

use super::open_backend;
use crate::Context;
use crate::topology;
use crate::ui;

/// Look up and parse a connection secret
pub fn fetch(backend: &MemoryProvisioner, name: &str) -> Result<SecretPayload, SecretError> {
    let json = backend
        .secret_string(name)
        .ok_or_else(|| SecretError::NotFound(name.to_string()))?;
    SecretPayload::parse(&json)
}

pub fn run(ctx: &Context, name: Option<&str>) -> Result<()> {
    let name = name.unwrap_or(topology::SECRET_NAME);
    let simulator = open_backend(ctx)?;
    let payload = fetch(simulator.backend(), name)?;

    ui::header(name);
    ui::kv("Server", &payload.server);
    ui::kv("Database", &payload.database);
    ui::kv("User", &payload.user);
    ui::kv("Password", "(set)");
    ui::kv("Connection", &payload.redacted_connection_string());
    Ok(())
}
