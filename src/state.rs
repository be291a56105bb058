use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use declarative::{FingerprintKey, StateTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// State Structures
// ============================================================================

/// Persisted record of a stack's deployments
///
/// Holds per-resource records (physical ids, statuses, fingerprints and
/// non-sensitive attributes) and the outputs of the last successful deploy.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeployState {
    pub stack: String,

    pub environment: String,

    /// Last successful deploy
    #[serde(default)]
    pub last_deployed: Option<DateTime<Utc>>,

    /// Last time the state was written
    pub last_updated: DateTime<Utc>,

    /// Outputs projected by the last successful deploy
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Reconciliation records keyed by logical id
    #[serde(default)]
    pub resources: StateTable,
}

// ============================================================================
// DeployState Implementation
// ============================================================================

impl DeployState {
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            stack: stack.to_string(),
            environment: environment.to_string(),
            last_deployed: None,
            last_updated: Utc::now(),
            outputs: BTreeMap::new(),
            resources: StateTable::new(),
        }
    }

    /// State file for `stack` inside `dir`
    pub fn state_file(dir: &Path, stack: &str) -> PathBuf {
        dir.join(format!("{stack}.toml"))
    }

    /// Load state from disk, or start fresh if the file doesn't exist
    pub fn load(dir: &Path, stack: &str, environment: &str) -> Result<Self> {
        let path = Self::state_file(dir, stack);

        if !path.exists() {
            log::debug!("State file {} does not exist, starting fresh", path.display());
            return Ok(Self::new(stack, environment));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        if state.stack != stack {
            anyhow::bail!(
                "State file {} belongs to stack '{}', not '{}'",
                path.display(),
                state.stack,
                stack
            );
        }

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Update the timestamp and save to disk
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        self.last_updated = Utc::now();
        let path = Self::state_file(dir, &self.stack);
        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;

        fs::write(&path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Record a successful deploy and its outputs
    pub fn mark_deployed(&mut self, outputs: BTreeMap<String, String>) {
        self.outputs = outputs;
        self.last_deployed = Some(Utc::now());
    }

    /// Outputs are stale once any resource changes outside a successful deploy
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources with a physical counterpart
    pub fn live_count(&self) -> usize {
        self.resources
            .values()
            .filter(|r| r.physical_id.is_some())
            .count()
    }
}

// ============================================================================
// Fingerprint Key
// ============================================================================

/// Key file for `stack` inside `dir`, kept apart from the state file
pub fn key_file(dir: &Path, stack: &str) -> PathBuf {
    dir.join(format!("{stack}.key"))
}

/// Load the stack's fingerprint key if one has been created
pub fn load_key(dir: &Path, stack: &str) -> Result<Option<FingerprintKey>> {
    let path = key_file(dir, stack);
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    let key = FingerprintKey::from_hex(&content)
        .with_context(|| format!("Malformed key file: {}", path.display()))?;
    Ok(Some(key))
}

/// Load the stack's fingerprint key, creating it on first deploy
pub fn load_or_create_key(dir: &Path, stack: &str) -> Result<FingerprintKey> {
    if let Some(key) = load_key(dir, stack)? {
        return Ok(key);
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    let key = FingerprintKey::generate();
    let path = key_file(dir, stack);
    fs::write(&path, key.to_hex())
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)
            .with_context(|| format!("Failed to restrict key file: {}", path.display()))?;
    }

    log::debug!("Created fingerprint key {}", path.display());
    Ok(key)
}

// ============================================================================
// Tests
// ============================================================================
