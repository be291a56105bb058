//! Simulated control plane persisted next to the deploy state
//!
//! The in-memory provisioner's world (every created resource, including the
//! secret store) is saved as `<stack>.backend.json` so that deploy, destroy
//! and secret lookups see the same backend across invocations.

use anyhow::{Context, Result};
use declarative::backend::memory::World;
use declarative::{MemoryOptions, MemoryProvisioner};
use std::fs;
use std::path::{Path, PathBuf};

pub struct Simulator {
    path: PathBuf,
    backend: MemoryProvisioner,
}

impl Simulator {
    pub fn backend_file(dir: &Path, stack: &str) -> PathBuf {
        dir.join(format!("{stack}.backend.json"))
    }

    /// Open the simulated backend for `stack`, empty if never saved
    pub fn open(dir: &Path, stack: &str, options: MemoryOptions) -> Result<Self> {
        let path = Self::backend_file(dir, stack);
        let world = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read backend file: {}", path.display()))?;
            serde_json::from_str::<World>(&content)
                .with_context(|| format!("Failed to parse backend file: {}", path.display()))?
        } else {
            World::default()
        };
        log::debug!(
            "Simulated backend {} holds {} resource(s)",
            path.display(),
            world.resources.len()
        );

        Ok(Self {
            path,
            backend: MemoryProvisioner::with_world(options, world),
        })
    }

    pub fn backend(&self) -> &MemoryProvisioner {
        &self.backend
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.backend.world())
            .context("Failed to serialize simulated backend")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write backend file: {}", self.path.display()))?;
        log::debug!("Saved simulated backend to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::Provisioner;
    use declarative::ResourceType;
    use declarative::backend::Properties;

    #[test]
    fn test_world_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulator::open(dir.path(), "Stack", MemoryOptions::default()).unwrap();
        assert!(sim.backend().is_empty());

        let mut properties = Properties::new();
        properties.insert("name".into(), "Sample/Production/DB/Connection".into());
        properties.insert("secret_string".into(), "{}".into());
        let created = sim
            .backend()
            .create(&ResourceType::Secret, "Secret", &properties)
            .unwrap();
        sim.save().unwrap();

        let reopened = Simulator::open(dir.path(), "Stack", MemoryOptions::default()).unwrap();
        assert!(reopened.backend().contains(&created.physical_id));
        assert_eq!(
            reopened
                .backend()
                .secret_string("Sample/Production/DB/Connection")
                .as_deref(),
            Some("{}")
        );
    }
}
