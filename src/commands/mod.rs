//! Command implementations
//!
//! Commands print their own report and return an error when the process
//! should exit non-zero.

pub mod deploy;
pub mod destroy;
pub mod diff;
pub mod outputs;
pub mod secret;
pub mod synth;

use anyhow::{Context as _, Result};
use declarative::{ApplyOptions, ApplySummary, DefinitionError, Plan, ResourceGraph, scheduler};

use crate::Context;
use crate::cli::PasswordArgs;
use crate::simulator::Simulator;
use crate::state::DeployState;
use crate::topology;
use crate::ui;

/// The stack without credentials, for commands that never send properties
fn declared_graph() -> Result<ResourceGraph> {
    topology::build("").context("Failed to declare the stack")
}

fn require_password(args: &PasswordArgs) -> Result<&str> {
    match args.db_password.as_deref() {
        Some(password) if !password.is_empty() => Ok(password),
        _ => anyhow::bail!(
            "A database password is required (--db-password or STACKFORM_DB_PASSWORD)"
        ),
    }
}

fn plan(graph: &ResourceGraph) -> Result<Plan> {
    scheduler::plan(graph).context("Failed to order the stack")
}

fn report_definition_errors(errors: &[DefinitionError]) {
    ui::section("Definition errors");
    for error in errors {
        ui::error(&error.to_string());
    }
}

fn load_state(ctx: &Context) -> Result<DeployState> {
    DeployState::load(&ctx.state_dir, &ctx.deploy.stack_name, &ctx.deploy.environment)
}

fn open_backend(ctx: &Context) -> Result<Simulator> {
    Simulator::open(
        &ctx.state_dir,
        &ctx.deploy.stack_name,
        ctx.config.simulation.memory_options(),
    )
}

fn apply_options(ctx: &Context, jobs: Option<usize>) -> Result<ApplyOptions> {
    let mut options = ctx.config.engine.apply_options();
    if let Some(jobs) = jobs {
        if jobs == 0 {
            anyhow::bail!("--jobs must be at least 1");
        }
        options.jobs = jobs;
    }
    Ok(options)
}

/// Print final summary
fn print_summary(summary: &ApplySummary) {
    if summary.created > 0 {
        println!("    • {} resources created", summary.created);
    }
    if summary.modified > 0 {
        println!("    • {} resources updated", summary.modified);
    }
    if summary.replaced > 0 {
        println!("    • {} resources replaced", summary.replaced);
    }
    if summary.removed > 0 {
        println!("    • {} resources deleted", summary.removed);
    }
    if summary.no_change > 0 {
        println!("    • {} resources unchanged", summary.no_change);
    }
    if summary.skipped > 0 {
        println!("    • {} resources skipped", summary.skipped);
    }
    if summary.failed > 0 {
        println!("    • {} resources failed", summary.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use declarative::ResourceStatus;

    pub(crate) fn test_context(dir: &std::path::Path) -> Context {
        let mut config = StackConfig::default();
        config.engine.poll_interval_ms = 1;
        config.engine.base_delay_ms = 1;
        config.engine.max_delay_ms = 5;
        Context {
            verbose: 0,
            quiet: true,
            deploy: config.deploy_context(),
            config,
            state_dir: dir.to_path_buf(),
        }
    }

    fn password(value: &str) -> PasswordArgs {
        PasswordArgs {
            db_password: Some(value.to_string()),
        }
    }

    #[test]
    fn test_password_required() {
        assert!(require_password(&PasswordArgs { db_password: None }).is_err());
        assert!(require_password(&password("")).is_err());
        assert_eq!(require_password(&password("hunter2")).unwrap(), "hunter2");
    }

    #[test]
    fn test_deploy_secret_destroy_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());

        let args = crate::cli::DeployArgs {
            password: password("hunter2"),
            jobs: Some(4),
            details: false,
        };
        deploy::run(&ctx, &args).unwrap();

        let state = load_state(&ctx).unwrap();
        assert_eq!(state.outputs.len(), 6);
        assert!(state.outputs["RDSInstancePort"] == "3306");
        assert!(
            state
                .resources
                .values()
                .all(|r| r.status == ResourceStatus::Created)
        );

        // the password reaches the secret store and nowhere in deploy state
        let saved = std::fs::read_to_string(DeployState::state_file(dir.path(), "PrivateApiStack"))
            .unwrap();
        assert!(!saved.contains("hunter2"));
        let payload = secret::fetch(open_backend(&ctx).unwrap().backend(), topology::SECRET_NAME)
            .unwrap();
        assert_eq!(payload.password, "hunter2");
        assert_eq!(payload.server, state.outputs["RDSInstanceEndpoint"]);

        // a second deploy changes nothing
        deploy::run(&ctx, &args).unwrap();
        let again = load_state(&ctx).unwrap();
        assert_eq!(again.resources, state.resources);

        destroy::run(
            &ctx,
            &crate::cli::DestroyArgs {
                yes: true,
                jobs: None,
            },
        )
        .unwrap();
        assert!(load_state(&ctx).unwrap().is_empty());
        assert!(open_backend(&ctx).unwrap().backend().is_empty());
    }

    #[test]
    fn test_failed_deploy_reports_resource() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.config.simulation.fail_resource = Some("SecretsManagerSecret".to_string());

        let args = crate::cli::DeployArgs {
            password: password("hunter2"),
            jobs: None,
            details: false,
        };
        let error = deploy::run(&ctx, &args).unwrap_err();
        assert!(error.to_string().contains("SecretsManagerSecret"));

        let state = load_state(&ctx).unwrap();
        assert!(state.outputs.is_empty());
        // the database is ephemeral and rolled back
        assert_eq!(
            state.resources["RDSMySQL"].status,
            ResourceStatus::Deleted
        );
        assert_eq!(state.resources["VPC"].status, ResourceStatus::Created);
        assert!(!state.resources.contains_key("SampleService"));
    }

    #[test]
    fn test_stored_fingerprints_do_not_confirm_password_guesses() {
        use declarative::{FingerprintKey, fingerprint};

        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        deploy::run(
            &ctx,
            &crate::cli::DeployArgs {
                password: password("hunter2"),
                jobs: None,
                details: false,
            },
        )
        .unwrap();

        let state = load_state(&ctx).unwrap();
        let key = crate::state::load_key(dir.path(), "PrivateApiStack")
            .unwrap()
            .unwrap();
        let saved = std::fs::read_to_string(DeployState::state_file(dir.path(), "PrivateApiStack"))
            .unwrap();
        assert!(!saved.contains(&key.to_hex()));

        for id in ["RDSMySQL", "SecretsManagerSecret"] {
            let record = &state.resources[id];
            let stored = [
                record.declared_fingerprint.clone().unwrap(),
                record.resolved_fingerprint.clone().unwrap(),
            ];

            // the stack's own key reproduces the declaration
            let actual = topology::build("hunter2").unwrap();
            assert_eq!(
                fingerprint::declared(actual.get(id).unwrap(), Some(&key)),
                stored[0]
            );

            for guess in ["password", "letmein", "hunter2"] {
                let graph = topology::build(guess).unwrap();
                let resource = graph.get(id).unwrap();
                for attempt in [
                    fingerprint::declared(resource, None),
                    fingerprint::declared(resource, Some(&FingerprintKey::generate())),
                ] {
                    assert!(!stored.contains(&attempt), "{id} confirmed '{guess}'");
                }
            }
        }
    }
}
