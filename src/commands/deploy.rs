//! Provision the stack against the simulated backend

use anyhow::{Context as _, Result};
use declarative::{ApplyResult, ApplyStatus, Engine, EngineError, outputs};
use std::time::Instant;

use super::{
    apply_options, load_state, open_backend, plan, print_summary, report_definition_errors,
    require_password,
};
use crate::Context;
use crate::cli::DeployArgs;
use crate::progress::StageProgress;
use crate::state::load_or_create_key;
use crate::topology;
use crate::ui;

pub fn run(ctx: &Context, args: &DeployArgs) -> Result<()> {
    let password = require_password(&args.password)?;
    let graph = topology::build(password).context("Failed to declare the stack")?;

    let advisory = match Engine::preflight(&graph) {
        Ok(advisory) => advisory,
        Err(EngineError::Invalid(errors)) => {
            report_definition_errors(&errors);
            anyhow::bail!("{} definition error(s), nothing deployed", errors.len());
        }
        Err(EngineError::Blocked(violations)) => {
            ui::section("Blocking findings");
            for violation in &violations {
                ui::violation(violation);
            }
            anyhow::bail!("Deploy blocked by {} security finding(s)", violations.len());
        }
        Err(e) => return Err(e.into()),
    };
    let plan = plan(&graph)?;

    if !ctx.quiet {
        ui::header(&format!(
            "Deploying {} to {} ({})",
            ctx.deploy.stack_name, ctx.deploy.environment, ctx.deploy.region
        ));
        for violation in &advisory {
            ui::violation(violation);
        }
        ui::info(&format!(
            "{} resources in {} stages",
            plan.resource_count(),
            plan.len()
        ));
    }

    let mut state = load_state(ctx)?;
    let key = load_or_create_key(&ctx.state_dir, &ctx.deploy.stack_name)?;
    let simulator = open_backend(ctx)?;
    let options = apply_options(ctx, args.jobs)?;
    let progress = StageProgress::new(ctx.quiet, args.details || ctx.verbose > 0);

    let start = Instant::now();
    let engine = Engine::new(simulator.backend(), options)
        .with_progress(&progress)
        .with_fingerprint_key(key);
    let applied = engine.apply(&graph, &plan, &ctx.deploy, &mut state.resources);

    // whatever happened, persist what the backend now holds
    simulator.save()?;
    let result = match applied {
        Ok(result) => result,
        Err(e) => {
            state.clear_outputs();
            state.save(&ctx.state_dir)?;
            return Err(e).context("Deploy aborted");
        }
    };
    let elapsed = start.elapsed();

    match &result.status {
        ApplyStatus::Succeeded => {
            let projected = outputs::project(&graph, &state.resources, &ctx.deploy)
                .context("Failed to project stack outputs")?;
            state.mark_deployed(projected);
            state.save(&ctx.state_dir)?;

            println!();
            ui::success(&format!("Deployed in {:.1}s", elapsed.as_secs_f64()));
            print_summary(&result.summary);
            if !state.outputs.is_empty() {
                ui::section("Outputs");
                for (name, value) in &state.outputs {
                    ui::kv(name, value);
                }
            }
            Ok(())
        }
        ApplyStatus::Failed {
            resource,
            kind,
            cause,
        } => {
            state.clear_outputs();
            state.save(&ctx.state_dir)?;

            println!();
            ui::error(&format!("{resource} ({}) failed: {cause}", kind.as_str()));
            let category = cause.category();
            ui::dim(&format!("{}. {}", category.description(), category.advice()));
            report_halt(&result);
            print_summary(&result.summary);
            anyhow::bail!("Deploy failed at {resource}")
        }
        ApplyStatus::Cancelled => {
            state.clear_outputs();
            state.save(&ctx.state_dir)?;
            report_halt(&result);
            anyhow::bail!("Deploy cancelled")
        }
    }
}

fn report_halt(result: &ApplyResult) {
    if !result.rolled_back.is_empty() {
        ui::section("Rolled back");
        for id in &result.rolled_back {
            ui::dim(id.as_str());
        }
    }
    if !result.not_attempted.is_empty() {
        ui::section(&format!("Not attempted ({})", result.not_attempted.len()));
        for id in &result.not_attempted {
            ui::dim(id.as_str());
        }
    }
}
