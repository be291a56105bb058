//! Tear the stack down in reverse stage order

use anyhow::{Context as _, Result};
use declarative::{ApplyStatus, Engine};
use dialoguer::Confirm;

use super::{apply_options, declared_graph, load_state, open_backend, plan, print_summary};
use crate::Context;
use crate::cli::DestroyArgs;
use crate::progress::StageProgress;
use crate::ui;

pub fn run(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let mut state = load_state(ctx)?;
    if state.is_empty() {
        ui::info(&format!(
            "Nothing to destroy: {} has no recorded resources",
            ctx.deploy.stack_name
        ));
        return Ok(());
    }

    let graph = declared_graph()?;
    let plan = plan(&graph)?;

    if !args.yes {
        let prompt = format!(
            "Destroy {} resource(s) of {} ({})?",
            state.live_count(),
            ctx.deploy.stack_name,
            ctx.deploy.environment
        );
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Destroy cancelled");
            return Ok(());
        }
    }

    let simulator = open_backend(ctx)?;
    let options = apply_options(ctx, args.jobs)?;
    let progress = StageProgress::new(ctx.quiet, ctx.verbose > 0);
    let engine = Engine::new(simulator.backend(), options).with_progress(&progress);

    let destroyed = engine.destroy(&plan, &mut state.resources);
    simulator.save()?;
    state.clear_outputs();
    state.save(&ctx.state_dir)?;
    let result = destroyed.context("Destroy aborted")?;

    match &result.status {
        ApplyStatus::Succeeded => {
            println!();
            ui::success(&format!("Destroyed {}", ctx.deploy.stack_name));
            print_summary(&result.summary);
            Ok(())
        }
        ApplyStatus::Failed {
            resource, cause, ..
        } => {
            ui::error(&format!("Failed to delete {resource}: {cause}"));
            ui::dim(cause.category().advice());
            if !result.not_attempted.is_empty() {
                ui::warn(&format!(
                    "{} resource(s) left in place",
                    result.not_attempted.len()
                ));
            }
            anyhow::bail!("Destroy failed at {resource}")
        }
        ApplyStatus::Cancelled => anyhow::bail!("Destroy cancelled"),
    }
}
