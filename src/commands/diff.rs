//! Preview what deploy would change

use anyhow::{Context as _, Result};
use colored::Colorize;
use declarative::{
    DiffSummary, PlannedAction, ResourceStatus, TargetFilter, compute_diffs, group_by_type,
};

use super::{load_state, plan, require_password};
use crate::Context;
use crate::cli::DiffArgs;
use crate::state::load_key;
use crate::topology;
use crate::ui;

pub fn run(ctx: &Context, args: &DiffArgs) -> Result<()> {
    let password = require_password(&args.password)?;
    let graph = topology::build(password).context("Failed to declare the stack")?;
    let plan = plan(&graph)?;
    let state = load_state(ctx)?;
    let key = load_key(&ctx.state_dir, &ctx.deploy.stack_name)?;

    let filter = args.target.as_deref().map(TargetFilter::parse);
    let diffs: Vec<_> = compute_diffs(&graph, &plan, &state.resources, key.as_ref())
        .into_iter()
        .filter(|d| {
            filter
                .as_ref()
                .is_none_or(|f| f.matches(&d.resource_id, &d.resource_type))
        })
        .collect();
    let summary = DiffSummary::from_diffs(&diffs);

    ui::header(&format!(
        "{} ({})",
        ctx.deploy.stack_name, ctx.deploy.environment
    ));

    for (kind, group) in group_by_type(&diffs) {
        let changed: Vec<_> = group.into_iter().filter(|d| d.is_change()).collect();
        if changed.is_empty() {
            continue;
        }
        ui::section(kind.as_str());
        for diff in changed {
            let marker = match diff.action {
                PlannedAction::Create => "+".green(),
                PlannedAction::Update => "~".yellow(),
                PlannedAction::NoChange => " ".normal(),
            };
            println!(
                "  {} {} {}",
                marker,
                diff.resource_id,
                format!("stage {}", diff.stage + 1).dimmed()
            );
        }
    }

    let orphans: Vec<_> = state
        .resources
        .iter()
        .filter(|(id, record)| {
            !graph.contains(id.as_str()) && record.status != ResourceStatus::Deleted
        })
        .filter(|(id, record)| {
            filter.as_ref().is_none_or(|f| f.matches(id, &record.kind))
        })
        .collect();
    if !orphans.is_empty() {
        ui::section("No longer declared");
        for (id, record) in &orphans {
            println!("  {} {} {}", "-".red(), id, record.kind.as_str().dimmed());
        }
    }

    println!();
    if summary.has_changes() || !orphans.is_empty() {
        ui::info(&format!(
            "{} to create, {} to update, {} unchanged, {} to delete",
            summary.additions,
            summary.modifications,
            summary.unchanged,
            orphans.len()
        ));
    } else {
        ui::success(&format!("No changes ({} resources)", summary.total()));
    }
    Ok(())
}
