//! Validate the stack and print its deployment stages

use anyhow::{Context as _, Result};
use colored::Colorize;
use declarative::checker;
use declarative::{ResourceGraph, TargetFilter};

use super::{declared_graph, plan, report_definition_errors};
use crate::Context;
use crate::cli::SynthArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &SynthArgs) -> Result<()> {
    let graph = declared_graph()?;

    let errors = graph.validate();
    if !errors.is_empty() {
        report_definition_errors(&errors);
        anyhow::bail!("{} definition error(s)", errors.len());
    }

    let violations = checker::check(&graph);
    let plan = plan(&graph)?;
    let filter = args.target.as_deref().map(TargetFilter::parse);

    if args.json {
        let stages: Vec<Vec<serde_json::Value>> = plan
            .stages()
            .iter()
            .map(|stage| {
                stage
                    .iter()
                    .filter_map(|id| graph.get(id.as_str()))
                    .filter(|r| filter.as_ref().is_none_or(|f| f.matches(&r.id, &r.kind)))
                    .map(|r| {
                        serde_json::json!({
                            "id": r.id.as_str(),
                            "type": r.kind.as_str(),
                            "dependsOn": r.dependencies().iter().map(|d| d.as_str().to_string()).collect::<Vec<_>>(),
                        })
                    })
                    .collect()
            })
            .collect();
        let findings: Vec<serde_json::Value> = violations
            .iter()
            .map(|v| {
                serde_json::json!({
                    "rule": v.rule.code(),
                    "severity": if v.is_blocking() { "error" } else { "warning" },
                    "resource": v.resource.as_str(),
                    "message": v.message,
                })
            })
            .collect();
        let document = serde_json::json!({
            "stack": ctx.deploy.stack_name,
            "environment": ctx.deploy.environment,
            "stages": stages,
            "violations": findings,
        });
        let text = serde_json::to_string_pretty(&document).context("Failed to serialize plan")?;
        println!("{text}");
    } else {
        ui::header(&format!(
            "{} ({})",
            ctx.deploy.stack_name, ctx.deploy.environment
        ));
        ui::kv("Resources", &graph.len().to_string());
        ui::kv("Stages", &plan.len().to_string());
        ui::kv("Outputs", &graph.outputs().len().to_string());
        print_stages(&graph, plan.stages(), filter.as_ref());

        if !violations.is_empty() {
            ui::section("Findings");
            for violation in &violations {
                ui::violation(violation);
            }
        }
    }

    if checker::has_blocking(&violations) {
        anyhow::bail!("Stack has blocking security findings");
    }
    if !args.json && !ctx.quiet {
        println!();
        ui::success("Stack is valid");
    }
    Ok(())
}

fn print_stages(
    graph: &ResourceGraph,
    stages: &[Vec<declarative::ResourceId>],
    filter: Option<&TargetFilter>,
) {
    for (index, stage) in stages.iter().enumerate() {
        let shown: Vec<_> = stage
            .iter()
            .filter_map(|id| graph.get(id.as_str()))
            .filter(|r| filter.is_none_or(|f| f.matches(&r.id, &r.kind)))
            .collect();
        if shown.is_empty() {
            continue;
        }

        ui::section(&format!("Stage {}", index + 1));
        for resource in shown {
            println!(
                "  {} {}",
                resource.id.as_str(),
                resource.kind.as_str().dimmed()
            );
        }
    }
}
