use anyhow::Result;

use super::load_state;
use crate::Context;
use crate::ui;

/// Show outputs recorded by the last successful deploy
pub fn run(ctx: &Context) -> Result<()> {
    let state = load_state(ctx)?;

    let Some(deployed) = state.last_deployed else {
        ui::info(&format!("{} has not been deployed", ctx.deploy.stack_name));
        return Ok(());
    };
    if state.outputs.is_empty() {
        ui::warn("No outputs: the last deploy did not complete");
        return Ok(());
    }

    ui::header(&format!(
        "{} ({})",
        state.stack, state.environment
    ));
    for (name, value) in &state.outputs {
        ui::kv(name, value);
    }
    println!();
    ui::dim(&format!(
        "Deployed {}",
        deployed.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    Ok(())
}
