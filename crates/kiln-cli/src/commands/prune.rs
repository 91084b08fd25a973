use super::{
    colorize_status, json_pretty, lock_state, open_kiln, with_spinner, CmdResult, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use crate::Output;
use kiln_schema::KilnConfig;

pub fn run(config: KilnConfig, out: Output) -> CmdResult {
    let _lock = lock_state(&config)?;
    let kiln = open_kiln(config, out.verbose)?;
    let report = with_spinner(
        out.quiet(),
        "pruning images...",
        "prune finished",
        "prune failed",
        || kiln.prune(),
    )?;

    if out.json {
        let payload = serde_json::json!({
            "removed": report.removed.iter().map(|(role, id)| serde_json::json!({
                "role": role,
                "image": id,
            })).collect::<Vec<_>>(),
            "failed": report.failed.iter().map(|(id, reason)| serde_json::json!({
                "image": id,
                "reason": reason,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for (role, id) in &report.removed {
            println!("{} {role} {}", colorize_status("removed"), id.short());
        }
        for (id, reason) in &report.failed {
            println!("{} {} ({reason})", colorize_status("failed"), id.short());
        }
        println!(
            "prune: removed {} image(s), {} failure(s)",
            report.removed.len(),
            report.failed.len()
        );
    }
    Ok(if report.failed.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
