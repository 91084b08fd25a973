use super::{json_pretty, lock_state, open_kiln, with_spinner, CmdResult, EXIT_SUCCESS};
use crate::Output;
use kiln_core::BuildRequest;
use kiln_schema::KilnConfig;

pub fn run(
    config: KilnConfig,
    roles: &[String],
    use_last: bool,
    max_workers: Option<usize>,
    out: Output,
) -> CmdResult {
    let _lock = lock_state(&config)?;
    let roles: Vec<String> = if roles.is_empty() {
        config.images.keys().cloned().collect()
    } else {
        roles.to_vec()
    };

    let mut request = BuildRequest::new(roles).use_last(use_last);
    if let Some(n) = max_workers {
        request = request.max_workers(n);
    }

    let kiln = open_kiln(config, out.verbose)?;
    let images = with_spinner(
        out.quiet(),
        "building images...",
        "images ready",
        "build failed",
        || kiln.build(&request),
    )?;

    if out.json {
        println!("{}", json_pretty(&images)?);
    } else {
        for (role, image) in &images {
            println!("{role:<24} {}", image.short());
        }
    }
    Ok(EXIT_SUCCESS)
}
