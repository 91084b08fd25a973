use super::{json_pretty, CmdResult, EXIT_SUCCESS};
use crate::Output;
use kiln_core::CoreError;
use kiln_schema::KilnConfig;
use kiln_store::StateStore;

/// Print the state document. Needs no engine connection.
pub fn run(config: &KilnConfig, out: Output) -> CmdResult {
    let store = StateStore::open(&config.paths.state_file).map_err(CoreError::from)?;
    let state = store.snapshot();

    if out.json {
        println!("{}", json_pretty(&state)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("state: {}", store.path().display());
    if state.images.is_empty() {
        println!("no images recorded");
    }
    for (role, image) in &state.images {
        println!("{role:<24} {}", image.short());
    }
    for (role, image) in &state.last_ids {
        println!("last {role:<19} {}", image.short());
    }
    for (role, mtime) in &state.clobber {
        println!("clobber {role:<16} {mtime}");
    }
    if let Some(id) = &state.sync_container {
        let id: &str = id;
        println!("content-sync container {}", &id[..id.len().min(12)]);
    }
    Ok(EXIT_SUCCESS)
}
