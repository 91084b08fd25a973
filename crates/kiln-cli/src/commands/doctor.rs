use super::{colorize_status, json_pretty, read_config, CmdResult, EXIT_FAILURE, EXIT_SUCCESS};
use crate::Output;
use kiln_core::StoreLock;
use kiln_engine::http::resolve_daemon_url;
use kiln_engine::{check_prereqs, format_missing, HttpEngine};
use kiln_schema::KilnConfig;
use kiln_store::StateStore;
use std::path::Path;

pub fn run(config_path: &Path, out: Output) -> CmdResult {
    let mut checks: Vec<Check> = Vec::new();

    let config = match read_config(config_path) {
        Ok(config) => {
            checks.push(Check::pass(
                "config",
                &format!("Configuration {} is valid", config_path.display()),
            ));
            Some(config)
        }
        Err(e) => {
            checks.push(Check::fail("config", &e.message));
            None
        }
    };
    let defaults = KilnConfig::default();
    let effective = config.as_ref().unwrap_or(&defaults);

    check_tools(effective, &mut checks);
    check_engine(effective, &mut checks);
    if config.is_some() {
        check_state(effective, &mut checks);
    }

    print_results(&checks, out.json)
}

fn check_tools(config: &KilnConfig, checks: &mut Vec<Check>) {
    let missing = check_prereqs(config.source.vcs);
    if missing.is_empty() {
        checks.push(Check::pass("host_tools", "Host tools available"));
    } else {
        checks.push(Check::fail("host_tools", &format_missing(&missing)));
    }
}

fn check_engine(config: &KilnConfig, checks: &mut Vec<Check>) {
    match HttpEngine::connect(&config.engine) {
        Ok(engine) if engine.is_alive() => checks.push(Check::pass(
            "engine",
            &format!("Container engine reachable at {}", engine.base_url()),
        )),
        Ok(engine) => checks.push(Check::fail(
            "engine",
            &format!("Container engine at {} stopped responding", engine.base_url()),
        )),
        Err(e) => checks.push(Check::fail("engine", &e.to_string())),
    }
    if let Ok(url) = resolve_daemon_url(config.engine.url.as_deref()) {
        checks.push(Check::info("engine_url", &format!("Engine URL: {url}")));
    }
}

fn check_state(config: &KilnConfig, checks: &mut Vec<Check>) {
    let state_file = &config.paths.state_file;
    match StateStore::open(state_file) {
        Ok(store) => {
            let state = store.snapshot();
            checks.push(Check::pass(
                "state",
                &format!(
                    "State document readable ({} image(s), {} protected)",
                    state.images.len(),
                    state.last_ids.len()
                ),
            ));
        }
        Err(e) => checks.push(Check::fail("state", &e.to_string())),
    }

    match StoreLock::try_acquire(&StoreLock::path_for(state_file)) {
        Ok(Some(_)) => checks.push(Check::pass("state_lock", "State lock is free")),
        Ok(None) => checks.push(Check::warn(
            "state_lock",
            "State lock is held by another kiln process",
        )),
        Err(e) => checks.push(Check::fail(
            "state_lock",
            &format!("Cannot check state lock: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], json_output: bool) -> CmdResult {
    let healthy = checks.iter().all(|c| c.status != "fail");
    if json_output {
        let json = serde_json::json!({
            "healthy": healthy,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("kiln doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} [{}] {}", colorize_status(check.status), check.message);
        }
        println!();
        if healthy {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if healthy { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
