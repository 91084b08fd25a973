mod commands;

use clap::{Parser, Subcommand};
use commands::{read_config, CliError, EXIT_FAILURE};
use kiln_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Build and provision container images for a development test environment"
)]
struct Cli {
    /// Path to the kiln configuration file.
    #[arg(long, default_value = kiln_schema::CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging and stream build output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build every requested role image that is missing or clobbered.
    Build {
        /// Roles to build. Defaults to every configured role.
        roles: Vec<String>,
        /// Reuse the most recent image of a role instead of rebuilding it.
        #[arg(long, default_value_t = false)]
        use_last: bool,
        /// Upper bound on concurrent build tasks.
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Remove stale images of the relevant roles.
    Prune,
    /// Print coverage snapshots left inside a container as JSON.
    Coverage {
        /// Container id or name.
        container: String,
        /// JSON object mapping in-container paths to host paths.
        #[arg(long)]
        filemap: Option<PathBuf>,
    },
    /// Print the recorded build state.
    State,
    /// Check host tools, the container engine and the state file.
    Doctor,
}

/// Output preferences shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub verbose: bool,
}

impl Output {
    /// Spinners would interleave with JSON or streamed output.
    pub fn quiet(self) -> bool {
        self.json || self.verbose
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let out = Output {
        json: cli.json,
        verbose: cli.verbose || cli.trace,
    };

    match dispatch(cli, out) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(if e.code == 0 { EXIT_FAILURE } else { e.code })
        }
    }
}

fn dispatch(cli: Cli, out: Output) -> Result<u8, CliError> {
    if let Commands::Doctor = cli.command {
        return commands::doctor::run(&cli.config, out);
    }

    let config = read_config(&cli.config)?;
    debug!(
        "configuration {} with {} image role(s)",
        cli.config.display(),
        config.images.len()
    );
    match cli.command {
        Commands::Build {
            roles,
            use_last,
            max_workers,
        } => commands::build::run(config, &roles, use_last, max_workers, out),
        Commands::Prune => commands::prune::run(config, out),
        Commands::Coverage { container, filemap } => {
            commands::coverage::run(config, &container, filemap.as_deref(), out)
        }
        Commands::State => commands::state::run(&config, out),
        Commands::Doctor => commands::doctor::run(&cli.config, out),
    }
}
