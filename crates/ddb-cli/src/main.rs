mod commands;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use commands::build::{Arch, BuildArgs};
use commands::{print_error, EXIT_FAILURE, EXIT_USAGE, INVALID_INPUT};
use ddb_core::{install_signal_handler, shutdown_requested};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "ddb",
    version,
    about = "Build Debian packages in throwaway Docker containers"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build a Debian source package for a distribution.
    Build {
        /// Distribution image, e.g. "ubuntu:22.04" or "debian:bookworm".
        dist: String,
        /// Directory that receives the built packages.
        outdir: PathBuf,
        /// Directory of .deb files to install before building.
        #[arg(long)]
        depdir: Option<PathBuf>,
        /// Source package directory (must contain debian/control).
        #[arg(long, default_value = ".")]
        srcdir: PathBuf,
        /// Target architecture.
        #[arg(long, value_enum, default_value_t = Arch::X64)]
        arch: Arch,
        /// Provision a fresh image even if a cached one exists.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Remove images left behind by other ddb versions.
    Clean,
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
    let Some(command) = cli.command else {
        Cli::command()
            .error(ErrorKind::MissingSubcommand, "a command is required")
            .exit();
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DDB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let engine_name = std::env::var("DDB_ENGINE").unwrap_or_else(|_| "docker".to_owned());
    let engine = match ddb_engine::select_engine(&engine_name, shutdown_requested) {
        Ok(engine) => engine,
        Err(e) => {
            print_error(&e.to_string());
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    tracing::debug!("using {} engine", engine.name());

    let result = match command {
        Commands::Build {
            dist,
            outdir,
            depdir,
            srcdir,
            arch,
            force,
        } => commands::build::run(
            engine.as_ref(),
            &BuildArgs {
                dist,
                outdir,
                depdir,
                srcdir,
                arch,
                force,
            },
            cli.json,
        ),
        Commands::Clean => commands::clean::run(engine.as_ref(), cli.json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            print_error(&msg);
            let code = if msg.starts_with(INVALID_INPUT) {
                EXIT_USAGE
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
