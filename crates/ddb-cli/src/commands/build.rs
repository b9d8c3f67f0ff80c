use super::{invalid, json_pretty, note, EXIT_SUCCESS};
use clap::ValueEnum;
use ddb_core::{BuildReport, PackageBuild, RunRequest, Session};
use ddb_engine::ContainerEngine;
use std::io::Write;
use std::path::{Path, PathBuf};

const SUPPORTED_PREFIXES: [&str; 2] = ["ubuntu:", "debian:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Arch {
    /// 32-bit packages, built on the i386 variant of the base image.
    X86,
    X64,
}

#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub dist: String,
    pub outdir: PathBuf,
    pub depdir: Option<PathBuf>,
    pub srcdir: PathBuf,
    pub arch: Arch,
    pub force: bool,
}

/// Check the arguments and turn them into a build with absolute paths.
/// Creates the output directory when it is missing.
pub fn validate(args: &BuildArgs) -> Result<PackageBuild, String> {
    if !SUPPORTED_PREFIXES
        .iter()
        .any(|prefix| args.dist.starts_with(prefix))
    {
        return Err(invalid(format!(
            "distribution '{}' must start with 'ubuntu:' or 'debian:'",
            args.dist
        )));
    }

    let control = args.srcdir.join("debian").join("control");
    if !control.is_file() {
        return Err(invalid(format!(
            "{} not found; is {} a Debian source package?",
            control.display(),
            args.srcdir.display()
        )));
    }
    let source_dir = absolute(&args.srcdir)?;

    std::fs::create_dir_all(&args.outdir).map_err(|e| {
        format!(
            "failed to create output directory {}: {e}",
            args.outdir.display()
        )
    })?;
    let output_dir = absolute(&args.outdir)?;

    let dependency_dir = match &args.depdir {
        Some(dir) if !dir.is_dir() => {
            return Err(invalid(format!(
                "dependency directory {} does not exist",
                dir.display()
            )));
        }
        Some(dir) => Some(absolute(dir)?),
        None => None,
    };

    let dist = match args.arch {
        Arch::X86 => format!("i386/{}", args.dist),
        Arch::X64 => args.dist.clone(),
    };

    Ok(PackageBuild {
        dist,
        run: RunRequest {
            source_dir,
            output_dir,
            dependency_dir,
        },
        force: args.force,
    })
}

fn absolute(path: &Path) -> Result<PathBuf, String> {
    std::fs::canonicalize(path).map_err(|e| format!("failed to resolve {}: {e}", path.display()))
}

pub fn run(engine: &dyn ContainerEngine, args: &BuildArgs, json: bool) -> Result<u8, String> {
    let request = validate(args)?;

    let session = if json {
        Session::new(engine).with_notifier(|_| {})
    } else {
        Session::new(engine).with_notifier(note)
    };

    // With --json, stdout is reserved for the report.
    let report = if json {
        session.build(&request, &mut std::io::stderr().lock())
    } else {
        session.build(&request, &mut std::io::stdout().lock())
    }
    .map_err(|e| e.to_string())?;
    std::io::stdout().flush().map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    }
    check_exit(&report)?;

    if !json {
        println!(
            "built package in {} using image {}",
            request.run.output_dir.display(),
            report.image_id
        );
    }
    Ok(EXIT_SUCCESS)
}

/// Only an observed zero exit counts as a built package.
fn check_exit(report: &BuildReport) -> Result<(), String> {
    match report.exit_code {
        Some(0) => Ok(()),
        Some(code) => Err(format!("package build failed with exit code {code}")),
        None => Err(format!(
            "container {} disappeared before its exit status was read; \
             treating the package build as failed",
            report.container_id
        )),
    }
}
