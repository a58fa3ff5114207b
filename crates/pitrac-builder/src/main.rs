use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use pitrac_builder::Result;
use pitrac_builder::builder::CommandBuilder;
use pitrac_builder::config::{self, BuildConfig};
use pitrac_builder::executor::{ExecCtx, ExecOptions, StdoutSink};
use pitrac_builder::pipeline;
use pitrac_builder::planner;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Incremental Debian package builds for pitrac")]
struct Args {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, clap::Args)]
struct Target {
    /// Build definition TOML (defaults to the built-in package table)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Target architecture, overrides the config
    #[arg(long)]
    arch: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the requested packages plus everything else that is dirty
    Schedule {
        #[command(flatten)]
        target: Target,
        /// Packages to build; empty means every dirty package
        packages: Vec<String>,
        /// Report what would be built without building or touching the cache
        #[arg(long)]
        dry_run: bool,
        /// Max number of builds to run concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 1)]
        max_parallel: usize,
        /// Per-build time limit in seconds, overrides the config
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the dirty set and build order without building
    Plan {
        #[command(flatten)]
        target: Target,
        packages: Vec<String>,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Show each package's dirty state and fingerprints
    Status {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_format, args.verbose);

    let res = match args.cmd {
        Command::Schedule {
            target,
            packages,
            dry_run,
            max_parallel,
            timeout_secs,
        } => cmd_schedule(&target, &packages, dry_run, max_parallel, timeout_secs),
        Command::Plan {
            target,
            packages,
            dot,
        } => cmd_plan(&target, &packages, dot),
        Command::Status { target, json } => cmd_status(&target, json),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(target: &Target) -> Result<BuildConfig> {
    let mut cfg = match target.config.as_deref() {
        Some(path) => BuildConfig::from_doc(&config::load(path)?)?,
        None => BuildConfig::builtin()?,
    };
    if let Some(arch) = target.arch.as_deref() {
        cfg.architecture = arch.trim().to_string();
    }
    Ok(cfg)
}

fn cmd_schedule(
    target: &Target,
    packages: &[String],
    dry_run: bool,
    max_parallel: usize,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let cfg = load_config(target)?;
    let mut cache = pipeline::open_cache(&cfg)?;
    let builder = Arc::new(CommandBuilder::from_config(
        &cfg.builder,
        cfg.workspace.root.clone(),
    )?);
    let sink = Arc::new(StdoutSink::with_error_logs(
        cfg.workspace.build_dir.join("error-logs"),
    ));
    let ctx = ExecCtx::new(dry_run, sink);

    let max_parallel = if max_parallel == 0 {
        num_cpus::get().max(1)
    } else {
        max_parallel
    };
    let opts = ExecOptions {
        max_parallel,
        build_timeout: timeout_secs
            .or(cfg.builder.timeout_secs)
            .filter(|s| *s > 0)
            .map(Duration::from_secs),
    };

    let outcome = pipeline::run(&cfg, packages, builder, &mut cache, &ctx, &opts)?;
    if dry_run {
        let dirty = outcome
            .report
            .in_state(pitrac_builder::executor::PackageState::Dirty);
        println!("would build: {}", display_list(&dirty));
    }
    Ok(())
}

fn cmd_plan(target: &Target, packages: &[String], dot: bool) -> Result<()> {
    let cfg = load_config(target)?;
    let cache = pipeline::open_cache(&cfg)?;
    let plan = pipeline::plan(&cfg, packages, &cache)?;
    if dot {
        print!("{}", planner::to_dot(&cfg.packages, &plan.expansion.candidates));
        return Ok(());
    }

    let requested: Vec<String> = plan.expansion.requested.iter().cloned().collect();
    println!("requested:  {}", display_list(&requested));
    println!("auto-added: {}", display_list(&plan.expansion.auto_added));
    for (i, name) in plan.order.iter().enumerate() {
        println!("{:>2}. {name}", i + 1);
    }
    Ok(())
}

fn cmd_status(target: &Target, json: bool) -> Result<()> {
    let cfg = load_config(target)?;
    let cache = pipeline::open_cache(&cfg)?;
    let rows = pipeline::status(&cfg, &cache)?;
    if json {
        let s = serde_json::to_string_pretty(&rows)
            .map_err(|e| pitrac_builder::Error::msg(format!("json encode failed: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    println!(
        "arch: {}  cache: {}",
        cfg.architecture,
        cfg.workspace.fingerprint_dir().display()
    );
    for row in rows {
        println!(
            "{:<10} {:<12} {:<20} cached={:<12} current={:<12} artifacts={}",
            row.package,
            row.version,
            row.reason.to_string(),
            row.cached.as_deref().map(short_hash).unwrap_or("-"),
            short_hash(&row.current),
            row.artifacts.len()
        );
    }
    Ok(())
}

fn display_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".into()
    } else {
        items.join(", ")
    }
}

fn short_hash(h: &str) -> &str {
    h.get(..12).unwrap_or(h)
}
