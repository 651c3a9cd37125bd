//! GT-040: CLI subcommands: deploy, destroy, plan, test, validate, whichenv, init, status, schema.

use crate::core::environment::{self, PatternBranchMatcher, ResolveInputs};
use crate::core::error::{Error, ExitCategory, Result};
use crate::core::executor::{Orchestrator, RunOptions};
use crate::core::planner::{self, ModuleFilter};
use crate::core::{parser, report, resolver, types::*};
use crate::transport::local::LocalInvoker;
use crate::transport::{cancellation, CancelToken, Invoker};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gantry",
    version,
    about = "Multi-environment infrastructure orchestration across CloudFormation, Terraform, Serverless and CDK"
)]
pub struct Cli {
    /// Path to gantry.yml
    #[arg(short, long, global = true, env = "GANTRY_CONFIG", default_value = parser::CONFIG_FILE)]
    pub file: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every module-running subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Target environment (overrides env vars, branch and directory)
    #[arg(short, long)]
    pub env: Option<String>,

    /// Restrict the run to these module ids
    #[arg(short, long = "module")]
    pub modules: Vec<String>,

    /// Ask every backend for its plan instead of acting
    #[arg(long)]
    pub what_if: bool,

    /// Maximum invocations in flight at once
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Report directory (default: settings.report_dir)
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy modules in dependency order
    Deploy(RunArgs),

    /// Tear modules down, dependents first
    Destroy {
        #[command(flatten)]
        run: RunArgs,

        /// Actually destroy (without it only the plan is shown)
        #[arg(long)]
        force: bool,
    },

    /// Preview changes for every module
    Plan(RunArgs),

    /// Run each backend's validation
    Test(RunArgs),

    /// Load, build and plan every declared environment
    Validate,

    /// Print the resolved environment and where it came from
    Whichenv {
        /// Explicit environment
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Write a starter gantry.yml
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show the last run report
    Status {
        /// Report directory (default: settings.report_dir)
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the JSON Schema of gantry.yml
    Schema,

    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `-v`.
pub fn init_logging(verbosity: u8, json: bool) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gantry={}", level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // Already initialized (tests) is fine.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Dispatch a CLI command.
pub async fn dispatch(cli: Cli) -> Result<ExitCategory> {
    let file = cli.file;
    match cli.command {
        Commands::Deploy(args) => cmd_run(&file, Action::Deploy, &args, false).await,
        Commands::Destroy { run, force } => cmd_run(&file, Action::Destroy, &run, force).await,
        Commands::Plan(args) => cmd_run(&file, Action::Plan, &args, false).await,
        Commands::Test(args) => cmd_run(&file, Action::Test, &args, false).await,
        Commands::Validate => cmd_validate(&file),
        Commands::Whichenv { env } => cmd_whichenv(&file, env.as_deref()),
        Commands::Init { path } => cmd_init(&path),
        Commands::Status { report_dir, json } => cmd_status(&file, report_dir.as_deref(), json),
        Commands::Schema => cmd_schema(),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "gantry", &mut std::io::stdout());
            Ok(ExitCategory::Success)
        }
    }
}

/// Parsed config plus the environment it resolves to.
struct Context {
    config: GantryConfig,
    raw: String,
    root: PathBuf,
    environment: Environment,
}

fn config_root(file: &Path) -> PathBuf {
    match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn load_context(file: &Path, explicit_env: Option<&str>) -> Result<Context> {
    let (config, raw) = parser::parse_and_validate(file)?;
    let root = config_root(file);
    let matcher = PatternBranchMatcher::from_rules(&config.branch_mapping)?;
    let env_var = environment::env_var_value();
    let branch = if config.ignore_git_branch {
        None
    } else {
        current_branch(&root)
    };
    let cwd = std::env::current_dir().ok();
    let inputs = ResolveInputs {
        explicit: explicit_env,
        env_var: env_var.as_deref(),
        branch: branch.as_deref(),
        cwd: cwd.as_deref(),
    };
    let environment = environment::resolve(&inputs, &config, &matcher)?;
    Ok(Context {
        config,
        raw,
        root,
        environment,
    })
}

/// Current git branch, or None outside a repository or on a detached HEAD.
fn current_branch(root: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(branch = %branch, "detected git branch");
    (!branch.is_empty() && branch != "HEAD").then_some(branch)
}

async fn cmd_run(file: &Path, action: Action, args: &RunArgs, force: bool) -> Result<ExitCategory> {
    let (handle, token) = cancellation();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });
    let outcome = run_action(file, action, args, force, Arc::new(LocalInvoker), token).await;
    ctrl_c.abort();
    outcome
}

async fn run_action(
    file: &Path,
    action: Action,
    args: &RunArgs,
    force: bool,
    invoker: Arc<dyn Invoker>,
    cancel: CancelToken,
) -> Result<ExitCategory> {
    let ctx = load_context(file, args.env.as_deref())?;
    let modules = parser::load_modules(&ctx.root, &ctx.config, &ctx.environment)?;
    let graph = resolver::build(&modules)?;
    let filter = ModuleFilter::new(args.modules.clone());
    let plan = planner::plan(&graph, &modules, action, action.direction(), &filter)?;

    if !args.json {
        print_plan(&plan, &ctx.environment, args.what_if);
    }
    if action == Action::Destroy && !force && !args.what_if {
        println!("Destroy not executed. Re-run with --force to destroy these modules.");
        return Ok(ExitCategory::Success);
    }

    let options = RunOptions {
        max_parallel: args.max_parallel.unwrap_or(ctx.config.settings.max_parallel),
        what_if: args.what_if,
    };
    let report_dir = args
        .report_dir
        .clone()
        .unwrap_or_else(|| ctx.root.join(&ctx.config.settings.report_dir));
    let fingerprint = report::config_fingerprint(&ctx.raw);
    let pending = report::new_report(&ctx.config.name, action, args.what_if, &ctx.environment, &fingerprint);

    let namespace = ctx.config.namespace().to_string();
    let engine = Orchestrator::new(modules, ctx.environment, &namespace, invoker, cancel, options);
    let run = engine.run(&plan, pending).await;

    let saved = report::save_report(&report_dir, &run)?;
    if args.json {
        print_json(&run)?;
    } else {
        print_report(&run);
        println!("Report: {}", saved.display());
    }
    Ok(run_category(&run))
}

/// Exit category for a finished run.
fn run_category(run: &RunReport) -> ExitCategory {
    match run.state {
        RunState::Cancelled => ExitCategory::Cancelled,
        _ if run.succeeded() => ExitCategory::Success,
        _ => ExitCategory::ModuleFailure,
    }
}

fn print_plan(plan: &ExecutionPlan, env: &Environment, what_if: bool) {
    let mode = if what_if { " (what-if)" } else { "" };
    println!(
        "{} {} module(s) in '{}' [{}]{}",
        capitalize(&plan.action.to_string()),
        plan.steps.len(),
        env.name(),
        env.source(),
        mode
    );
    for (pos, step) in plan.steps.iter().enumerate() {
        let indent = "  ".repeat(step.depth as usize + 1);
        println!("{}{}. {}", indent, pos + 1, step.module);
    }
    if plan.is_empty() {
        println!("  (nothing to do)");
    }
    println!();
}

fn print_report(run: &RunReport) {
    for result in &run.results {
        let symbol = match result.status {
            InvocationStatus::Success => "ok",
            InvocationStatus::Failure => "FAILED",
            InvocationStatus::Skipped => "skipped",
        };
        let detail = match (&result.error, result.skip_reason) {
            (Some(e), _) => format!(": {}", e),
            (None, Some(reason)) => format!(" ({})", reason),
            (None, None) => String::new(),
        };
        println!(
            "  {} [{}] {}{} ({:.1}s)",
            result.module, result.backend, symbol, detail, result.duration_seconds
        );
    }
    println!();
    println!(
        "Run {} {}: {} succeeded, {} failed, {} skipped.",
        run.run_id,
        run.state,
        run.count(InvocationStatus::Success),
        run.count(InvocationStatus::Failure),
        run.count(InvocationStatus::Skipped)
    );
}

fn print_json(run: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(run)
        .map_err(|e| Error::Internal(format!("cannot serialize report: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn cmd_validate(file: &Path) -> Result<ExitCategory> {
    let (config, _) = parser::parse_and_validate(file)?;
    let root = config_root(file);
    PatternBranchMatcher::from_rules(&config.branch_mapping)?;

    let mut targets: Vec<String> = config.environments.keys().cloned().collect();
    if targets.is_empty() {
        targets.extend(config.default_environment.clone());
    }
    if targets.is_empty() {
        targets.push("default".to_string());
    }

    let mut first_error: Option<Error> = None;
    for name in targets {
        let params = config
            .environments
            .get(&name)
            .map(|decl| {
                decl.params
                    .iter()
                    .filter_map(|(k, v)| param_value_to_string(v).map(|s| (k.clone(), s)))
                    .collect()
            })
            .unwrap_or_default();
        let env = Environment::new(name.clone(), EnvironmentSource::Explicit, params);
        let checked = parser::load_modules(&root, &config, &env).and_then(|modules| {
            let graph = resolver::build(&modules)?;
            planner::plan(&graph, &modules, Action::Deploy, Direction::Forward, &ModuleFilter::default())
        });
        match checked {
            Ok(plan) => println!("OK: {} ({} module(s) planned)", name, plan.steps.len()),
            Err(e) => {
                eprintln!("  ERROR [{}]: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(ExitCategory::Success),
    }
}

fn cmd_whichenv(file: &Path, explicit: Option<&str>) -> Result<ExitCategory> {
    let ctx = load_context(file, explicit)?;
    println!("{} ({})", ctx.environment.name(), ctx.environment.source());
    Ok(ExitCategory::Success)
}

const SAMPLE_CONFIG: &str = r#"version: "1.0"
name: my-infrastructure
namespace: acme
default_environment: dev

branch_mapping:
  - pattern: "^main$"
    environment: prod
  - pattern: "^release/(?P<env>[a-z]+)$"

environments:
  dev:
    params:
      region: us-east-1
  prod:
    params:
      region: us-west-2

settings:
  max_parallel: 1
  report_dir: .gantry/reports

params: {}

modules: []
"#;

fn cmd_init(path: &Path) -> Result<ExitCategory> {
    let config_path = path.join(parser::CONFIG_FILE);
    if config_path.exists() {
        return Err(Error::ConfigParse(format!("{} already exists", config_path.display())));
    }
    std::fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
    std::fs::write(&config_path, SAMPLE_CONFIG).map_err(|e| Error::io(&config_path, e))?;
    println!("Initialized gantry project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(ExitCategory::Success)
}

fn cmd_status(file: &Path, report_dir: Option<&Path>, json: bool) -> Result<ExitCategory> {
    let dir = match report_dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let configured = parser::parse_config_file(file)
                .map(|(config, _)| config.settings.report_dir)
                .unwrap_or_else(|_| Settings::default().report_dir);
            config_root(file).join(configured)
        }
    };
    let Some(run) = report::load_last(&dir)? else {
        println!("No runs recorded. Run `gantry deploy` first.");
        return Ok(ExitCategory::Success);
    };
    if json {
        print_json(&run)?;
        return Ok(ExitCategory::Success);
    }
    println!("Run: {} ({})", run.run_id, run.name);
    println!(
        "  Action: {}{}",
        run.action,
        if run.what_if { " (what-if)" } else { "" }
    );
    println!("  Environment: {} ({})", run.environment, run.environment_source);
    println!("  Started: {}", run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        println!("  Finished: {}", finished.to_rfc3339());
    }
    println!("  Config: {}", run.config_hash);
    print_report(&run);
    Ok(ExitCategory::Success)
}

fn cmd_schema() -> Result<ExitCategory> {
    let schema = schemars::schema_for!(GantryConfig);
    let json = serde_json::to_string_pretty(&schema)
        .map_err(|e| Error::Internal(format!("cannot serialize schema: {}", e)))?;
    println!("{}", json);
    Ok(ExitCategory::Success)
}
