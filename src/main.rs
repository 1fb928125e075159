//! DbFlow CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! dbflow migration.yaml
//!
//! # With a safety policy and a durable audit trail
//! dbflow migration.yaml --policy policy.yaml --audit-log audit.jsonl
//!
//! # Continue after the last completed phase
//! dbflow migration.yaml --resume
//!
//! # Print the phase/step graph without running anything
//! dbflow migration.yaml --visualize
//!
//! # Seed the shared context
//! dbflow migration.yaml --context env=staging --context 'limits={"rows":1000}'
//! ```

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use log::{error, info, warn};
use serde_json::Value;

use dbflow::execution::{AgentRegistry, CommandAgent, Orchestrator, WorkflowOutcome};
use dbflow::safety::{
    load_policy, AuditDecision, AuditFilter, InteractiveApproval, JsonLinesAuditSink,
    SafetyController, SafetyPolicy,
};
use dbflow::workflow::state::DEFAULT_CHECKPOINT_DIR;
use dbflow::workflow::{load_workflow, AgentKind, FileCheckpointStore};
use dbflow::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Longest wait for leftover runtime work once the run has finished
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    max_parallel: usize,
    checkpoint_dir: PathBuf,
    policy_path: Option<String>,
    audit_log: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    context: HashMap<String, Value>,
    resume: bool,
    visualize: bool,
    non_interactive: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            max_parallel: num_cpus::get(),
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            policy_path: None,
            audit_log: None,
            working_dir: None,
            context: HashMap::new(),
            resume: false,
            visualize: false,
            non_interactive: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Agentic Workflow Execution for Database Operations");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: dbflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>         Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --parallel N            Maximum parallel steps (default: CPU count)");
    println!("  --checkpoint-dir PATH   Checkpoint directory (default: {})", DEFAULT_CHECKPOINT_DIR);
    println!("  --policy PATH           Safety policy YAML");
    println!("  --audit-log PATH        Append audit entries to a JSON-lines file");
    println!("  --working-dir PATH      Working directory for shell commands");
    println!("  --context KEY=VALUE     Seed the shared context (VALUE may be JSON; on --resume, checkpointed keys win)");
    println!("  --resume                Continue from the last checkpoint");
    println!("  --visualize             Print the workflow graph and exit");
    println!("  --non-interactive       Deny operations that need approval");
    println!("  --verbose               Enable debug logging");
    println!("  --help                  Show this help message");
    println!("  --version               Show version information");
    println!();
    println!("Examples:");
    println!("  dbflow migration.yaml");
    println!("  dbflow migration.yaml --policy policy.yaml --audit-log audit.jsonl");
    println!("  dbflow migration.yaml --resume --parallel 8");
}

/// Parses a `KEY=VALUE` context argument. Values that are not valid JSON
/// are taken as strings.
fn parse_context_pair(pair: &str) -> Result<(String, Value), String> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| format!("Invalid context value '{}', expected KEY=VALUE", pair))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid context value '{}': empty key", pair));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    let value_for = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--resume" => config.resume = true,
            "--visualize" => config.visualize = true,
            "--non-interactive" => config.non_interactive = true,
            "--parallel" => {
                let value = value_for(&mut i, arg)?;
                config.max_parallel = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("Invalid parallel value: {}", value))?;
            }
            "--checkpoint-dir" => config.checkpoint_dir = PathBuf::from(value_for(&mut i, arg)?),
            "--policy" => config.policy_path = Some(value_for(&mut i, arg)?),
            "--audit-log" => config.audit_log = Some(PathBuf::from(value_for(&mut i, arg)?)),
            "--working-dir" => config.working_dir = Some(PathBuf::from(value_for(&mut i, arg)?)),
            "--context" => {
                let (key, value) = parse_context_pair(&value_for(&mut i, arg)?)?;
                config.context.insert(key, value);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Builds the safety controller from the policy file and CLI flags.
fn build_safety(config: &Config) -> Result<SafetyController, Box<dyn std::error::Error>> {
    let policy = match &config.policy_path {
        Some(path) => {
            info!("Safety policy: {}", path);
            load_policy(path)?
        }
        None => SafetyPolicy::default(),
    };
    info!("Approval threshold: {}", policy.approval_threshold);

    let mut safety = SafetyController::new(policy)?;

    if let Some(path) = &config.audit_log {
        info!("Audit log: {}", path.display());
        safety = safety.with_audit_sink(Box::new(JsonLinesAuditSink::open(path)?));
    }

    if config.non_interactive {
        warn!("Non-interactive mode: operations needing approval will be denied");
    } else {
        safety = safety.with_approval_channel(InteractiveApproval::new());
    }

    Ok(safety)
}

/// Prints the run summary, timeline and audit summary.
fn print_report(orchestrator: &Orchestrator, outcome: &WorkflowOutcome) {
    println!();
    let status = if outcome.is_success() {
        outcome.status.to_string().green().bold()
    } else {
        outcome.status.to_string().red().bold()
    };
    println!("Workflow {} {}", outcome.workflow_id, status);
    println!(
        "  succeeded: {}  failed: {}  skipped: {}  pending: {}",
        outcome.counts.succeeded, outcome.counts.failed, outcome.counts.skipped, outcome.counts.pending
    );
    let phases: Vec<String> = outcome.completed_phases.iter().map(ToString::to_string).collect();
    println!("  completed phases: {}", phases.join(" -> "));
    if let Some(step) = &outcome.failed_step {
        println!("  failed step: {}", step.red());
    }
    if let Some(err) = &outcome.error {
        println!("  error: {}", err);
    }
    println!("Total execution time: {:.2?}", outcome.elapsed);

    if let Ok(timeline) = orchestrator.timeline(&outcome.workflow_id) {
        println!();
        println!("{}", timeline.gantt_chart());
    }

    let entries = orchestrator.query_audit_log(&AuditFilter::new());
    if !entries.is_empty() {
        let count = |decision| entries.iter().filter(|e| e.decision == decision).count();
        println!("Audit: {} gated operation(s)", entries.len());
        println!(
            "  auto-approved: {}  approved: {}  denied: {}  blocked: {}",
            count(AuditDecision::AutoApproved),
            count(AuditDecision::Approved),
            count(AuditDecision::Denied),
            count(AuditDecision::Blocked)
        );
        match orchestrator.safety().audit_log().verify_chain() {
            Ok(()) => println!("  hash chain: {}", "verified".green()),
            Err(e) => println!("  hash chain: {}", e.to_string().red()),
        }
    }
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load workflow
    info!("Loading workflow: {}", config.workflow_path);
    let mut workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", config.workflow_path, e)
    })?;

    // Checkpoints are keyed by id, so runs of the same file share one
    if workflow.id.is_none() {
        workflow.id = Some(workflow.name.clone());
    }
    info!("Workflow loaded: '{}', {} steps", workflow.name, workflow.len());

    // Agents
    let mut agents = AgentRegistry::with_defaults();
    if let Some(dir) = &config.working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
        info!("Working directory: {}", dir.display());
        agents.register(AgentKind::CommandExecution, CommandAgent::new().with_working_dir(dir));
    }

    // Orchestrator
    let safety = Arc::new(build_safety(&config)?);
    let mut orchestrator = Orchestrator::new(Arc::new(agents), safety);
    orchestrator.set_max_parallel(config.max_parallel);
    orchestrator.set_checkpoint_store(Arc::new(FileCheckpointStore::new(&config.checkpoint_dir)));

    if config.visualize {
        let id = orchestrator.submit_workflow(workflow)?;
        println!("{}", orchestrator.visualize(&id)?);
        return Ok(());
    }

    info!(
        "Starting execution (max parallel: {}, checkpoints: {})",
        config.max_parallel,
        config.checkpoint_dir.display()
    );

    let outcome = if config.resume {
        if !config.context.is_empty() {
            info!(
                "Resuming with {} context value(s); checkpointed keys keep their values",
                config.context.len()
            );
        }
        orchestrator.resume(workflow, config.context).await?
    } else {
        orchestrator.run_spec(workflow, config.context).await?
    };

    print_report(&orchestrator, &outcome);

    if outcome.is_success() {
        Ok(())
    } else {
        Err(format!(
            "Workflow failed at step '{}'",
            outcome.failed_step.as_deref().unwrap_or("unknown")
        )
        .into())
    }
}

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run());
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("dbflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert_eq!(config.workflow_path, DEFAULT_WORKFLOW);
        assert_eq!(config.checkpoint_dir, PathBuf::from(DEFAULT_CHECKPOINT_DIR));
        assert!(config.max_parallel >= 1);
        assert!(!config.resume);
    }

    #[test]
    fn test_parse_flags() {
        let config = parse_arguments(&args(&[
            "migration.yaml",
            "--parallel",
            "8",
            "--policy",
            "policy.yaml",
            "--audit-log",
            "audit.jsonl",
            "--context",
            "env=staging",
            "--context",
            "limits={\"rows\":10}",
            "--resume",
            "--non-interactive",
        ]))
        .unwrap();

        assert_eq!(config.workflow_path, "migration.yaml");
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.policy_path.as_deref(), Some("policy.yaml"));
        assert_eq!(config.audit_log, Some(PathBuf::from("audit.jsonl")));
        assert_eq!(config.context["env"], json!("staging"));
        assert_eq!(config.context["limits"], json!({"rows": 10}));
        assert!(config.resume && config.non_interactive);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--parallel"])).is_err());
        assert!(parse_arguments(&args(&["--parallel", "0"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["--context", "novalue"])).is_err());
    }
}
