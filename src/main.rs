//! FlowRunner CLI Entry Point
//!
//! Runs one process instance of a YAML definition from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Start an instance and leave the start state
//! flowrunner order.yaml
//!
//! # Set variables, then signal the root token over named transitions
//! flowrunner order.yaml --set amount=250 --signal approve
//!
//! # Signal a child token created by a fork
//! flowrunner order.yaml --signal /shipping:done
//!
//! # Drain due jobs on 4 workers and write a JSON snapshot
//! flowrunner order.yaml --run-jobs --workers 4 --snapshot instance.json
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use flowrunner::config::EngineConfig;
use flowrunner::execution::{ProcessEngine, ProcessInstance, ROOT_TOKEN};
use flowrunner::graph::{load_definition, ActionRegistry};
use flowrunner::jobs::JobExecutor;
use flowrunner::services::{write_snapshot, MemoryLog, Services};
use flowrunner::variables::VariableValue;
use flowrunner::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    definition_path: Option<String>,
    config_path: Option<PathBuf>,
    signals: Vec<String>,
    variables: Vec<(String, String)>,
    run_jobs: bool,
    workers: Option<usize>,
    snapshot_path: Option<PathBuf>,
    verbose: bool,
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
    println!("Graph-Oriented Process Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>   Path to process definition YAML file");
    println!();
    println!("Options:");
    println!("  --config FILE       Engine config (default: $FLOWRUNNER_CONFIG or flowrunner.yaml)");
    println!("  --set NAME=VALUE    Set a root variable before the first signal (repeatable)");
    println!("  --signal [TOKEN:]TRANSITION");
    println!("                      Signal a token after start (repeatable; empty transition = default)");
    println!("  --run-jobs          Run due jobs until none is left");
    println!("  --workers N         Job worker threads (default: config or CPU count)");
    println!("  --snapshot FILE     Write the final instance as JSON");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner order.yaml");
    println!("  flowrunner order.yaml --set amount=250 --signal approve");
    println!("  flowrunner order.yaml --run-jobs --workers 4 --snapshot instance.json");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value = |i: usize, option: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", option))
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
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--run-jobs" => {
                config.run_jobs = true;
            }
            "--config" => {
                i += 1;
                config.config_path = Some(PathBuf::from(value(i, "--config")?));
            }
            "--signal" => {
                i += 1;
                config.signals.push(value(i, "--signal")?);
            }
            "--set" => {
                i += 1;
                let assignment = value(i, "--set")?;
                let (name, raw) = assignment
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid assignment '{}'; expected NAME=VALUE", assignment))?;
                config.variables.push((name.trim().to_string(), raw.to_string()));
            }
            "--workers" => {
                i += 1;
                let raw = value(i, "--workers")?;
                config.workers = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid workers value: {}", raw))?,
                );
            }
            "--snapshot" => {
                i += 1;
                config.snapshot_path = Some(PathBuf::from(value(i, "--snapshot")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.definition_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definition_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Interprets a `--set` value as a number or boolean where it looks like
/// one, otherwise as text.
fn parse_value(raw: &str) -> VariableValue {
    if let Ok(n) = raw.parse::<i64>() {
        return VariableValue::Long(n);
    }
    if let Ok(n) = raw.parse::<f64>() {
        return VariableValue::Double(n);
    }
    match raw {
        "true" => VariableValue::Boolean(true),
        "false" => VariableValue::Boolean(false),
        _ => VariableValue::from(raw),
    }
}

/// Splits `[TOKEN:]TRANSITION` into a token path and an optional transition.
fn parse_signal(signal: &str) -> (&str, Option<&str>) {
    let (token, transition) = match signal.split_once(':') {
        Some((token, transition)) => (token, transition),
        None => ("/", signal),
    };
    let transition = Some(transition).filter(|name| !name.is_empty());
    (token, transition)
}

fn print_tokens(instance: &ProcessInstance) {
    println!("{}", "Tokens".bold());
    for token in instance.tokens().iter() {
        let name = instance.token_name(token.id);
        let node = &instance.definition().node(token.node).name;
        let status = if token.has_ended() {
            "ended".dimmed()
        } else if let Some(owner) = token.lock_owner() {
            format!("locked by {}", owner).yellow()
        } else if token.suspended {
            "suspended".yellow()
        } else {
            "active".green()
        };
        println!("  {:<20} {:<20} {}", name, node, status);
    }
    println!();
}

fn print_variables(engine: &ProcessEngine, instance: &ProcessInstance) -> Result<(), Box<dyn std::error::Error>> {
    let variables = engine.variables(instance, ROOT_TOKEN)?;
    if variables.is_empty() {
        return Ok(());
    }
    println!("{}", "Variables".bold());
    for (name, value) in variables {
        println!("  {:<20} {}", name, value);
    }
    println!();
    Ok(())
}

fn print_process_log(log: &MemoryLog, instance: &ProcessInstance) {
    println!("{}", "Process log".bold());
    for entry in log.entries().iter().filter(|entry| entry.instance == instance.id()) {
        println!(
            "  {} {:<12} {}",
            entry.time.format("%H:%M:%S").to_string().dimmed(),
            instance.token_name(entry.token),
            entry.event
        );
    }
    println!();
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    let definition_path = match config.definition_path.clone() {
        Some(path) => path,
        None => {
            print_usage();
            return Err("no process definition given".into());
        }
    };

    setup_logging(config.verbose);
    print_banner();

    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };

    info!("Loading process definition: {}", definition_path);
    let definition = load_definition(&definition_path, &ActionRegistry::with_builtins()).map_err(|e| {
        error!("Failed to load process definition: {}", e);
        format!("Could not load process definition from '{}': {}", definition_path, e)
    })?;
    info!(
        "Definition '{}' loaded: {} nodes, {} transitions",
        definition.name(),
        definition.nodes().len(),
        definition.transitions().len()
    );

    let process_log = Arc::new(MemoryLog::new());
    let (services, queue) = Services::in_memory(engine_config.jobs.max_retries);
    let services = services.with_logging(process_log.clone());
    let engine = Arc::new(ProcessEngine::new(engine_config, services)?);

    let mut instance = engine.start_process(engine.deploy(definition))?;
    for (name, raw) in &config.variables {
        engine.set_variable(&mut instance, ROOT_TOKEN, name, parse_value(raw))?;
    }
    engine.signal(&mut instance)?;

    for signal in &config.signals {
        let (path, transition) = parse_signal(signal);
        let token = instance
            .find_token(path)
            .ok_or_else(|| format!("No token named '{}'", path))?;
        info!("Signalling {} over {}", path, transition.unwrap_or("the default transition"));
        engine.signal_as(&mut instance, token, transition, None)?;
    }
    engine.save(&mut instance)?;

    if config.run_jobs {
        let mut executor = JobExecutor::new(engine.clone(), queue.clone());
        if let Some(workers) = config.workers {
            executor = executor.with_workers(workers);
        }
        let summary = executor.run_until_idle();
        println!(
            "{} {} completed, {} rescheduled, {} failed, {} lost",
            "Jobs:".bold(),
            summary.completed.to_string().green(),
            summary.rescheduled,
            summary.failed.to_string().red(),
            summary.lost.to_string().red()
        );
        println!();
        instance = engine.load(instance.id())?;
    }

    let state = if instance.has_ended() {
        "ended".green()
    } else {
        "running".yellow()
    };
    println!(
        "Instance {} of '{}' v{}: {}",
        instance.id(),
        instance.definition().name(),
        instance.definition().version(),
        state
    );
    if let Some(next) = queue.next_due_date() {
        println!("Next job due {}", next);
    }
    println!();

    print_tokens(&instance);
    print_variables(&engine, &instance)?;
    print_process_log(&process_log, &instance);

    if let Some(path) = &config.snapshot_path {
        write_snapshot(&instance, path)?;
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
