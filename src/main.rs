//! flowserve entry point.
//!
//! ## CLI Subcommands
//!
//! - `flowserve run --graph FILE [--body JSON]` - Run one event through a graph
//! - `flowserve worker [--mode pool|dedicated ...]` - Worker process (spawned by the dispatcher)
//! - `flowserve config show|defaults|validate` - Inspect configuration

use std::process::ExitCode;

use flowserve::cli::{self, config_cmd};
use flowserve::config;
use flowserve::ipc::{run_worker, WorkerOptions};
use flowserve::models::ModelCatalog;
use flowserve::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "run" => {
            let run_args = match cli::parse_run_args(&args[2..]) {
                Ok(run_args) => run_args,
                Err(e) => {
                    eprintln!("{e}");
                    print_command_help("run");
                    return ExitCode::from(cli::EXIT_USAGE as u8);
                }
            };
            let env = config::load();
            if let Err(e) = telemetry::init_logging(&env.log) {
                eprintln!("Logging setup failed: {e}");
            }
            telemetry::init_metrics();
            let code = cli::run_graph(run_args).await;
            ExitCode::from(code as u8)
        }
        "worker" => run_worker_command(&args[2..]).await,
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    let json = args.get(3).map(|s| s.as_str()) == Some("--json");
                    ExitCode::from(config_cmd::run_show(json) as u8)
                }
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => ExitCode::from(config_cmd::run_validate() as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("flowserve {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Host models for a parent dispatcher until stdin closes.
async fn run_worker_command(args: &[String]) -> ExitCode {
    let options = match WorkerOptions::from_args(args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(cli::EXIT_USAGE as u8);
        }
    };
    // Stdout carries frames; logging::init_logging writes to stderr.
    let _ = telemetry::init_logging(&config::load().log);

    match run_worker(&ModelCatalog::builtin(), options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker exited with error");
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "flowserve - inference-serving graph engine v{}

USAGE:
    flowserve <COMMAND> [OPTIONS]

COMMANDS:
    run          Run one event through a graph spec file
    worker       Run as a model worker process (used internally)
    config       Inspect configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

EXAMPLES:
    flowserve run --graph graph.toml --body '{{\"n\": 1}}'
    flowserve run --graph graph.toml --body-file event.json --id e-42
    flowserve config show --json
    flowserve help run

ENVIRONMENT:
    FLOWSERVE_PROCESS_POOL_SIZE    Process pool workers (0 = CPU count)
    FLOWSERVE_DISPATCH_TIMEOUT_MS  Per-call timeout for out-of-line mechanisms (0 = none)
    FLOWSERVE_WORKER_PROGRAM       Binary hosting `worker` (default: current executable)
    FLOWSERVE_LOG_LEVEL            Log filter (default: info)
    FLOWSERVE_LOG_FORMAT           json or pretty
    Run `flowserve config defaults` for the full list.

EXIT CODES:
    0    Success
    1    Event or step failure
    2    Usage or graph spec error
    130  Interrupted
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "run" => {
            eprintln!(
                "flowserve run - Run one event through a graph

USAGE:
    flowserve run --graph FILE [OPTIONS]

OPTIONS:
    --graph FILE       Graph spec (TOML) to load
    --body JSON        Event body (default: {{}})
    --body-file FILE   Read the event body from a JSON file
    --path PATH        Operation path (e.g. /v2/models/m1/infer)
    --id ID            Event id (default: random UUID)
    --method METHOD    GET or POST (default: POST)
    --error-log FILE   Append unhandled step failures as JSON lines

DESCRIPTION:
    Builds the graph with the built-in model kinds (increment, echo,
    sleep), initializes every step, runs the event and prints the
    response body. Background branches are drained before exit.
"
            );
        }
        "worker" => {
            eprintln!(
                "flowserve worker - Model worker process

USAGE:
    flowserve worker [--mode pool|dedicated] [--model SPEC] [--resource R] [--frame-limit BYTES]

DESCRIPTION:
    Reads newline-delimited JSON predict frames from stdin and writes
    replies to stdout. Spawned by the dispatcher; not meant to be run
    by hand.
"
            );
        }
        "config" => {
            eprintln!(
                "flowserve config - Inspect configuration

USAGE:
    flowserve config <SUBCOMMAND>

SUBCOMMANDS:
    show [--json]  Show effective configuration
    defaults       Show default configuration
    validate       Check environment variables for mistakes

EXAMPLES:
    flowserve config show
    FLOWSERVE_PROCESS_POOL_SIZE=4 flowserve config validate
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'flowserve help' for general usage.",
                command
            );
        }
    }
}
