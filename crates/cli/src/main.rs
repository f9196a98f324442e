use std::{
    io::BufRead,
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map as JsonMap, Value};
use stepforge_engine::{ControlHandle, EngineConfig, FramedEventSink, RunOptions, execute_definition, parse_control_line};
use stepforge_types::RunOutcome;
use tracing::{debug, info, warn};

mod workflows;

/// Build, inspect and run the built-in Stepforge workflows.
#[derive(Parser, Debug)]
#[command(name = "stepforge", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the workflow catalog
    List,
    /// Print the built graph of a workflow
    Graph {
        /// Catalog id of the workflow
        id: String,

        #[arg(long, value_enum, default_value_t = GraphFormat::Json)]
        format: GraphFormat,
    },
    /// Run a workflow: framed events go to stdout, control messages are read from stdin
    Run {
        /// Catalog id of the workflow
        id: String,

        /// Run identifier stamped on every event
        #[arg(long)]
        run_id: Option<String>,

        /// Input values as a JSON object
        #[arg(long)]
        inputs: Option<String>,

        /// How often a paused run re-polls for control messages
        #[arg(long, env = "STEPFORGE_POLL_INTERVAL_MS", default_value_t = 25)]
        poll_interval_ms: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GraphFormat {
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    match Args::parse().command {
        Command::List => list(),
        Command::Graph { id, format } => graph(&id, format),
        Command::Run {
            id,
            run_id,
            inputs,
            poll_interval_ms,
        } => run(&id, run_id, inputs.as_deref(), poll_interval_ms).await,
    }
}

/// Logs go to stderr; stdout carries the framed event stream.
fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn list() -> Result<ExitCode> {
    println!("{:<16} {:<36} NODES", "ID", "NAME");
    for entry in workflows::catalog() {
        let built = entry
            .definition
            .build_graph(entry.id, workflows::VERSION)
            .with_context(|| format!("workflow '{}' failed to build", entry.id))?;
        println!("{:<16} {:<36} {}", entry.id, entry.definition.name(), built.graph.nodes.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn graph(id: &str, format: GraphFormat) -> Result<ExitCode> {
    let entry = workflows::find(id)?;
    let built = entry.definition.build_graph(entry.id, workflows::VERSION)?;
    let rendered = match format {
        GraphFormat::Json => serde_json::to_string_pretty(&built.graph)?,
        GraphFormat::Yaml => serde_yaml::to_string(&built.graph)?,
    };
    println!("{rendered}");
    Ok(ExitCode::SUCCESS)
}

async fn run(id: &str, run_id: Option<String>, inputs: Option<&str>, poll_interval_ms: u64) -> Result<ExitCode> {
    let entry = workflows::find(id)?;
    let inputs = parse_inputs(inputs)?;
    let run_id = run_id.unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));

    let control = ControlHandle::new();
    spawn_control_reader(control.clone());

    let config = EngineConfig::default().with_poll_interval(Duration::from_millis(poll_interval_ms));
    let options = RunOptions::new(run_id.clone())
        .events(FramedEventSink::new(std::io::stdout()))
        .control(control)
        .config(config);

    info!(workflow_id = entry.id, run_id = %run_id, "starting run");
    let report = execute_definition(&entry.definition, entry.id, workflows::VERSION, inputs, options).await?;
    Ok(match report.outcome {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::Failure => ExitCode::from(1),
        RunOutcome::Canceled => ExitCode::from(2),
    })
}

fn parse_inputs(raw: Option<&str>) -> Result<JsonMap<String, Value>> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--inputs must be a JSON object"),
        None => Ok(JsonMap::new()),
    }
}

/// Feeds control messages from stdin into `control`.
///
/// Reads on a plain thread so a parent that never closes stdin cannot hold
/// the process open after the run finishes.
fn spawn_control_reader(control: ControlHandle) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => match parse_control_line(&line) {
                    Some(signal) => {
                        info!(signal = ?signal, "control message received");
                        control.send(signal);
                    }
                    None => debug!(line = %line, "ignoring non-control input"),
                },
                Err(error) => {
                    warn!(error = %error, "stopped reading control input");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_run_arguments() {
        let args = Args::try_parse_from(["stepforge", "run", "retry-demo", "--inputs", r#"{"a":1}"#, "--poll-interval-ms", "5"])
            .expect("valid arguments");
        match args.command {
            Command::Run {
                id,
                inputs,
                poll_interval_ms,
                run_id,
            } => {
                assert_eq!(id, "retry-demo");
                assert_eq!(inputs.as_deref(), Some(r#"{"a":1}"#));
                assert_eq!(poll_interval_ms, 5);
                assert!(run_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn inputs_must_be_an_object() {
        assert!(parse_inputs(Some("[1,2]")).is_err());
        assert_eq!(parse_inputs(None).expect("empty").len(), 0);
        assert_eq!(parse_inputs(Some(r#"{"region":"eu-west-1"}"#)).expect("object")["region"], "eu-west-1");
    }
}
