mod profile;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use profile::{argument_line, CommandProfile};
use serde_json::json;
use spawnline_core::{
    CancellationToken, ConfigurationBuilder, PipeSource, PriorityClass,
    ResourcePolicy, ResultValidation, SpawnlineError,
};
use spawnline_parser::parse_argument_line;
use spawnline_runner::{resolve_target, CommandExecutor, CommandInvoker};
use std::path::PathBuf;
use std::process;
use tracing::{debug, warn};

/// Exit status used when the run is interrupted, as a shell would report SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "spawnline")]
#[command(about = "Launch and supervise a child process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program and exit with its exit code
    Run(RunArgs),

    /// Show where a program name resolves on PATH
    Resolve {
        /// Program name or path
        name: String,
    },

    /// Escape tokens and join them into one argument line
    Escape {
        /// Tokens to escape
        #[arg(required = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },

    /// Split an argument line back into arguments
    Split {
        /// Argument line, as produced by `escape`
        line: String,

        /// Print the arguments as a JSON array
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Capture stdout and stderr and print them after the process exits
    #[arg(long)]
    buffered: bool,

    /// Print the execution result as JSON
    #[arg(long)]
    json: bool,

    /// Report a non-zero exit code without treating it as a failure
    #[arg(long)]
    no_validate: bool,

    /// Run the program through the platform shell
    #[arg(long, conflicts_with = "buffered")]
    shell: bool,

    /// Run the program with elevated privileges
    #[arg(long)]
    elevate: bool,

    /// Escape each argument before joining them
    #[arg(long)]
    escape: bool,

    /// Working directory of the child
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Set an environment variable in the child (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Start the child with an empty environment
    #[arg(long)]
    clear_env: bool,

    /// Feed this file to the child's stdin
    #[arg(long, value_name = "FILE")]
    stdin_file: Option<PathBuf>,

    /// Processor affinity mask, decimal or 0x-prefixed hex
    #[arg(long, value_name = "MASK", value_parser = parse_affinity)]
    affinity: Option<u64>,

    /// Priority class (idle, below-normal, normal, above-normal, high, realtime)
    #[arg(long, value_name = "CLASS")]
    priority: Option<PriorityClass>,

    /// TOML profile providing defaults for everything above
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Program to run; may come from the profile instead
    target: Option<String>,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let code = run(args).await?;
            process::exit(code);
        }
        Commands::Resolve { name } => {
            let cwd = std::env::current_dir()?;
            match resolve_target(&name, None, &cwd) {
                Ok(path) => println!("{}", path.display()),
                Err(e) => {
                    eprintln!("{}", e);
                    process::exit(1);
                }
            }
        }
        Commands::Escape { tokens } => {
            println!("{}", argument_line(&tokens, true));
        }
        Commands::Split { line, json } => {
            let arguments = parse_argument_line(&line)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&arguments)?);
            } else {
                for argument in arguments {
                    println!("{}", argument);
                }
            }
        }
    }

    Ok(())
}

/// Run the configured command and return the exit code the CLI should report
async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let profile = match &args.profile {
        Some(path) => Some(CommandProfile::load(path)?),
        None => None,
    };

    let mut builder = configure(&args, profile.as_ref())?;
    if let Some(path) = &args.stdin_file {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open stdin file {}", path.display()))?;
        builder = builder.with_standard_input_pipe(PipeSource::from_reader(file))?;
    }
    let configuration = builder.build();
    debug!(command_line = %configuration.command_line(), "Configured command");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let invoker = CommandInvoker::new();
    let outcome = if args.buffered {
        invoker
            .execute_buffered(&configuration, &cancel)
            .await
            .map(|result| {
                if args.json {
                    print_json(&result);
                } else {
                    print!("{}", result.stdout);
                    eprint!("{}", result.stderr);
                }
                result.exit_code
            })
    } else {
        invoker.execute(&configuration, &cancel).await.map(|result| {
            if args.json {
                print_json(&result);
            }
            result.exit_code
        })
    };

    match outcome {
        Ok(code) => Ok(code),
        Err(SpawnlineError::CommandNotSuccessful { exit_code, target_path }) => {
            if args.json {
                print_json(&json!({
                    "error": "command_not_successful",
                    "target_path": target_path,
                    "exit_code": exit_code,
                }));
            } else {
                eprintln!("{} exited with code {}", target_path, exit_code);
            }
            Ok(exit_code)
        }
        Err(SpawnlineError::Cancelled) => {
            warn!("Interrupted; the child process may still be running");
            Ok(INTERRUPTED_EXIT_CODE)
        }
        Err(e) => Err(e.into()),
    }
}

/// Merge the profile (if any) with the command line. Flags win over profile values.
fn configure(args: &RunArgs, profile: Option<&CommandProfile>) -> anyhow::Result<ConfigurationBuilder> {
    let profile = profile.cloned().unwrap_or_default();
    let mut builder = profile.to_builder(args.target.as_deref())?;

    if !args.args.is_empty() {
        builder = builder.with_arguments_line(argument_line(&args.args, args.escape));
    }
    if let Some(cwd) = &args.cwd {
        builder = builder.with_working_directory(cwd);
    }
    for (key, value) in &args.env {
        builder = builder.with_environment_variable(key, Some(value.clone()));
    }
    if args.clear_env {
        builder = builder.with_inherit_environment(false);
    }
    if args.no_validate {
        builder = builder.with_validation(ResultValidation::None);
    }
    if args.elevate {
        builder = builder.with_elevation(true);
    }

    if args.affinity.is_some() || args.priority.is_some() {
        let base = profile.policy.unwrap_or_default();
        builder = builder.with_process_resource_policy(ResourcePolicy {
            processor_affinity: args.affinity.or(base.processor_affinity),
            priority_class: args.priority.or(base.priority_class),
            ..base
        });
    }

    if args.shell {
        builder = builder.with_shell_execution(true)?;
    }

    Ok(builder)
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn parse_affinity(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid affinity mask '{}': {}", raw, e))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize result: {}", e),
    }
}
