mod ast;
mod debugger;
mod error;
mod executor;
mod expand;
mod parser;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmatic_core::config::{shot_dir, VmaticConfig};
use vmatic_core::ocr::{CommandOcr, OcrEngine, OcrGeometry};
use vmatic_core::qmp::QmpClient;
use vmatic_core::vm::{ConnectConfig, VmConsole};
use vmatic_core::watch::DEFAULT_POLL_INTERVAL;

use crate::debugger::{DebugMode, Debugger};
use crate::error::ScriptError;
use crate::executor::{ExecOptions, ScriptExecutor};
use crate::expand::VariableExpander;

#[derive(Parser)]
#[command(
    name = "vmatic",
    version,
    about = "Scripted console automation for QEMU virtual machines over QMP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a .vms automation script against a VM console
    Run {
        /// Path to the script file (reads stdin if omitted)
        script: Option<PathBuf>,

        /// QMP monitor address: a socket path or host:port
        #[arg(short = 'm', long, env = "VMATIC_MONITOR", value_name = "ADDR")]
        connect: Option<String>,

        /// Variable override, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// KEY=VALUE file loaded into the variable store
        #[arg(long, value_name = "PATH")]
        env_file: Option<PathBuf>,

        /// Validate and narrate the script without any VM I/O
        #[arg(long)]
        dry_run: bool,

        /// Overall script timeout (e.g. 90s, 5000ms)
        #[arg(long, value_name = "DURATION")]
        timeout: Option<String>,

        /// Breakpoint lines, comma separated
        #[arg(long, value_name = "LINES", value_delimiter = ',')]
        breakpoint: Vec<usize>,

        /// Pause at breakpoint lines and <break> directives
        #[arg(long, conflicts_with_all = ["debug_interactive", "debug_console"])]
        debug: bool,

        /// Interactive debugger prompt, pausing before every node
        #[arg(long, conflicts_with_all = ["debug", "debug_console"])]
        debug_interactive: bool,

        /// Interactive debugger with an OCR dump at each pause
        #[arg(long, conflicts_with_all = ["debug", "debug_interactive"])]
        debug_console: bool,

        /// OCR training data path
        #[arg(long, value_name = "PATH")]
        training_data: Option<PathBuf>,

        /// External OCR recognizer binary
        #[arg(long, value_name = "PATH")]
        ocr_command: Option<PathBuf>,

        /// Console width in character cells
        #[arg(long, value_name = "N")]
        columns: Option<u32>,

        /// Console height in character cells
        #[arg(long, value_name = "N")]
        rows: Option<u32>,

        /// Delay between watch polls (e.g. 1s, 500ms)
        #[arg(long, value_name = "DURATION")]
        poll_interval: Option<String>,

        /// Delay between keystrokes when typing text (e.g. 50ms)
        #[arg(long, value_name = "DURATION")]
        type_delay: Option<String>,

        /// Fail calls that pass fewer arguments than the function references
        #[arg(long)]
        strict_arity: bool,

        /// Print the execution result as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Parse and validate a script, printing its metadata
    Check {
        /// Path to the script file (reads stdin if omitted)
        script: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Run {
            script,
            connect,
            vars,
            env_file,
            dry_run,
            timeout,
            breakpoint,
            debug,
            debug_interactive,
            debug_console,
            training_data,
            ocr_command,
            columns,
            rows,
            poll_interval,
            type_delay,
            strict_arity,
            json,
        } => {
            let args = RunArgs {
                script,
                connect,
                vars,
                env_file,
                dry_run,
                timeout,
                breakpoint,
                debug,
                debug_interactive,
                debug_console,
                training_data,
                ocr_command,
                columns,
                rows,
                poll_interval,
                type_delay,
                strict_arity,
                json,
            };
            match run_script(args).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: {e}");
                    e.exit_code()
                }
            }
        }
        Command::Check { script } => match check_script(script) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                e.exit_code()
            }
        },
    };

    process::exit(exit_code);
}

struct RunArgs {
    script: Option<PathBuf>,
    connect: Option<String>,
    vars: Vec<String>,
    env_file: Option<PathBuf>,
    dry_run: bool,
    timeout: Option<String>,
    breakpoint: Vec<usize>,
    debug: bool,
    debug_interactive: bool,
    debug_console: bool,
    training_data: Option<PathBuf>,
    ocr_command: Option<PathBuf>,
    columns: Option<u32>,
    rows: Option<u32>,
    poll_interval: Option<String>,
    type_delay: Option<String>,
    strict_arity: bool,
    json: bool,
}

async fn run_script(args: RunArgs) -> Result<i32, ScriptError> {
    let (source, origin) = read_source(args.script.as_deref())?;
    let script = parser::parse_script(&source, origin.as_deref())?;

    let mut expander = VariableExpander::new();
    expander.load_environment();
    if let Some(path) = &args.env_file {
        expander.load_file(path)?;
    }
    expander.set_overrides(&args.vars)?;

    let config = VmaticConfig::load();
    let debugger = build_debugger(&args);

    let options = ExecOptions {
        timeout: flag_duration(&args.timeout, "timeout")?,
        dry_run: args.dry_run,
        poll_interval: flag_duration(&args.poll_interval, "poll-interval")?
            .unwrap_or(DEFAULT_POLL_INTERVAL),
        type_delay: flag_duration(&args.type_delay, "type-delay")?
            .unwrap_or(Duration::from_millis(50)),
        geometry: OcrGeometry {
            training_data: args
                .training_data
                .or(config.training_data.clone())
                .unwrap_or_default(),
            columns: args.columns.or(config.columns).unwrap_or(80),
            rows: args.rows.or(config.rows).unwrap_or(25),
        },
        shot_dir: shot_dir(),
        strict_arity: args.strict_arity,
    };

    let vm: Option<Arc<dyn VmConsole>> = if args.dry_run {
        None
    } else {
        let address = args
            .connect
            .or(config.monitor.clone())
            .ok_or_else(|| ScriptError::Usage {
                message: "no monitor address; pass --connect (or set one in \
                          ~/.vmatic/config.json), or use --dry-run"
                    .into(),
            })?;
        let mut client = QmpClient::new(ConnectConfig::parse(&address).map_err(|e| {
            ScriptError::Usage {
                message: format!("bad monitor address \"{address}\": {e}"),
            }
        })?);
        client.connect().await.map_err(|e| ScriptError::VmFailure {
            line: 0,
            content: address.clone(),
            message: e.to_string(),
        })?;
        info!(monitor = %address, "connected to QMP monitor");
        Some(Arc::new(client))
    };

    let ocr: Option<Arc<dyn OcrEngine>> = args
        .ocr_command
        .or(config.ocr_command.clone())
        .map(|program| Arc::new(CommandOcr::new(program)) as Arc<dyn OcrEngine>);

    let mut executor = ScriptExecutor::new(vm, ocr, expander, debugger, options);
    let result = executor.execute(&script).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    }
    if let Some(message) = &result.error {
        eprintln!("Error: {message}");
    }

    Ok(result.exit_code)
}

fn build_debugger(args: &RunArgs) -> Debugger {
    let mode = if args.debug_interactive || args.debug_console {
        DebugMode::Interactive
    } else if args.debug || !args.breakpoint.is_empty() {
        DebugMode::Breakpoints
    } else {
        DebugMode::Off
    };
    let mut debugger = Debugger::with_breakpoints(mode, args.breakpoint.iter().copied());
    debugger.set_echo_ocr(args.debug_console);
    debugger
}

fn check_script(path: Option<PathBuf>) -> Result<(), ScriptError> {
    let (source, origin) = read_source(path.as_deref())?;
    let script = parser::parse_script(&source, origin.as_deref())?;
    let metadata = &script.metadata;

    println!(
        "script:          {}",
        metadata.source.as_deref().unwrap_or("<stdin>")
    );
    println!("total lines:     {}", metadata.total_lines);
    println!("text lines:      {}", metadata.text_lines);
    println!("directive lines: {}", metadata.directive_lines);
    println!("variable lines:  {}", metadata.variable_lines);
    println!("functions:       {}", script.functions.len());
    println!("ok");
    Ok(())
}

fn read_source(path: Option<&Path>) -> Result<(String, Option<PathBuf>), ScriptError> {
    match path {
        Some(path) => {
            let source = std::fs::read_to_string(path)?;
            Ok((source, Some(path.to_path_buf())))
        }
        None => {
            use std::io::Read;
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            Ok((buffer, None))
        }
    }
}

fn flag_duration(value: &Option<String>, flag: &str) -> Result<Option<Duration>, ScriptError> {
    match value {
        None => Ok(None),
        Some(text) => parser::parse_duration(text)
            .map(Some)
            .ok_or_else(|| ScriptError::Usage {
                message: format!("invalid --{flag} duration: \"{text}\" (use e.g. 90s or 500ms)"),
            }),
    }
}
