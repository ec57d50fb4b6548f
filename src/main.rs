mod config;
mod controller;
mod docker;
mod error;
mod health;
mod interrupt;
mod logs;
#[cfg(test)]
mod testing;

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::{
    read_config, resolve_config, validate_config, Overrides, DEFAULT_CONFIG_PATH,
    DEFAULT_CONFIG_YAML,
};
use crate::controller::Controller;
use crate::docker::{launch_args, DockerRuntime, RealDockerRunner};
use crate::error::SoakError;
use crate::health::HttpHealthProbe;
use crate::interrupt::{install_signal_handlers, SystemClock};

#[derive(Parser, Debug)]
#[command(
    name = "vllm-soak",
    version,
    about = "Start, soak and stop a vLLM server container repeatedly"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, help = "Path to the model directory")]
    model_path: Option<String>,
    #[arg(long, help = "Name the server exposes the model under")]
    model_name: Option<String>,
    #[arg(long, help = "Server image to run")]
    docker_image: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    tensor_parallel_size: Option<u32>,
    #[arg(long)]
    num_scheduler_steps: Option<u32>,
    #[arg(long)]
    max_model_len: Option<u32>,
    #[arg(long)]
    max_num_seqs: Option<u32>,
    #[arg(long, help = "Number of start/soak/stop iterations")]
    test_iterations: Option<u32>,
    #[arg(long, help = "Seconds to keep a ready server running")]
    soak_time: Option<u64>,
    #[arg(long, help = "Seconds to wait between iterations")]
    cooldown_time: Option<u64>,
    #[arg(long, help = "Seconds to wait for the server to become ready")]
    startup_timeout: Option<u64>,
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl From<RunArgs> for Overrides {
    fn from(args: RunArgs) -> Self {
        Self {
            model_path: args.model_path,
            model_name: args.model_name,
            image: args.docker_image,
            port: args.port,
            tensor_parallel_size: args.tensor_parallel_size,
            num_scheduler_steps: args.num_scheduler_steps,
            max_model_len: args.max_model_len,
            max_num_seqs: args.max_num_seqs,
            iterations: args.test_iterations,
            soak_sec: args.soak_time,
            cooldown_sec: args.cooldown_time,
            startup_timeout_sec: args.startup_timeout,
            log_dir: args.log_dir,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: Option<PathBuf>,
    json: bool,
}

impl Context {
    fn config_path_or_default(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

fn main() -> Result<(), SoakError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = Context {
        config_path: cli.config,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Run(args) => handle_run(&ctx, args),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SoakError> {
    let path = ctx.config_path_or_default();
    match command {
        ConfigCommand::Init => {
            if path.exists() {
                return output(ctx, json!({"path": path, "created": false}));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = read_config(&path)?;
            validate_config(&cfg)?;
            output(ctx, json!({"path": path, "valid": true}))
        }
    }
}

fn handle_run(ctx: &Context, args: RunArgs) -> Result<(), SoakError> {
    let dry_run = args.dry_run;
    let cfg = resolve_config(ctx.config_path.as_deref(), args.into())?;
    let runner = RealDockerRunner::new(cfg.docker.binary.clone());

    if dry_run {
        let argv = launch_args(&cfg);
        let command = DockerRuntime::new(&runner).render(&argv);
        if ctx.json {
            return output(
                ctx,
                json!({"action": "dry_run", "command": command, "args": argv}),
            );
        }
        println!("{command}");
        return Ok(());
    }

    which::which(&cfg.docker.binary).map_err(|err| {
        SoakError::Config(format!(
            "container runtime '{}' not found on PATH: {err}",
            cfg.docker.binary
        ))
    })?;
    if !Path::new(&cfg.model.path).exists() {
        warn!(path = %cfg.model.path, "model path does not exist on this host");
    }

    let shutdown = install_signal_handlers()?;
    let clock = SystemClock::new(shutdown);
    let probe = HttpHealthProbe::new(&cfg.health.host, cfg.server.port, cfg.request_timeout())?;
    let outcome = Controller::new(&cfg, &runner, &probe, &clock).run()?;

    output(
        ctx,
        json!({
            "action": "run",
            "outcome": outcome.as_str(),
            "iterations": cfg.schedule.iterations,
            "log_dir": cfg.log_dir(),
        }),
    )
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SoakError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SoakError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
