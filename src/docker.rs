use std::fmt;
use std::io;
use std::process::Command;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

use thiserror::Error;
use tracing::debug;

use crate::config::{IterationConfig, CONTAINER_MODEL_ROOT};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Executes one invocation of the container runtime CLI.
pub trait DockerRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error>;

    fn program(&self) -> &str {
        "docker"
    }
}

#[derive(Debug, Clone)]
pub struct RealDockerRunner {
    binary: String,
}

impl RealDockerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        // A terminal Ctrl-C must not kill a half-finished `run`; the shutdown
        // flag decides when to clean up.
        #[cfg(unix)]
        command.process_group(0);
        let output = command.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn program(&self) -> &str {
        &self.binary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOp {
    Launch,
    Stop,
    Remove,
    Inspect,
    Logs,
}

impl RuntimeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::Inspect => "inspect",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{op}: failed to run `{command}`: {source}")]
    Spawn {
        op: RuntimeOp,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{op}: `{command}` exited with status {status}{}", stderr_suffix(.stderr))]
    Failed {
        op: RuntimeOp,
        command: String,
        status: i32,
        stderr: String,
        hint: Option<&'static str>,
    },
    #[error("launch: `{command}` printed no container id")]
    EmptyIdentifier { command: String },
}

impl RuntimeError {
    pub fn op(&self) -> RuntimeOp {
        match self {
            Self::Spawn { op, .. } | Self::Failed { op, .. } => *op,
            Self::EmptyIdentifier { .. } => RuntimeOp::Launch,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                Some("Install Docker and ensure the runtime binary is on your PATH.")
            }
            Self::Failed { hint, .. } => *hint,
            _ => None,
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

/// Maps runtime stderr to a remediation hint.
pub fn classify_failure(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return Some("Docker daemon is unreachable. Start dockerd and retry.");
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return Some(
            "The server port is already in use. Stop the conflicting process or pick another --port.",
        );
    }

    if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("unauthorized")
    {
        return Some("The image could not be pulled. Check the image reference or run `docker login`.");
    }

    if lower.contains("/dev/kfd")
        || lower.contains("/dev/dri")
        || lower.contains("error gathering device information")
    {
        return Some("Accelerator devices are unavailable. Check the ROCm driver on the host.");
    }

    if lower.contains("no such container") {
        return Some("The container is already gone.");
    }

    None
}

/// Launch arguments for one server instance, excluding the runtime binary.
pub fn launch_args(cfg: &IterationConfig) -> Vec<String> {
    let port = cfg.server.port.to_string();
    let mount = format!(
        "{}:{CONTAINER_MODEL_ROOT}:ro",
        cfg.model_mount_source().display()
    );
    let mut args: Vec<String> = [
        "run",
        "-d",
        "--network=host",
        "--group-add=video",
        "--ipc=host",
        "--cap-add=SYS_PTRACE",
        "--security-opt",
        "seccomp=unconfined",
        "--device",
        "/dev/kfd",
        "--device",
        "/dev/dri",
        "-v",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    args.push(mount);
    args.push("-p".to_string());
    args.push(format!("{port}:{port}"));
    args.push(cfg.server.image.clone());
    args.extend(
        ["python3", "-m", "vllm.entrypoints.openai.api_server", "--model"]
            .iter()
            .map(ToString::to_string),
    );
    args.push(cfg.container_model_path());
    args.push("--served-model-name".to_string());
    args.push(cfg.model.name.clone());
    if cfg.server.trust_remote_code {
        args.push("--trust-remote-code".to_string());
    }
    let numeric = [
        ("--host", "0.0.0.0".to_string()),
        ("--port", port),
        (
            "--tensor-parallel-size",
            cfg.server.tensor_parallel_size.to_string(),
        ),
        (
            "--num-scheduler-steps",
            cfg.server.num_scheduler_steps.to_string(),
        ),
        ("--max-model-len", cfg.server.max_model_len.to_string()),
        ("--max-num-seqs", cfg.server.max_num_seqs.to_string()),
    ];
    for (flag, value) in numeric {
        args.push(flag.to_string());
        args.push(value);
    }
    args.push("--enable-prefix-caching".to_string());
    args
}

/// First 12 characters of a container id, the form `docker ps` prints.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Synchronous adapter over the container runtime CLI.
#[derive(Debug)]
pub struct DockerRuntime<'a, R: DockerRunner> {
    runner: &'a R,
}

impl<'a, R: DockerRunner> DockerRuntime<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    pub fn render(&self, args: &[String]) -> String {
        render_command(self.runner.program(), args)
    }

    fn execute(&self, op: RuntimeOp, args: &[String]) -> Result<CommandOutput, RuntimeError> {
        let command = self.render(args);
        debug!(op = op.as_str(), command = %command, "running container runtime");
        let output = self
            .runner
            .run(args)
            .map_err(|source| RuntimeError::Spawn {
                op,
                command: command.clone(),
                source,
            })?;
        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let hint = classify_failure(&stderr);
            return Err(RuntimeError::Failed {
                op,
                command,
                status: output.status_code,
                stderr,
                hint,
            });
        }
        Ok(output)
    }

    /// Starts a detached instance and returns the id the runtime printed.
    pub fn launch(&self, cfg: &IterationConfig) -> Result<String, RuntimeError> {
        let args = launch_args(cfg);
        let output = self.execute(RuntimeOp::Launch, &args)?;
        let id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(RuntimeError::EmptyIdentifier {
                command: self.render(&args),
            });
        }
        Ok(id)
    }

    pub fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.execute(RuntimeOp::Stop, &["stop".to_string(), id.to_string()])
            .map(|_| ())
    }

    pub fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.execute(RuntimeOp::Remove, &["rm".to_string(), id.to_string()])
            .map(|_| ())
    }

    /// Any inspection failure counts as not running.
    pub fn is_running(&self, id: &str) -> bool {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            id.to_string(),
        ];
        match self.execute(RuntimeOp::Inspect, &args) {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "true",
            Err(err) => {
                debug!(error = %err, "inspect failed; treating container as stopped");
                false
            }
        }
    }

    /// Full diagnostic stream since container start: stdout followed by stderr.
    pub fn fetch_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let output = self.execute(RuntimeOp::Logs, &["logs".to_string(), id.to_string()])?;
        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        Ok(bytes)
    }
}
