use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SoakError;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const DEFAULT_CONFIG_PATH: &str = "vllm-soak.yaml";
pub const CONFIG_VERSION: u32 = 1;

/// Directory inside the container where the model's parent directory is mounted.
pub const CONTAINER_MODEL_ROOT: &str = "/app/models";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IterationConfig {
    pub version: u32,
    pub model: Model,
    pub server: Server,
    pub schedule: Schedule,
    pub health: Health,
    pub logs: Logs,
    pub docker: Docker,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Model {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Server {
    pub image: String,
    pub port: u16,
    pub tensor_parallel_size: u32,
    pub num_scheduler_steps: u32,
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    pub trust_remote_code: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Schedule {
    pub iterations: u32,
    pub soak_sec: u64,
    pub cooldown_sec: u64,
    pub startup_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Health {
    pub host: String,
    pub poll_interval_sec: u64,
    pub request_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Logs {
    pub dir: String,
    pub capture_every_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Docker {
    pub binary: String,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            model: Model::default(),
            server: Server::default(),
            schedule: Schedule::default(),
            health: Health::default(),
            logs: Logs::default(),
            docker: Docker::default(),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            image: "rocm/vllm-dev:nightly".to_string(),
            port: 8000,
            tensor_parallel_size: 4,
            num_scheduler_steps: 8,
            max_model_len: 4096,
            max_num_seqs: 512,
            trust_remote_code: true,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            iterations: 5,
            soak_sec: 30,
            cooldown_sec: 30,
            startup_timeout_sec: 600,
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            poll_interval_sec: 5,
            request_timeout_sec: 5,
        }
    }
}

impl Default for Logs {
    fn default() -> Self {
        Self {
            dir: "vllm-logs".to_string(),
            capture_every_sec: 30,
        }
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

/// Values supplied on the command line. `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model_path: Option<String>,
    pub model_name: Option<String>,
    pub image: Option<String>,
    pub port: Option<u16>,
    pub tensor_parallel_size: Option<u32>,
    pub num_scheduler_steps: Option<u32>,
    pub max_model_len: Option<u32>,
    pub max_num_seqs: Option<u32>,
    pub iterations: Option<u32>,
    pub soak_sec: Option<u64>,
    pub cooldown_sec: Option<u64>,
    pub startup_timeout_sec: Option<u64>,
    pub log_dir: Option<String>,
}

impl IterationConfig {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut self.model.path, overrides.model_path);
        set(&mut self.model.name, overrides.model_name);
        set(&mut self.server.image, overrides.image);
        set(&mut self.server.port, overrides.port);
        set(
            &mut self.server.tensor_parallel_size,
            overrides.tensor_parallel_size,
        );
        set(
            &mut self.server.num_scheduler_steps,
            overrides.num_scheduler_steps,
        );
        set(&mut self.server.max_model_len, overrides.max_model_len);
        set(&mut self.server.max_num_seqs, overrides.max_num_seqs);
        set(&mut self.schedule.iterations, overrides.iterations);
        set(&mut self.schedule.soak_sec, overrides.soak_sec);
        set(&mut self.schedule.cooldown_sec, overrides.cooldown_sec);
        set(
            &mut self.schedule.startup_timeout_sec,
            overrides.startup_timeout_sec,
        );
        set(&mut self.logs.dir, overrides.log_dir);
    }

    /// Host directory bound into the container.
    pub fn model_mount_source(&self) -> PathBuf {
        Path::new(&self.model.path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Model path as the server sees it inside the container.
    pub fn container_model_path(&self) -> String {
        let leaf = Path::new(&self.model.path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{CONTAINER_MODEL_ROOT}/{leaf}")
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.logs.dir)
    }

    pub fn soak(&self) -> Duration {
        Duration::from_secs(self.schedule.soak_sec)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.schedule.cooldown_sec)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.schedule.startup_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.health.poll_interval_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.health.request_timeout_sec)
    }

    pub fn capture_every(&self) -> Duration {
        Duration::from_secs(self.logs.capture_every_sec)
    }
}

pub fn read_config_from_str(content: &str) -> Result<IterationConfig, SoakError> {
    let cfg: IterationConfig = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(SoakError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<IterationConfig, SoakError> {
    let content = fs::read_to_string(path).map_err(|err| {
        SoakError::Config(format!("failed to read {}: {err}", path.display()))
    })?;
    read_config_from_str(&content)
}

/// Builds the effective configuration: defaults, then the optional file, then flags.
pub fn resolve_config(
    path: Option<&Path>,
    overrides: Overrides,
) -> Result<IterationConfig, SoakError> {
    let mut cfg = match path {
        Some(path) => read_config(path)?,
        None => IterationConfig::default(),
    };
    cfg.apply_overrides(overrides);
    validate_config(&cfg)?;
    if !cfg.model.path.is_empty() {
        let absolute = std::path::absolute(&cfg.model.path)?;
        cfg.model.path = absolute.to_string_lossy().to_string();
    }
    Ok(cfg)
}

pub fn validate_config(cfg: &IterationConfig) -> Result<(), SoakError> {
    if cfg.version != CONFIG_VERSION {
        return Err(SoakError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.model.path.trim().is_empty() {
        return Err(SoakError::Config(
            "model.path must be non-empty (--model-path)".to_string(),
        ));
    }
    if Path::new(&cfg.model.path).file_name().is_none() {
        return Err(SoakError::Config(format!(
            "model.path '{}' must name a model directory",
            cfg.model.path
        )));
    }
    if cfg.model.name.trim().is_empty() {
        return Err(SoakError::Config(
            "model.name must be non-empty (--model-name)".to_string(),
        ));
    }
    if cfg.server.image.trim().is_empty() {
        return Err(SoakError::Config(
            "server.image must be non-empty".to_string(),
        ));
    }
    if cfg.server.port == 0 {
        return Err(SoakError::Config(
            "server.port must be greater than 0".to_string(),
        ));
    }
    let positive_u32 = [
        ("server.tensor_parallel_size", cfg.server.tensor_parallel_size),
        ("server.num_scheduler_steps", cfg.server.num_scheduler_steps),
        ("server.max_model_len", cfg.server.max_model_len),
        ("server.max_num_seqs", cfg.server.max_num_seqs),
        ("schedule.iterations", cfg.schedule.iterations),
    ];
    for (field, value) in positive_u32 {
        if value == 0 {
            return Err(SoakError::Config(format!(
                "{field} must be greater than 0"
            )));
        }
    }
    let positive_secs = [
        ("schedule.startup_timeout_sec", cfg.schedule.startup_timeout_sec),
        ("health.poll_interval_sec", cfg.health.poll_interval_sec),
        ("health.request_timeout_sec", cfg.health.request_timeout_sec),
        ("logs.capture_every_sec", cfg.logs.capture_every_sec),
    ];
    for (field, value) in positive_secs {
        if value == 0 {
            return Err(SoakError::Config(format!(
                "{field} must be greater than 0"
            )));
        }
    }
    if cfg.health.host.trim().is_empty() {
        return Err(SoakError::Config(
            "health.host must be non-empty".to_string(),
        ));
    }
    if cfg.logs.dir.trim().is_empty() {
        return Err(SoakError::Config("logs.dir must be non-empty".to_string()));
    }
    if cfg.docker.binary.trim().is_empty() {
        return Err(SoakError::Config(
            "docker.binary must be non-empty".to_string(),
        ));
    }
    Ok(())
}
