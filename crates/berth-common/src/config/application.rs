use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub pool: PoolConfig,
    pub worker_command: WorkerCommandConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("BERTH_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// An opaque identifier of the node, passed to every worker it launches.
    pub node_id: String,
    pub node_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// The maximum number of worker processes of one type that may be pending
    /// registration at the same time, per language.
    /// Zero means the number of CPUs on the node.
    pub maximum_startup_concurrency: usize,
    /// The number of workers to prestart for the first driver or at startup.
    pub num_prestart_workers: usize,
    /// Prestart workers as soon as the node manager server is ready.
    pub enable_worker_prestart: bool,
    /// Prestart workers when the first driver registers.
    /// This has no effect when `enable_worker_prestart` is set.
    pub prestart_worker_first_driver: bool,
    pub worker_register_timeout_secs: u64,
    /// How long an idle worker is kept alive before it becomes eligible for
    /// eviction.
    pub idle_worker_keep_alive_ms: u64,
    /// The interval of the idle worker eviction sweep.
    /// Zero disables the sweep.
    pub kill_idle_workers_interval_ms: u64,
    pub max_io_workers: usize,
    /// The port range handed out to workers at registration.
    /// `min_worker_port` zero means workers choose their own ports.
    pub min_worker_port: u16,
    pub max_worker_port: u16,
    /// An explicit port list that overrides the port range when non-empty.
    pub worker_ports: Vec<u16>,
    pub worker_oom_score_adjustment: i32,
    pub object_spilling_config: String,
    pub preload_modules: Vec<String>,
    pub support_fork: bool,
    pub enable_resource_isolation: bool,
    pub debugger_external: bool,
    pub native_library_path: String,
}

/// The worker command template per language.
/// An empty command means the language is not supported on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommandConfig {
    pub python: Vec<String>,
    pub java: Vec<String>,
    pub cpp: Vec<String>,
}
