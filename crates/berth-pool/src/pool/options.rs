//! A dedicated module for worker pool options to ensure readonly access.
use std::collections::HashMap;
use std::time::Duration;

use berth_common::config::AppConfig;

use crate::error::{PoolError, PoolResult};
use crate::worker::Language;

#[readonly::make]
pub struct WorkerPoolOptions {
    pub node_id: String,
    pub node_ip: String,
    pub worker_commands: HashMap<Language, Vec<String>>,
    pub maximum_startup_concurrency: usize,
    pub num_prestart_workers: usize,
    pub enable_worker_prestart: bool,
    pub prestart_worker_first_driver: bool,
    pub worker_register_timeout: Duration,
    pub idle_worker_keep_alive: Duration,
    /// Zero disables the periodic idle worker eviction sweep.
    pub kill_idle_workers_interval: Duration,
    pub max_io_workers: usize,
    pub min_worker_port: u16,
    pub max_worker_port: u16,
    pub worker_ports: Vec<u16>,
    pub worker_oom_score_adjustment: i32,
    pub object_spilling_config: String,
    pub preload_modules: Vec<String>,
    pub support_fork: bool,
    pub enable_resource_isolation: bool,
    pub debugger_external: bool,
    pub native_library_path: String,
}

impl TryFrom<&AppConfig> for WorkerPoolOptions {
    type Error = PoolError;

    fn try_from(config: &AppConfig) -> PoolResult<Self> {
        let mut worker_commands = HashMap::new();
        for (language, command) in [
            (Language::Python, &config.worker_command.python),
            (Language::Java, &config.worker_command.java),
            (Language::Cpp, &config.worker_command.cpp),
        ] {
            if !command.is_empty() {
                worker_commands.insert(language, command.clone());
            }
        }
        if worker_commands.is_empty() {
            return Err(PoolError::InvalidArgument(
                "no worker command is configured".to_string(),
            ));
        }
        if config.pool.worker_ports.is_empty()
            && config.pool.min_worker_port != 0
            && config.pool.max_worker_port != 0
            && config.pool.max_worker_port < config.pool.min_worker_port
        {
            return Err(PoolError::InvalidArgument(format!(
                "invalid worker port range: {}..={}",
                config.pool.min_worker_port, config.pool.max_worker_port
            )));
        }
        let maximum_startup_concurrency = if config.pool.maximum_startup_concurrency > 0 {
            config.pool.maximum_startup_concurrency
        } else {
            num_cpus::get()
        };
        Ok(Self {
            node_id: config.node.node_id.clone(),
            node_ip: config.node.node_ip.clone(),
            worker_commands,
            maximum_startup_concurrency,
            num_prestart_workers: config.pool.num_prestart_workers,
            enable_worker_prestart: config.pool.enable_worker_prestart,
            prestart_worker_first_driver: config.pool.prestart_worker_first_driver,
            worker_register_timeout: Duration::from_secs(config.pool.worker_register_timeout_secs),
            idle_worker_keep_alive: Duration::from_millis(config.pool.idle_worker_keep_alive_ms),
            kill_idle_workers_interval: Duration::from_millis(
                config.pool.kill_idle_workers_interval_ms,
            ),
            max_io_workers: config.pool.max_io_workers,
            min_worker_port: config.pool.min_worker_port,
            max_worker_port: config.pool.max_worker_port,
            worker_ports: config.pool.worker_ports.clone(),
            worker_oom_score_adjustment: config.pool.worker_oom_score_adjustment,
            object_spilling_config: config.pool.object_spilling_config.clone(),
            preload_modules: config.pool.preload_modules.clone(),
            support_fork: config.pool.support_fork,
            enable_resource_isolation: config.pool.enable_resource_isolation,
            debugger_external: config.pool.debugger_external,
            native_library_path: config.pool.native_library_path.clone(),
        })
    }
}
