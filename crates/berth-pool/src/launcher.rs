use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::id::{JobId, StartupToken};
use crate::job::{is_runtime_env_empty, JobConfig};
use crate::pool::WorkerPoolOptions;
use crate::process::ProcessEnvironment;
use crate::worker::{Language, WorkerType};

/// Replaced in place by the computed per-process option list.
pub const WORKER_DYNAMIC_OPTION_PLACEHOLDER: &str = "RAY_WORKER_DYNAMIC_OPTION_PLACEHOLDER";
/// Substring-replaced by the node manager gRPC port.
pub const NODE_MANAGER_PORT_PLACEHOLDER: &str = "NODE_MANAGER_PORT_PLACEHOLDER";

pub const JOB_ID_ENV_KEY: &str = "RAY_JOB_ID";
pub const AGENT_PID_ENV_KEY: &str = "RAY_RAYLET_PID";

/// The runtime environment setup shim in the dynamic-language worker command.
/// It is elided when the worker runs in the base environment.
const SETUP_WORKER_FILENAME: &str = "setup_worker.py";

#[cfg(target_os = "macos")]
const LIBRARY_PATH_ENV_KEY: &str = "DYLD_LIBRARY_PATH";
#[cfg(target_os = "windows")]
const LIBRARY_PATH_ENV_KEY: &str = "PATH";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const LIBRARY_PATH_ENV_KEY: &str = "LD_LIBRARY_PATH";

pub struct WorkerCommandContext<'a> {
    pub worker_command: &'a [String],
    pub options: &'a WorkerPoolOptions,
    pub node_manager_port: u16,
    pub startup_token: StartupToken,
    pub agent_pid: u32,
}

/// Build the command line and environment additions for one worker process.
/// The command template is expanded at the two placeholder tokens, then
/// per-language flags are appended.
pub fn build_worker_command(
    language: Language,
    job_config: Option<&JobConfig>,
    worker_type: WorkerType,
    job_id: Option<JobId>,
    dynamic_options: &[String],
    runtime_env_hash: u64,
    serialized_runtime_env_context: &str,
    ctx: &WorkerCommandContext<'_>,
) -> (Vec<String>, ProcessEnvironment) {
    let mut options: Vec<String> = vec![];

    // Code search path flags for the managed languages.
    let mut code_search_path = String::new();
    if matches!(language, Language::Java | Language::Cpp) {
        if let Some(job_config) = job_config {
            code_search_path = job_config.code_search_path.join(":");
            if !code_search_path.is_empty() {
                match language {
                    Language::Java => {
                        options.push(format!("-Dray.job.code-search-path={code_search_path}"));
                    }
                    Language::Cpp => {
                        options.push(format!("--ray_code_search_path={code_search_path}"));
                    }
                    Language::Python => {}
                }
            }
        }
    }

    // User-defined per-job options.
    if language == Language::Java {
        if let Some(job_config) = job_config {
            options.extend(job_config.jvm_options.iter().cloned());
        }
        options.push(format!(
            "-Dray.raylet.startup-token={}",
            ctx.startup_token
        ));
        options.push(format!("-Dray.internal.runtime-env-hash={runtime_env_hash}"));
    }

    // User-defined per-process options.
    options.extend(dynamic_options.iter().cloned());

    let mut args: Vec<String> = vec![];
    for token in ctx.worker_command {
        if token == WORKER_DYNAMIC_OPTION_PLACEHOLDER {
            args.extend(options.iter().cloned());
            continue;
        }
        if token.contains(NODE_MANAGER_PORT_PLACEHOLDER) {
            args.push(token.replacen(
                NODE_MANAGER_PORT_PLACEHOLDER,
                &ctx.node_manager_port.to_string(),
                1,
            ));
            continue;
        }
        args.push(token.clone());
    }

    if language == Language::Python && worker_type.is_io() {
        // Without this flag the worker defaults to the task worker type.
        args.push(format!("--worker-type={worker_type}"));
    }

    if worker_type.is_io() && !ctx.options.object_spilling_config.is_empty() {
        args.push(format!(
            "--object-spilling-config={}",
            BASE64.encode(&ctx.options.object_spilling_config)
        ));
    }

    match language {
        Language::Python => {
            args.push(format!("--startup-token={}", ctx.startup_token));
            args.push(format!("--worker-launch-time-ms={}", current_sys_time_ms()));
            args.push(format!("--node-id={}", ctx.options.node_id));
            args.push(format!("--runtime-env-hash={runtime_env_hash}"));
        }
        Language::Cpp => {
            args.push(format!("--startup_token={}", ctx.startup_token));
            args.push(format!("--ray_runtime_env_hash={runtime_env_hash}"));
        }
        Language::Java => {}
    }

    if !is_runtime_env_empty(serialized_runtime_env_context) {
        args.push(format!("--language={language}"));
        args.push(format!(
            "--serialized-runtime-env-context={serialized_runtime_env_context}"
        ));
    } else if language == Language::Python
        && args.len() >= 2
        && args[1].contains(SETUP_WORKER_FILENAME)
    {
        // The worker runs in the base environment, so the setup shim is not
        // needed. Check that the arg really is the shim before erasing it.
        args.remove(1);
    } else {
        args.push(format!("--language={language}"));
    }

    if ctx.options.debugger_external {
        args.push("--ray-debugger-external".to_string());
    }

    let mut env = ProcessEnvironment::new();
    if !worker_type.is_io() {
        // The job ID goes to the worker via the environment, so no new CLI
        // parameter is needed for every language.
        env.insert(JOB_ID_ENV_KEY.to_string(), job_id_hex(job_id));
    }
    env.insert(AGENT_PID_ENV_KEY.to_string(), ctx.agent_pid.to_string());

    if language == Language::Cpp
        && (!ctx.options.native_library_path.is_empty() || !code_search_path.is_empty())
    {
        let mut path_env = ctx.options.native_library_path.clone();
        if let Ok(existing) = std::env::var(LIBRARY_PATH_ENV_KEY) {
            if !existing.is_empty() {
                path_env = format!("{path_env}:{existing}");
            }
        }
        if !code_search_path.is_empty() {
            path_env = format!("{path_env}:{code_search_path}");
        }
        env.insert(LIBRARY_PATH_ENV_KEY.to_string(), path_env);
    }

    if language == Language::Python
        && worker_type == WorkerType::Task
        && !ctx.options.preload_modules.is_empty()
    {
        args.push(format!(
            "--worker-preload-modules={}",
            ctx.options.preload_modules.join(",")
        ));
    }

    if language == Language::Python && worker_type == WorkerType::Task {
        args.push(format!(
            "--enable-resource-isolation={}",
            ctx.options.enable_resource_isolation
        ));
    }

    // Dynamic-language workers rewrite their process title, which would leave
    // /proc/PID/environ empty without this variable.
    if language == Language::Python {
        env.insert("SPT_NOENV".to_string(), "1".to_string());
    }

    if ctx.options.support_fork {
        env.insert("GRPC_ENABLE_FORK_SUPPORT".to_string(), "True".to_string());
        env.insert("GRPC_POLL_STRATEGY".to_string(), "poll".to_string());
    }

    (args, env)
}

fn job_id_hex(job_id: Option<JobId>) -> String {
    format!("{:016x}", job_id.map(u64::from).unwrap_or(0))
}

fn current_sys_time_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
