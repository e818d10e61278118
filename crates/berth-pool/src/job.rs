/// Returns whether a serialized runtime environment describes the base
/// environment, in which case no agent interaction is needed.
pub fn is_runtime_env_empty(serialized_runtime_env: &str) -> bool {
    serialized_runtime_env.is_empty() || serialized_runtime_env == "{}"
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnvConfig {
    pub eager_install: bool,
    pub setup_timeout_seconds: u64,
}

/// An opaque serialized description of an isolated execution environment,
/// together with its configuration. The runtime environment agent turns it
/// into a context string that is passed to the worker on its command line.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEnvInfo {
    pub serialized_runtime_env: String,
    pub config: RuntimeEnvConfig,
}

impl RuntimeEnvInfo {
    pub fn is_empty(&self) -> bool {
        is_runtime_env_empty(&self.serialized_runtime_env)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub jvm_options: Vec<String>,
    pub code_search_path: Vec<String>,
    pub runtime_env_info: RuntimeEnvInfo,
}

impl JobConfig {
    /// An eager install only takes a reference on the runtime environment
    /// when the environment is non-empty, so the matching delete on job
    /// finish must use the same condition.
    pub fn needs_eager_runtime_env_install(&self) -> bool {
        self.runtime_env_info.config.eager_install && !self.runtime_env_info.is_empty()
    }
}
