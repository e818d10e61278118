use crate::id::{ActorId, JobId};
use crate::job::RuntimeEnvInfo;
use crate::worker::Language;

/// The slice of a task description that the worker pool needs to pick or
/// start a worker for the task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub language: Language,
    /// The job the task belongs to. Only synthesized warm-up specs leave
    /// this unset.
    pub job_id: Option<JobId>,
    pub is_actor_creation: bool,
    pub is_actor_task: bool,
    pub required_gpus: f64,
    pub root_detached_actor_id: Option<ActorId>,
    pub runtime_env_info: RuntimeEnvInfo,
    /// A stable hash of the runtime environment, computed by the task
    /// submitter. Workers echo it back at registration so that idle reuse
    /// can compare environments without deserializing them.
    pub runtime_env_hash: u64,
    pub dynamic_options: Vec<String>,
}

impl TaskSpec {
    /// A spec used to warm up the pool with workers running in the base
    /// environment.
    pub fn warmup() -> Self {
        Self {
            language: Language::Python,
            job_id: None,
            is_actor_creation: false,
            is_actor_task: false,
            required_gpus: 0.0,
            root_detached_actor_id: None,
            runtime_env_info: RuntimeEnvInfo {
                serialized_runtime_env: "{}".to_string(),
                config: Default::default(),
            },
            runtime_env_hash: 0,
            dynamic_options: vec![],
        }
    }
}
