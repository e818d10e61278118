mod core;
mod eviction;
mod io;
mod observer;
mod options;
pub(crate) mod state;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub use observer::{IoPoolSnapshot, LanguagePoolSnapshot, PoolSnapshot};
pub use options::WorkerPoolOptions;
use tokio::sync::oneshot;

use crate::error::PoolResult;
use crate::id::{ActorId, IdGenerator, JobId, PopRequestId, StartupToken, WorkerId};
use crate::job::{JobConfig, RuntimeEnvInfo};
use crate::metrics::PoolMetrics;
use crate::pool::state::{Driver, IdleWorkerEntry, PerLanguageState, Worker};
use crate::ports::{PortAllocator, PortProbe};
use crate::process::ProcessSpawner;
use crate::resources::NodeResources;
use crate::runtime_env::RuntimeEnvAgent;
use crate::worker::{Language, LeasedWorker, WorkerType};

/// Invoked when a pop request completes, with the dispatched worker on
/// success. The return value reports whether the worker was used; an unused
/// worker is returned to the pool.
pub type PopWorkerCallback =
    Box<dyn FnOnce(Option<LeasedWorker>, PopWorkerStatus, Option<String>) -> bool + Send>;

/// Invoked when an I/O worker is dispatched to a pending I/O task.
pub type IoWorkerCallback = Box<dyn FnOnce(LeasedWorker) + Send>;

/// A task-driven request for a worker, queued while a process is being
/// started for it.
pub struct PopWorkerRequest {
    pub id: PopRequestId,
    pub language: Language,
    pub worker_type: WorkerType,
    pub job_id: JobId,
    pub root_detached_actor_id: Option<ActorId>,
    pub is_gpu: Option<bool>,
    pub is_actor_worker: Option<bool>,
    pub runtime_env_info: RuntimeEnvInfo,
    pub runtime_env_hash: u64,
    pub dynamic_options: Vec<String>,
    pub startup_keep_alive: Option<Duration>,
    pub callback: PopWorkerCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopWorkerStatus {
    Ok,
    /// The job is not yet known to the pool; the caller retries after the
    /// job-started notification.
    JobConfigMissing,
    /// Startup admission control rejected the request; it is parked in the
    /// pending-start queue and retried when capacity frees up.
    TooManyStartingWorkerProcesses,
    /// The process spawned for the request did not register in time.
    WorkerPendingRegistration,
    /// Terminal; carries a setup error message.
    RuntimeEnvCreationFailed,
    /// The job terminated between startup and callback; the worker is
    /// returned to the pool instead of being assigned.
    JobFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerUnfitReason {
    Other,
    RootMismatch,
    RuntimeEnvMismatch,
    DynamicOptionsMismatch,
}

/// Attributes bound to a worker when a dispatch is accepted.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub job_id: JobId,
    pub root_detached_actor_id: Option<ActorId>,
    pub is_gpu: Option<bool>,
    pub is_actor_worker: Option<bool>,
}

pub(crate) enum StartWorkerOutcome {
    Started(StartupToken),
    Rejected(PopWorkerStatus),
    /// Unrecoverable; already logged, the request is dropped.
    Aborted,
}

pub struct WorkerPool {
    pub(crate) options: WorkerPoolOptions,
    pub(crate) spawner: Arc<dyn ProcessSpawner>,
    pub(crate) runtime_env_agent: Arc<dyn RuntimeEnvAgent>,
    pub(crate) resources: Arc<dyn NodeResources>,
    pub(crate) metrics: PoolMetrics,
    pub(crate) node_manager_port: Option<u16>,
    pub(crate) states_by_language: HashMap<Language, PerLanguageState>,
    pub(crate) workers: HashMap<WorkerId, Worker>,
    pub(crate) drivers: HashMap<WorkerId, Driver>,
    /// Idle workers of all languages. Cold workers are queued at the front
    /// and warm workers at the back; matching scans from the back and
    /// eviction from the front.
    pub(crate) idle_of_all_languages: VecDeque<IdleWorkerEntry>,
    /// Workers with an in-flight exit request.
    pub(crate) pending_exit_workers: HashSet<WorkerId>,
    pub(crate) port_allocator: PortAllocator,
    pub(crate) startup_tokens: IdGenerator<StartupToken>,
    pub(crate) pop_request_ids: IdGenerator<PopRequestId>,
    /// Finished jobs are kept here forever; callbacks that raced with job
    /// termination may still look up the config.
    pub(crate) all_jobs: HashMap<JobId, JobConfig>,
    pub(crate) finished_jobs: HashSet<JobId>,
    pub(crate) first_job_registered: bool,
    pub(crate) first_job_registered_worker_count: usize,
    pub(crate) first_job_driver_wait_num_workers: usize,
    pub(crate) deferred_first_driver_reply: Option<(oneshot::Sender<PoolResult<u16>>, u16)>,
    pub(crate) num_workers_started: u64,
    pub(crate) num_workers_started_from_cache: u64,
    pub(crate) process_failed_job_config_missing: u64,
    pub(crate) process_failed_rate_limited: u64,
    pub(crate) process_failed_pending_registration: u64,
    pub(crate) process_failed_runtime_env_setup_failed: u64,
}

impl WorkerPool {
    pub fn new(
        options: WorkerPoolOptions,
        spawner: Arc<dyn ProcessSpawner>,
        runtime_env_agent: Arc<dyn RuntimeEnvAgent>,
        resources: Arc<dyn NodeResources>,
        port_probe: Box<dyn PortProbe>,
    ) -> Self {
        let states_by_language = options
            .worker_commands
            .iter()
            .map(|(&language, command)| {
                (
                    language,
                    PerLanguageState::new(command.clone(), options.maximum_startup_concurrency),
                )
            })
            .collect();
        let port_allocator = PortAllocator::new(&options, port_probe);
        let first_job_driver_wait_num_workers = options
            .num_prestart_workers
            .min(options.maximum_startup_concurrency);
        Self {
            options,
            spawner,
            runtime_env_agent,
            resources,
            metrics: PoolMetrics::new(),
            node_manager_port: None,
            states_by_language,
            workers: HashMap::new(),
            drivers: HashMap::new(),
            idle_of_all_languages: VecDeque::new(),
            pending_exit_workers: HashSet::new(),
            port_allocator,
            startup_tokens: IdGenerator::new(),
            pop_request_ids: IdGenerator::new(),
            all_jobs: HashMap::new(),
            finished_jobs: HashSet::new(),
            first_job_registered: false,
            first_job_registered_worker_count: 0,
            first_job_driver_wait_num_workers,
            deferred_first_driver_reply: None,
            num_workers_started: 0,
            num_workers_started_from_cache: 0,
            process_failed_job_config_missing: 0,
            process_failed_rate_limited: 0,
            process_failed_pending_registration: 0,
            process_failed_runtime_env_setup_failed: 0,
        }
    }

    pub fn options(&self) -> &WorkerPoolOptions {
        &self.options
    }

    pub fn set_node_manager_port(&mut self, port: u16) {
        self.node_manager_port = Some(port);
    }

    pub fn registered_worker_type(&self, worker_id: WorkerId) -> Option<WorkerType> {
        self.workers.get(&worker_id).map(|w| w.worker_type)
    }

    /// Kill every worker process the pool still knows about. Called when the
    /// pool actor stops; the processes are not waited on.
    pub fn kill_all_worker_processes(&mut self) {
        for state in self.states_by_language.values() {
            for worker_process in state.worker_processes.values() {
                worker_process.handle.kill();
            }
        }
    }
}
