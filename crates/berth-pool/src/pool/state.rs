use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::WorkerClient;
use crate::id::{ActorId, JobId, StartupToken, WorkerId};
use crate::job::RuntimeEnvInfo;
use crate::pool::{IoWorkerCallback, PopWorkerRequest};
use crate::process::ProcessHandle;
use crate::worker::{Language, LeasedWorker, WorkerType};

/// A spawned worker process, keyed by its startup token. The entry outlives
/// registration: `is_pending_registration` clears when the startup handshake
/// completes, and the entry is removed when the process disconnects, dies,
/// or times out during registration.
pub struct WorkerProcess {
    pub worker_type: WorkerType,
    pub handle: Box<dyn ProcessHandle>,
    pub started_at: Instant,
    pub is_pending_registration: bool,
    pub runtime_env_info: RuntimeEnvInfo,
    pub dynamic_options: Vec<String>,
    pub startup_keep_alive: Option<Duration>,
}

/// A registered worker. There is exactly one process handle per registered
/// worker; the pending `WorkerProcess` entry with the same startup token is
/// a disjoint view of the same process.
pub struct Worker {
    pub id: WorkerId,
    pub language: Language,
    pub worker_type: WorkerType,
    pub startup_token: StartupToken,
    pub handle: Box<dyn ProcessHandle>,
    pub client: Arc<dyn WorkerClient>,
    pub port: u16,
    pub runtime_env_hash: u64,
    pub job_id: Option<JobId>,
    pub root_detached_actor_id: Option<ActorId>,
    pub is_gpu: Option<bool>,
    pub is_actor_worker: Option<bool>,
    /// Set when the first task is dispatched to the worker. A worker that
    /// has never held a task is "cold" and is preferred for eviction.
    pub assigned_task_at: Option<Instant>,
    pub dead: bool,
}

impl Worker {
    pub fn to_leased(&self) -> LeasedWorker {
        LeasedWorker {
            worker_id: self.id,
            language: self.language,
            worker_type: self.worker_type,
            pid: self.handle.pid(),
            port: self.port,
            startup_token: self.startup_token,
        }
    }
}

pub struct Driver {
    pub id: WorkerId,
    pub language: Language,
    pub job_id: JobId,
    pub port: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct IdleWorkerEntry {
    pub worker_id: WorkerId,
    pub keep_alive_until: Instant,
}

#[derive(Default)]
pub struct IoWorkerState {
    pub started: HashSet<WorkerId>,
    pub idle: HashSet<WorkerId>,
    pub num_starting: usize,
    pub pending_tasks: VecDeque<IoWorkerCallback>,
}

pub struct PerLanguageState {
    pub worker_command: Vec<String>,
    pub registered_workers: HashSet<WorkerId>,
    pub registered_drivers: HashSet<WorkerId>,
    pub worker_processes: HashMap<StartupToken, WorkerProcess>,
    pub pending_start_requests: VecDeque<PopWorkerRequest>,
    pub pending_registration_requests: VecDeque<PopWorkerRequest>,
    /// Mirrors the presence of this language's workers in the global idle
    /// queue; the queue holds the ordering and keep-alive deadlines.
    pub idle: HashSet<WorkerId>,
    pub spill_io: IoWorkerState,
    pub restore_io: IoWorkerState,
    pub multiple_for_warning: usize,
    pub last_warning_multiple: i64,
}

impl PerLanguageState {
    pub fn new(worker_command: Vec<String>, multiple_for_warning: usize) -> Self {
        Self {
            worker_command,
            registered_workers: HashSet::new(),
            registered_drivers: HashSet::new(),
            worker_processes: HashMap::new(),
            pending_start_requests: VecDeque::new(),
            pending_registration_requests: VecDeque::new(),
            idle: HashSet::new(),
            spill_io: IoWorkerState::default(),
            restore_io: IoWorkerState::default(),
            multiple_for_warning,
            last_warning_multiple: 0,
        }
    }

    pub fn io_state(&self, worker_type: WorkerType) -> &IoWorkerState {
        match worker_type {
            WorkerType::Spill => &self.spill_io,
            WorkerType::Restore => &self.restore_io,
            WorkerType::Task => unreachable!("task workers have no I/O sub-pool"),
        }
    }

    pub fn io_state_mut(&mut self, worker_type: WorkerType) -> &mut IoWorkerState {
        match worker_type {
            WorkerType::Spill => &mut self.spill_io,
            WorkerType::Restore => &mut self.restore_io,
            WorkerType::Task => unreachable!("task workers have no I/O sub-pool"),
        }
    }

    /// The number of processes of the given type that have been spawned but
    /// have not completed the startup handshake.
    pub fn num_pending_registration(&self, worker_type: WorkerType) -> usize {
        self.worker_processes
            .values()
            .filter(|p| p.worker_type == worker_type && p.is_pending_registration)
            .count()
    }
}
