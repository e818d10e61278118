use std::fmt;

use crate::pool::state::{IoWorkerState, PerLanguageState};
use crate::pool::WorkerPool;
use crate::worker::Language;

#[derive(Debug, Clone, Default)]
pub struct IoPoolSnapshot {
    pub started: usize,
    pub idle: usize,
    pub num_starting: usize,
    pub pending_tasks: usize,
}

impl IoPoolSnapshot {
    fn new(state: &IoWorkerState) -> Self {
        Self {
            started: state.started.len(),
            idle: state.idle.len(),
            num_starting: state.num_starting,
            pending_tasks: state.pending_tasks.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LanguagePoolSnapshot {
    pub language: Language,
    pub registered_workers: usize,
    pub registered_drivers: usize,
    pub worker_processes: usize,
    pub pending_registration_processes: usize,
    pub pending_start_requests: usize,
    pub pending_registration_requests: usize,
    pub idle_workers: usize,
    pub spill_io: IoPoolSnapshot,
    pub restore_io: IoPoolSnapshot,
}

impl LanguagePoolSnapshot {
    fn new(language: Language, state: &PerLanguageState) -> Self {
        Self {
            language,
            registered_workers: state.registered_workers.len(),
            registered_drivers: state.registered_drivers.len(),
            worker_processes: state.worker_processes.len(),
            pending_registration_processes: state
                .worker_processes
                .values()
                .filter(|p| p.is_pending_registration)
                .count(),
            pending_start_requests: state.pending_start_requests.len(),
            pending_registration_requests: state.pending_registration_requests.len(),
            idle_workers: state.idle.len(),
            spill_io: IoPoolSnapshot::new(&state.spill_io),
            restore_io: IoPoolSnapshot::new(&state.restore_io),
        }
    }
}

/// A point-in-time view of the pool, also used to render the plaintext
/// debug dump.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub registered_jobs: usize,
    pub idle_workers: usize,
    pub pending_exit_workers: usize,
    pub num_workers_started: u64,
    pub num_workers_started_from_cache: u64,
    pub process_failed_job_config_missing: u64,
    pub process_failed_rate_limited: u64,
    pub process_failed_pending_registration: u64,
    pub process_failed_runtime_env_setup_failed: u64,
    pub languages: Vec<LanguagePoolSnapshot>,
}

impl WorkerPool {
    pub fn observe(&self) -> PoolSnapshot {
        let mut languages: Vec<_> = self
            .states_by_language
            .iter()
            .map(|(&language, state)| LanguagePoolSnapshot::new(language, state))
            .collect();
        languages.sort_by_key(|snapshot| snapshot.language);
        PoolSnapshot {
            registered_jobs: self.all_jobs.len() - self.finished_jobs.len(),
            idle_workers: self.idle_of_all_languages.len(),
            pending_exit_workers: self.pending_exit_workers.len(),
            num_workers_started: self.num_workers_started,
            num_workers_started_from_cache: self.num_workers_started_from_cache,
            process_failed_job_config_missing: self.process_failed_job_config_missing,
            process_failed_rate_limited: self.process_failed_rate_limited,
            process_failed_pending_registration: self.process_failed_pending_registration,
            process_failed_runtime_env_setup_failed: self.process_failed_runtime_env_setup_failed,
            languages,
        }
    }

    pub fn debug_string(&self) -> String {
        self.observe().to_string()
    }
}

impl fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerPool:")?;
        write!(f, "\n- registered jobs: {}", self.registered_jobs)?;
        write!(
            f,
            "\n- process_failed_job_config_missing: {}",
            self.process_failed_job_config_missing
        )?;
        write!(
            f,
            "\n- process_failed_rate_limited: {}",
            self.process_failed_rate_limited
        )?;
        write!(
            f,
            "\n- process_failed_pending_registration: {}",
            self.process_failed_pending_registration
        )?;
        write!(
            f,
            "\n- process_failed_runtime_env_setup_failed: {}",
            self.process_failed_runtime_env_setup_failed
        )?;
        for entry in &self.languages {
            write!(
                f,
                "\n- num {} workers: {}",
                entry.language, entry.registered_workers
            )?;
            write!(
                f,
                "\n- num {} drivers: {}",
                entry.language, entry.registered_drivers
            )?;
            write!(
                f,
                "\n- num {} pending start requests: {}",
                entry.language, entry.pending_start_requests
            )?;
            write!(
                f,
                "\n- num {} pending registration requests: {}",
                entry.language, entry.pending_registration_requests
            )?;
            write!(
                f,
                "\n- num object spill callbacks queued: {}",
                entry.spill_io.pending_tasks
            )?;
            write!(
                f,
                "\n- num object restore queued: {}",
                entry.restore_io.pending_tasks
            )?;
        }
        write!(f, "\n- num idle workers: {}", self.idle_workers)?;
        write!(
            f,
            "\n- num pending exit workers: {}",
            self.pending_exit_workers
        )
    }
}
