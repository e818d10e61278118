use berth_server::actor::ActorContext;
use log::{debug, warn};

use crate::actor::PoolActor;
use crate::id::WorkerId;
use crate::job::RuntimeEnvInfo;
use crate::pool::{IoWorkerCallback, StartWorkerOutcome, WorkerPool};
use crate::worker::{Language, WorkerType};

/// Only dynamic-language I/O workers are supported.
const IO_WORKER_LANGUAGE: Language = Language::Python;

impl WorkerPool {
    /// Pop an idle I/O worker of the given sub-pool, or queue the callback
    /// and start workers to meet the demand.
    pub fn pop_io_worker(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        worker_type: WorkerType,
        callback: IoWorkerCallback,
    ) {
        debug_assert!(worker_type.is_io());
        let Some(state) = self.states_by_language.get_mut(&IO_WORKER_LANGUAGE) else {
            warn!("I/O workers are not supported without a {IO_WORKER_LANGUAGE} worker command");
            return;
        };
        let io = state.io_state_mut(worker_type);
        if let Some(&worker_id) = io.idle.iter().next() {
            io.idle.remove(&worker_id);
            debug!("popped {worker_type} worker {worker_id}");
            let Some(worker) = self.workers.get(&worker_id) else {
                warn!("idle {worker_type} worker {worker_id} is not registered");
                return;
            };
            callback(worker.to_leased());
        } else {
            // The pending task must be queued first: the demand-driven start
            // below is sized by the number of pending tasks.
            io.pending_tasks.push_back(callback);
            debug!("no idle {worker_type} worker, trying to start a new one");
            self.try_start_io_workers_of_type(ctx, IO_WORKER_LANGUAGE, worker_type);
        }
    }

    /// Return an I/O worker to its sub-pool, or hand it directly to the
    /// oldest pending task. A worker that died during startup is dropped.
    pub fn push_io_worker(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get(&worker_id) else {
            warn!("pushed I/O worker {worker_id} is not registered");
            return;
        };
        debug_assert!(worker.worker_type.is_io());
        let worker_type = worker.worker_type;
        let leased = worker.to_leased();
        let Some(state) = self.states_by_language.get_mut(&IO_WORKER_LANGUAGE) else {
            return;
        };
        let io = state.io_state_mut(worker_type);
        if !io.started.contains(&worker_id) {
            debug!(
                "{worker_type} worker {worker_id} has failed during startup, skip pushing it \
                 to the pool"
            );
            return;
        }
        if let Some(callback) = io.pending_tasks.pop_front() {
            callback(leased);
        } else {
            io.idle.insert(worker_id);
        }
    }

    /// Pop an I/O worker for object deletion. Deletion is delegated to the
    /// sub-pool with fewer idle workers, spreading the load onto the pool
    /// with more activity pressure; ties go to the restore pool.
    pub fn pop_delete_worker(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        callback: IoWorkerCallback,
    ) {
        let Some(state) = self.states_by_language.get(&IO_WORKER_LANGUAGE) else {
            warn!("I/O workers are not supported without a {IO_WORKER_LANGUAGE} worker command");
            return;
        };
        let num_spill_idle_workers = state.spill_io.idle.len();
        let num_restore_idle_workers = state.restore_io.idle.len();
        let worker_type = if num_spill_idle_workers < num_restore_idle_workers {
            WorkerType::Spill
        } else {
            WorkerType::Restore
        };
        self.pop_io_worker(ctx, worker_type, callback);
    }

    pub(crate) fn try_start_io_workers(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        language: Language,
    ) {
        self.try_start_io_workers_of_type(ctx, language, WorkerType::Restore);
        self.try_start_io_workers_of_type(ctx, language, WorkerType::Spill);
    }

    /// Start I/O workers to cover pending tasks that no idle worker can
    /// serve, within the `max_io_workers` budget per sub-pool.
    pub(crate) fn try_start_io_workers_of_type(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        language: Language,
        worker_type: WorkerType,
    ) {
        if language != IO_WORKER_LANGUAGE {
            return;
        }
        let Some(state) = self.states_by_language.get(&language) else {
            return;
        };
        let io = state.io_state(worker_type);
        let available = io.num_starting + io.started.len();
        let budget = self.options.max_io_workers.saturating_sub(available);
        if io.pending_tasks.len() <= io.idle.len() {
            return;
        }
        let needed = (io.pending_tasks.len() - io.idle.len()).min(budget);
        for _ in 0..needed {
            let outcome = self.start_worker_process(
                ctx,
                language,
                worker_type,
                None,
                &[],
                0,
                "",
                RuntimeEnvInfo::default(),
                None,
            );
            match outcome {
                StartWorkerOutcome::Started(_) => {}
                // We may have hit the startup concurrency limit. Stop.
                _ => return,
            }
        }
    }
}
