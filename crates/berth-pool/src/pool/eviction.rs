use std::sync::Arc;

use berth_server::actor::ActorContext;
use log::{debug, error, info};
use tokio::time::Instant;

use crate::actor::PoolActor;
use crate::event::PoolEvent;
use crate::id::WorkerId;
use crate::pool::state::IdleWorkerEntry;
use crate::pool::WorkerPool;

impl WorkerPool {
    /// The periodic idle sweep. Workers of finished jobs are killed
    /// immediately regardless of keep-alive; the rest are killed cold-first
    /// until the number of killable idle workers fits the available CPUs.
    pub(crate) fn try_killing_idle_workers(&mut self, ctx: &mut ActorContext<PoolActor>) {
        let now = Instant::now();

        let mut num_killable_idle_workers: i64 = 0;
        let mut index = 0;
        while index < self.idle_of_all_languages.len() {
            let entry = self.idle_of_all_languages[index];
            let Some(worker) = self.workers.get(&entry.worker_id) else {
                self.idle_of_all_languages.remove(index);
                continue;
            };
            if worker.dead {
                self.idle_of_all_languages.remove(index);
                continue;
            }
            if worker
                .job_id
                .is_some_and(|job_id| self.finished_jobs.contains(&job_id))
            {
                // The job has finished, so the worker is killed immediately.
                if let Some(entry) = self.idle_of_all_languages.remove(index) {
                    self.kill_idle_worker(ctx, entry);
                }
                continue;
            }
            if entry.keep_alive_until < now {
                num_killable_idle_workers += 1;
            }
            index += 1;
        }

        // The soft limit of idle workers to keep around, assuming the common
        // case where each task requires one CPU.
        let num_desired_idle_workers = self.resources.available_cpus();
        debug!(
            "idle workers: {}, killable: {num_killable_idle_workers}, desired: \
             {num_desired_idle_workers}",
            self.idle_of_all_languages.len()
        );

        // Cold workers sit at the front of the queue, so they go first.
        let mut index = 0;
        while num_killable_idle_workers > num_desired_idle_workers
            && index < self.idle_of_all_languages.len()
        {
            if self.idle_of_all_languages[index].keep_alive_until < now {
                if let Some(entry) = self.idle_of_all_languages.remove(index) {
                    self.kill_idle_worker(ctx, entry);
                    num_killable_idle_workers -= 1;
                }
            } else {
                index += 1;
            }
        }
    }

    /// Send an exit request to an idle worker. The worker may refuse, e.g.
    /// when it still owns objects; it is then re-queued at the back so other
    /// killable workers get their turn.
    pub(crate) fn kill_idle_worker(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        entry: IdleWorkerEntry,
    ) {
        let Some(worker) = self.workers.get(&entry.worker_id) else {
            return;
        };
        debug!("sending exit request to idle worker {}", entry.worker_id);
        self.pending_exit_workers.insert(entry.worker_id);
        let force_exit = worker
            .job_id
            .is_some_and(|job_id| self.finished_jobs.contains(&job_id))
            && worker.root_detached_actor_id.is_none();
        if force_exit {
            info!(
                "force exiting worker {} whose job has finished",
                entry.worker_id
            );
        }
        let client = Arc::clone(&worker.client);
        let handle = ctx.handle().clone();
        let worker_id = entry.worker_id;
        let keep_alive_until = entry.keep_alive_until;
        ctx.spawn(async move {
            // A transport failure counts as a kill for bookkeeping, so a
            // crashed worker cannot wedge the pool.
            let killed = match client.exit(force_exit).await {
                Ok(success) => success,
                Err(e) => {
                    error!("failed to send exit request to worker {worker_id}: {e}");
                    true
                }
            };
            let _ = handle
                .send(PoolEvent::WorkerExitReplied {
                    worker_id,
                    keep_alive_until,
                    killed,
                })
                .await;
        });
    }

    pub(crate) fn handle_worker_exit_replied(
        &mut self,
        worker_id: WorkerId,
        keep_alive_until: Instant,
        killed: bool,
    ) {
        self.pending_exit_workers.remove(&worker_id);
        if killed {
            debug!("removed idle worker {worker_id}");
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                // The worker is always marked dead here: even if it is not
                // idle at this moment, it must not be reused.
                worker.dead = true;
                let language = worker.language;
                if let Some(state) = self.states_by_language.get_mut(&language) {
                    state.idle.remove(&worker_id);
                }
            }
        } else {
            debug!("worker {worker_id} refused to exit");
            self.idle_of_all_languages.push_back(IdleWorkerEntry {
                worker_id,
                keep_alive_until,
            });
        }
    }
}
