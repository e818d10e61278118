use std::sync::Arc;

use berth_server::actor::{ActorAction, ActorContext};
use log::{info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::actor::PoolActor;
use crate::client::WorkerClient;
use crate::error::PoolResult;
use crate::event::PoolEvent;
use crate::id::{JobId, PopRequestId, StartupToken, WorkerId};
use crate::job::JobConfig;
use crate::pool::{
    IoWorkerCallback, PoolSnapshot, PopWorkerCallback, PopWorkerRequest, PopWorkerStatus,
    WorkerAssignment,
};
use crate::task::TaskSpec;
use crate::worker::{Language, WorkerType};

impl PoolActor {
    pub(super) fn handle_server_ready(
        &mut self,
        ctx: &mut ActorContext<Self>,
        port: u16,
    ) -> ActorAction {
        info!("node manager server is ready on port {port}");
        self.pool.set_node_manager_port(port);
        if self.pool.options().enable_worker_prestart {
            let num_prestart_workers = self.pool.options().num_prestart_workers;
            self.pool
                .prestart_workers_internal(ctx, TaskSpec::warmup(), num_prestart_workers as i64);
        }
        ActorAction::Continue
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_register_worker(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        language: Language,
        worker_type: WorkerType,
        pid: u32,
        startup_token: StartupToken,
        runtime_env_hash: u64,
        client: Arc<dyn WorkerClient>,
        reply: oneshot::Sender<PoolResult<u16>>,
    ) -> ActorAction {
        let out = self.pool.register_worker(
            worker_id,
            language,
            worker_type,
            pid,
            startup_token,
            runtime_env_hash,
            client,
        );
        if reply.send(out).is_err() {
            warn!("failed to send worker registration reply");
        }
        ActorAction::Continue
    }

    pub(super) fn handle_register_driver(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        language: Language,
        job_id: JobId,
        job_config: JobConfig,
        reply: oneshot::Sender<PoolResult<u16>>,
    ) -> ActorAction {
        self.pool
            .register_driver(ctx, worker_id, language, job_id, job_config, reply);
        ActorAction::Continue
    }

    pub(super) fn handle_worker_started(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        self.pool.on_worker_started(ctx, worker_id);
        match self.pool.registered_worker_type(worker_id) {
            Some(WorkerType::Task) => self.pool.push_worker(ctx, worker_id),
            Some(WorkerType::Spill) | Some(WorkerType::Restore) => {
                self.pool.push_io_worker(worker_id)
            }
            None => {}
        }
        ActorAction::Continue
    }

    pub(super) fn handle_pop_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        spec: TaskSpec,
        callback: PopWorkerCallback,
    ) -> ActorAction {
        self.pool.pop_worker(ctx, spec, callback);
        ActorAction::Continue
    }

    pub(super) fn handle_push_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        self.pool.push_worker(ctx, worker_id);
        ActorAction::Continue
    }

    pub(super) fn handle_prestart_workers(
        &mut self,
        ctx: &mut ActorContext<Self>,
        spec: TaskSpec,
        backlog_size: i64,
    ) -> ActorAction {
        self.pool.prestart_workers(ctx, spec, backlog_size);
        ActorAction::Continue
    }

    pub(super) fn handle_pop_io_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_type: WorkerType,
        callback: IoWorkerCallback,
    ) -> ActorAction {
        self.pool.pop_io_worker(ctx, worker_type, callback);
        ActorAction::Continue
    }

    pub(super) fn handle_push_io_worker(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        self.pool.push_io_worker(worker_id);
        ActorAction::Continue
    }

    pub(super) fn handle_pop_delete_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        callback: IoWorkerCallback,
    ) -> ActorAction {
        self.pool.pop_delete_worker(ctx, callback);
        ActorAction::Continue
    }

    pub(super) fn handle_job_started(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
        job_config: JobConfig,
    ) -> ActorAction {
        self.pool.handle_job_started(ctx, job_id, job_config);
        ActorAction::Continue
    }

    pub(super) fn handle_job_finished(
        &mut self,
        ctx: &mut ActorContext<Self>,
        job_id: JobId,
    ) -> ActorAction {
        self.pool.handle_job_finished(ctx, job_id);
        ActorAction::Continue
    }

    pub(super) fn handle_disconnect_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        self.pool.disconnect_worker(ctx, worker_id);
        ActorAction::Continue
    }

    pub(super) fn handle_disconnect_driver(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
    ) -> ActorAction {
        self.pool.disconnect_driver(worker_id);
        ActorAction::Continue
    }

    pub(super) fn handle_probe_starting_worker_process(
        &mut self,
        ctx: &mut ActorContext<Self>,
        language: Language,
        startup_token: StartupToken,
    ) -> ActorAction {
        self.pool
            .probe_starting_worker_process(ctx, language, startup_token);
        ActorAction::Continue
    }

    pub(super) fn handle_probe_pending_pop_request(
        &mut self,
        ctx: &mut ActorContext<Self>,
        language: Language,
        request_id: PopRequestId,
    ) -> ActorAction {
        self.pool.probe_pending_pop_request(ctx, language, request_id);
        ActorAction::Continue
    }

    pub(super) fn handle_tick_idle_worker_eviction(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        self.pool.try_killing_idle_workers(ctx);
        let interval = self.pool.options().kill_idle_workers_interval;
        if !interval.is_zero() {
            ctx.send_with_delay(PoolEvent::TickIdleWorkerEviction, interval);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_runtime_env_created(
        &mut self,
        ctx: &mut ActorContext<Self>,
        request: PopWorkerRequest,
        result: Result<String, String>,
    ) -> ActorAction {
        self.pool.handle_runtime_env_created(ctx, request, result);
        ActorAction::Continue
    }

    pub(super) fn handle_prestart_runtime_env_created(
        &mut self,
        ctx: &mut ActorContext<Self>,
        spec: TaskSpec,
        serialized_context: String,
    ) -> ActorAction {
        self.pool
            .handle_prestart_runtime_env_created(ctx, spec, serialized_context);
        ActorAction::Continue
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_complete_pop_worker(
        &mut self,
        ctx: &mut ActorContext<Self>,
        callback: PopWorkerCallback,
        worker_id: Option<WorkerId>,
        assignment: Option<WorkerAssignment>,
        status: PopWorkerStatus,
        message: Option<String>,
    ) -> ActorAction {
        self.pool
            .complete_pop_worker(ctx, callback, worker_id, assignment, status, message);
        ActorAction::Continue
    }

    pub(super) fn handle_worker_exit_replied(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        worker_id: WorkerId,
        keep_alive_until: Instant,
        killed: bool,
    ) -> ActorAction {
        self.pool
            .handle_worker_exit_replied(worker_id, keep_alive_until, killed);
        ActorAction::Continue
    }

    pub(super) fn handle_observe_pool(
        &mut self,
        reply: oneshot::Sender<PoolSnapshot>,
    ) -> ActorAction {
        let _ = reply.send(self.pool.observe());
        ActorAction::Continue
    }
}
