use berth_server::actor::{Actor, ActorAction, ActorContext};
use log::info;

use crate::actor::{PoolActor, PoolActorOptions};
use crate::event::PoolEvent;
use crate::pool::WorkerPool;

#[tonic::async_trait]
impl Actor for PoolActor {
    type Message = PoolEvent;
    type Options = PoolActorOptions;

    fn name() -> &'static str {
        "PoolActor"
    }

    fn new(options: PoolActorOptions) -> Self {
        let pool = WorkerPool::new(
            options.options,
            options.spawner,
            options.runtime_env_agent,
            options.resources,
            options.port_probe,
        );
        Self { pool }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        let interval = self.pool.options().kill_idle_workers_interval;
        if !interval.is_zero() {
            ctx.send_with_delay(PoolEvent::TickIdleWorkerEviction, interval);
        }
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: PoolEvent) -> ActorAction {
        match message {
            PoolEvent::ServerReady { port } => self.handle_server_ready(ctx, port),
            PoolEvent::RegisterWorker {
                worker_id,
                language,
                worker_type,
                pid,
                startup_token,
                runtime_env_hash,
                client,
                reply,
            } => self.handle_register_worker(
                ctx,
                worker_id,
                language,
                worker_type,
                pid,
                startup_token,
                runtime_env_hash,
                client,
                reply,
            ),
            PoolEvent::RegisterDriver {
                worker_id,
                language,
                job_id,
                job_config,
                reply,
            } => self.handle_register_driver(ctx, worker_id, language, job_id, job_config, reply),
            PoolEvent::WorkerStarted { worker_id } => self.handle_worker_started(ctx, worker_id),
            PoolEvent::PopWorker { spec, callback } => self.handle_pop_worker(ctx, spec, callback),
            PoolEvent::PushWorker { worker_id } => self.handle_push_worker(ctx, worker_id),
            PoolEvent::PrestartWorkers { spec, backlog_size } => {
                self.handle_prestart_workers(ctx, spec, backlog_size)
            }
            PoolEvent::PopIoWorker {
                worker_type,
                callback,
            } => self.handle_pop_io_worker(ctx, worker_type, callback),
            PoolEvent::PushIoWorker { worker_id } => self.handle_push_io_worker(ctx, worker_id),
            PoolEvent::PopDeleteWorker { callback } => self.handle_pop_delete_worker(ctx, callback),
            PoolEvent::JobStarted { job_id, job_config } => {
                self.handle_job_started(ctx, job_id, job_config)
            }
            PoolEvent::JobFinished { job_id } => self.handle_job_finished(ctx, job_id),
            PoolEvent::DisconnectWorker { worker_id } => {
                self.handle_disconnect_worker(ctx, worker_id)
            }
            PoolEvent::DisconnectDriver { worker_id } => {
                self.handle_disconnect_driver(ctx, worker_id)
            }
            PoolEvent::ProbeStartingWorkerProcess {
                language,
                startup_token,
            } => self.handle_probe_starting_worker_process(ctx, language, startup_token),
            PoolEvent::ProbePendingPopRequest {
                language,
                request_id,
            } => self.handle_probe_pending_pop_request(ctx, language, request_id),
            PoolEvent::TickIdleWorkerEviction => self.handle_tick_idle_worker_eviction(ctx),
            PoolEvent::RuntimeEnvCreated { request, result } => {
                self.handle_runtime_env_created(ctx, request, result)
            }
            PoolEvent::PrestartRuntimeEnvCreated {
                spec,
                serialized_context,
            } => self.handle_prestart_runtime_env_created(ctx, spec, serialized_context),
            PoolEvent::CompletePopWorker {
                callback,
                worker_id,
                assignment,
                status,
                message,
            } => self.handle_complete_pop_worker(ctx, callback, worker_id, assignment, status, message),
            PoolEvent::WorkerExitReplied {
                worker_id,
                keep_alive_until,
                killed,
            } => self.handle_worker_exit_replied(ctx, worker_id, keep_alive_until, killed),
            PoolEvent::ObservePool { reply } => self.handle_observe_pool(reply),
            PoolEvent::Shutdown => ActorAction::Stop,
        }
    }

    async fn stop(mut self, _ctx: &mut ActorContext<Self>) {
        info!("stopping the worker pool\n{}", self.pool.debug_string());
        self.pool.kill_all_worker_processes();
    }
}
