use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use berth_server::actor::ActorContext;
use fastrace::local::LocalSpan;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::actor::PoolActor;
use crate::client::WorkerClient;
use crate::error::{PoolError, PoolResult};
use crate::event::PoolEvent;
use crate::id::{JobId, PopRequestId, StartupToken, WorkerId};
use crate::job::{is_runtime_env_empty, JobConfig, RuntimeEnvInfo};
use crate::launcher::{build_worker_command, WorkerCommandContext};
use crate::pool::state::{Driver, IdleWorkerEntry, Worker, WorkerProcess};
use crate::pool::{
    PopWorkerCallback, PopWorkerRequest, PopWorkerStatus, StartWorkerOutcome, WorkerAssignment,
    WorkerPool, WorkerUnfitReason,
};
use crate::process::adjust_worker_oom_score;
use crate::task::TaskSpec;
use crate::worker::{Language, WorkerType};

fn optionals_match(ask: Option<bool>, have: Option<bool>) -> bool {
    ask.is_none() || have.is_none() || ask == have
}

impl WorkerPool {
    /// The entry point for task-driven worker requests. Actor tasks must be
    /// routed to their actor's dedicated worker and never reach the pool.
    pub fn pop_worker(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        spec: TaskSpec,
        callback: PopWorkerCallback,
    ) {
        let _span = LocalSpan::enter_with_local_parent("WorkerPool::pop_worker");
        if spec.is_actor_task {
            error!("dropping pop request for an actor task");
            return;
        }
        let Some(job_id) = spec.job_id else {
            error!("dropping pop request for a task without a job");
            return;
        };
        if !self.states_by_language.contains_key(&spec.language) {
            error!(
                "dropping pop request: no worker command is configured for language {}",
                spec.language
            );
            return;
        }
        let id = match self.pop_request_ids.next() {
            Ok(id) => id,
            Err(e) => {
                error!("failed to generate pop request IDs: {e}");
                ctx.send(PoolEvent::Shutdown);
                return;
            }
        };
        let request = PopWorkerRequest {
            id,
            language: spec.language,
            worker_type: WorkerType::Task,
            job_id,
            root_detached_actor_id: spec.root_detached_actor_id,
            is_gpu: Some(spec.required_gpus > 0.0),
            is_actor_worker: Some(spec.is_actor_creation),
            runtime_env_info: spec.runtime_env_info,
            runtime_env_hash: spec.runtime_env_hash,
            dynamic_options: spec.dynamic_options,
            startup_keep_alive: None,
            callback,
        };
        self.pop_worker_request(ctx, request);
    }

    /// Serve the request from an idle worker if one fits, else start a new
    /// worker process.
    fn pop_worker_request(&mut self, ctx: &mut ActorContext<PoolActor>, request: PopWorkerRequest) {
        if let Some(worker_id) = self.find_and_pop_idle_worker(&request) {
            self.num_workers_started_from_cache += 1;
            self.metrics.inc_workers_started_from_cache();
            let assignment = WorkerAssignment::from_request(&request);
            self.pop_worker_callback_async(
                ctx,
                request.callback,
                Some(worker_id),
                Some(assignment),
                PopWorkerStatus::Ok,
                None,
            );
            return;
        }
        self.start_new_worker(ctx, request);
    }

    /// Scan the global idle queue from the back (warmest first) for a worker
    /// that fits the request, recording the reason for every miss.
    fn find_and_pop_idle_worker(&mut self, request: &PopWorkerRequest) -> Option<WorkerId> {
        let mut skip_reason_count: HashMap<WorkerUnfitReason, usize> = HashMap::new();
        let mut found = None;
        for (index, entry) in self.idle_of_all_languages.iter().enumerate().rev() {
            let Some(worker) = self.workers.get(&entry.worker_id) else {
                continue;
            };
            match self.fits_for_request(worker, request) {
                None => {
                    found = Some((index, entry.worker_id));
                    break;
                }
                Some(reason) => {
                    *skip_reason_count.entry(reason).or_default() += 1;
                    self.metrics.inc_cached_workers_skipped(reason);
                }
            }
        }
        let Some((index, worker_id)) = found else {
            debug!("no cached worker, cached workers skipped due to {skip_reason_count:?}");
            return None;
        };
        self.idle_of_all_languages.remove(index);
        if let Some(state) = self.states_by_language.get_mut(&request.language) {
            state.idle.remove(&worker_id);
        }
        Some(worker_id)
    }

    /// The matching predicate between an idle worker and a pending request.
    /// Returns the reason the worker does not fit, or `None` on a fit.
    pub(crate) fn fits_for_request(
        &self,
        worker: &Worker,
        request: &PopWorkerRequest,
    ) -> Option<WorkerUnfitReason> {
        if worker.dead {
            return Some(WorkerUnfitReason::Other);
        }
        // Workers with an in-flight exit request are on their way out.
        if self.pending_exit_workers.contains(&worker.id) {
            return Some(WorkerUnfitReason::Other);
        }
        if worker.language != request.language {
            return Some(WorkerUnfitReason::Other);
        }
        if worker.worker_type != request.worker_type {
            return Some(WorkerUnfitReason::Other);
        }
        // A request rooted in a detached actor carries the job of the job
        // that created the actor, so the job check below still applies when
        // the worker has no detached actor root.
        if let (Some(ask), Some(have)) = (request.root_detached_actor_id, worker.root_detached_actor_id)
        {
            if ask != have {
                return Some(WorkerUnfitReason::RootMismatch);
            }
        }
        if worker.job_id.is_some_and(|job_id| job_id != request.job_id) {
            return Some(WorkerUnfitReason::RootMismatch);
        }
        if !optionals_match(request.is_gpu, worker.is_gpu) {
            return Some(WorkerUnfitReason::Other);
        }
        if !optionals_match(request.is_actor_worker, worker.is_actor_worker) {
            return Some(WorkerUnfitReason::Other);
        }
        // Even a request without a runtime env cannot reuse a worker that
        // has one; the task expects the base environment.
        if worker.runtime_env_hash != request.runtime_env_hash {
            return Some(WorkerUnfitReason::RuntimeEnvMismatch);
        }
        if self.lookup_worker_dynamic_options(worker.startup_token) != request.dynamic_options {
            return Some(WorkerUnfitReason::DynamicOptionsMismatch);
        }
        None
    }

    pub(crate) fn lookup_worker_dynamic_options(&self, startup_token: StartupToken) -> &[String] {
        for state in self.states_by_language.values() {
            if let Some(worker_process) = state.worker_processes.get(&startup_token) {
                return &worker_process.dynamic_options;
            }
        }
        &[]
    }

    /// Create the runtime environment if the request has one, then start a
    /// worker process for the request.
    pub(crate) fn start_new_worker(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        request: PopWorkerRequest,
    ) {
        if !request.runtime_env_info.is_empty() {
            let agent = Arc::clone(&self.runtime_env_agent);
            let handle = ctx.handle().clone();
            let job_id = request.job_id;
            let serialized_runtime_env = request.runtime_env_info.serialized_runtime_env.clone();
            let config = request.runtime_env_info.config.clone();
            ctx.spawn(async move {
                let result = agent
                    .get_or_create(Some(job_id), serialized_runtime_env, config)
                    .await;
                let _ = handle
                    .send(PoolEvent::RuntimeEnvCreated { request, result })
                    .await;
            });
            return;
        }
        self.start_worker_for_request(ctx, request, String::new());
    }

    pub(crate) fn handle_runtime_env_created(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        request: PopWorkerRequest,
        result: Result<String, String>,
    ) {
        match result {
            Ok(serialized_context) => {
                self.start_worker_for_request(ctx, request, serialized_context);
            }
            Err(message) => {
                self.process_failed_runtime_env_setup_failed += 1;
                warn!(
                    "could not create a runtime environment for job {}: {message}",
                    request.job_id
                );
                let _ = (request.callback)(
                    None,
                    PopWorkerStatus::RuntimeEnvCreationFailed,
                    Some(message),
                );
            }
        }
    }

    fn start_worker_for_request(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        request: PopWorkerRequest,
        serialized_runtime_env_context: String,
    ) {
        let outcome = self.start_worker_process(
            ctx,
            request.language,
            request.worker_type,
            Some(request.job_id),
            &request.dynamic_options,
            request.runtime_env_hash,
            &serialized_runtime_env_context,
            request.runtime_env_info.clone(),
            request.startup_keep_alive,
        );
        match outcome {
            StartWorkerOutcome::Started(_) => {
                self.warn_about_size();
                let language = request.language;
                let request_id = request.id;
                if let Some(state) = self.states_by_language.get_mut(&language) {
                    state.pending_registration_requests.push_back(request);
                }
                ctx.send_with_delay(
                    PoolEvent::ProbePendingPopRequest {
                        language,
                        request_id,
                    },
                    self.options.worker_register_timeout,
                );
            }
            StartWorkerOutcome::Rejected(PopWorkerStatus::TooManyStartingWorkerProcesses) => {
                self.delete_runtime_env_if_possible(
                    ctx,
                    request.runtime_env_info.serialized_runtime_env.clone(),
                );
                if let Some(state) = self.states_by_language.get_mut(&request.language) {
                    state.pending_start_requests.push_back(request);
                }
            }
            StartWorkerOutcome::Rejected(status) => {
                self.delete_runtime_env_if_possible(
                    ctx,
                    request.runtime_env_info.serialized_runtime_env.clone(),
                );
                self.pop_worker_callback_async(ctx, request.callback, None, None, status, None);
            }
            StartWorkerOutcome::Aborted => {}
        }
    }

    /// Spawn one worker process, subject to the per-language startup
    /// concurrency limit, and record it in the worker table.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_worker_process(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        language: Language,
        worker_type: WorkerType,
        job_id: Option<JobId>,
        dynamic_options: &[String],
        runtime_env_hash: u64,
        serialized_runtime_env_context: &str,
        runtime_env_info: RuntimeEnvInfo,
        startup_keep_alive: Option<Duration>,
    ) -> StartWorkerOutcome {
        let _span = LocalSpan::enter_with_local_parent("WorkerPool::start_worker_process");
        let job_config = match job_id {
            Some(job_id) => match self.all_jobs.get(&job_id) {
                Some(config) => Some(config),
                None => {
                    debug!("job config of job {job_id} is not local yet");
                    self.process_failed_job_config_missing += 1;
                    return StartWorkerOutcome::Rejected(PopWorkerStatus::JobConfigMissing);
                }
            },
            None => None,
        };
        let Some(state) = self.states_by_language.get(&language) else {
            error!("no worker command is configured for language {language}");
            return StartWorkerOutcome::Aborted;
        };

        let starting_workers = state.num_pending_registration(worker_type);
        if starting_workers >= self.options.maximum_startup_concurrency {
            debug!(
                "worker not started: {starting_workers} {language} processes of type \
                 {worker_type} are pending registration, at the startup concurrency limit {}",
                self.options.maximum_startup_concurrency
            );
            self.process_failed_rate_limited += 1;
            return StartWorkerOutcome::Rejected(PopWorkerStatus::TooManyStartingWorkerProcesses);
        }

        let Some(node_manager_port) = self.node_manager_port else {
            error!("cannot start a worker process before the node manager server is ready");
            return StartWorkerOutcome::Aborted;
        };
        let startup_token = match self.startup_tokens.next() {
            Ok(token) => token,
            Err(e) => {
                error!("failed to generate startup tokens: {e}");
                ctx.send(PoolEvent::Shutdown);
                return StartWorkerOutcome::Aborted;
            }
        };
        let (argv, env) = build_worker_command(
            language,
            job_config,
            worker_type,
            job_id,
            dynamic_options,
            runtime_env_hash,
            serialized_runtime_env_context,
            &WorkerCommandContext {
                worker_command: &state.worker_command,
                options: &self.options,
                node_manager_port,
                startup_token,
                agent_pid: std::process::id(),
            },
        );

        let started_at = Instant::now();
        let handle = match self.spawner.spawn(&argv, &env) {
            Ok(handle) => handle,
            Err(e) => {
                if e.raw_os_error() == Some(libc::EMFILE) {
                    error!(
                        "too many open files while starting a worker process; raise the file \
                         descriptor limit and restart the agent: {e}"
                    );
                } else {
                    error!("failed to start worker process: {e}");
                }
                ctx.send(PoolEvent::Shutdown);
                return StartWorkerOutcome::Aborted;
            }
        };
        self.num_workers_started += 1;
        self.metrics.inc_workers_started();
        info!(
            "started {language} worker process with pid {}, startup token {startup_token}",
            handle.pid()
        );
        if !worker_type.is_io() {
            adjust_worker_oom_score(handle.pid(), self.options.worker_oom_score_adjustment);
        }
        ctx.send_with_delay(
            PoolEvent::ProbeStartingWorkerProcess {
                language,
                startup_token,
            },
            self.options.worker_register_timeout,
        );
        if let Some(state) = self.states_by_language.get_mut(&language) {
            state.worker_processes.insert(
                startup_token,
                WorkerProcess {
                    worker_type,
                    handle,
                    started_at,
                    is_pending_registration: true,
                    runtime_env_info,
                    dynamic_options: dynamic_options.to_vec(),
                    startup_keep_alive,
                },
            );
            if worker_type.is_io() {
                state.io_state_mut(worker_type).num_starting += 1;
            }
        }
        StartWorkerOutcome::Started(startup_token)
    }

    /// Handle a worker registration RPC. The reply carries the port the
    /// worker should listen on. An out-of-ports failure leaves the pool
    /// state untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn register_worker(
        &mut self,
        worker_id: WorkerId,
        language: Language,
        worker_type: WorkerType,
        pid: u32,
        startup_token: StartupToken,
        runtime_env_hash: u64,
        client: Arc<dyn WorkerClient>,
    ) -> PoolResult<u16> {
        let _span = LocalSpan::enter_with_local_parent("WorkerPool::register_worker");
        let Some(state) = self.states_by_language.get(&language) else {
            return Err(PoolError::InvalidArgument(format!(
                "unsupported language: {language}"
            )));
        };
        let Some(worker_process) = state.worker_processes.get(&startup_token) else {
            warn!("received a register request from an unknown startup token: {startup_token}");
            return Err(PoolError::InvalidArgument("Unknown worker".to_string()));
        };
        let register_time = worker_process.started_at.elapsed();
        let port = self.port_allocator.next_free()?;
        self.metrics
            .record_register_time(register_time.as_secs_f64() * 1e3);
        debug!(
            "registering worker {worker_id} with pid {pid}, port {port}, register cost \
             {}ms, startup token {startup_token}",
            register_time.as_millis()
        );
        let handle = self.spawner.attach(pid);
        self.workers.insert(
            worker_id,
            Worker {
                id: worker_id,
                language,
                worker_type,
                startup_token,
                handle,
                client,
                port,
                runtime_env_hash,
                job_id: None,
                root_detached_actor_id: None,
                is_gpu: None,
                is_actor_worker: None,
                assigned_task_at: None,
                dead: false,
            },
        );
        if let Some(state) = self.states_by_language.get_mut(&language) {
            state.registered_workers.insert(worker_id);
        }
        Ok(port)
    }

    /// The final step of the startup handshake. Clears the pending
    /// registration flag, which frees startup capacity, and settles I/O
    /// sub-pool accounting.
    pub fn on_worker_started(&mut self, ctx: &mut ActorContext<PoolActor>, worker_id: WorkerId) {
        let Some(worker) = self.workers.get(&worker_id) else {
            warn!("started worker {worker_id} is not registered");
            return;
        };
        let language = worker.language;
        let worker_type = worker.worker_type;
        let startup_token = worker.startup_token;

        let mut registration_cleared = false;
        if let Some(state) = self.states_by_language.get_mut(&language) {
            if let Some(worker_process) = state.worker_processes.get_mut(&startup_token) {
                worker_process.is_pending_registration = false;
                registration_cleared = true;
            }
            if worker_type.is_io() {
                let io = state.io_state_mut(worker_type);
                io.started.insert(worker_id);
                io.num_starting = io.num_starting.saturating_sub(1);
            }
        }
        if registration_cleared {
            // We may have slots to start more I/O workers now.
            self.try_start_io_workers(ctx, language);
        }

        // Finish the first driver's registration once enough prestarted
        // workers have come up.
        if worker_type == WorkerType::Task && language == Language::Python {
            self.first_job_registered_worker_count += 1;
            if self.first_job_registered_worker_count == self.first_job_driver_wait_num_workers {
                if let Some((reply, port)) = self.deferred_first_driver_reply.take() {
                    let _ = reply.send(Ok(port));
                }
            }
        }
    }

    /// Handle a driver registration. For dynamic-language drivers this may
    /// prestart workers and defer the reply until they have started.
    pub fn register_driver(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        worker_id: WorkerId,
        language: Language,
        job_id: JobId,
        job_config: JobConfig,
        reply: oneshot::Sender<PoolResult<u16>>,
    ) {
        let port = match self.port_allocator.next_free() {
            Ok(port) => port,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.drivers.insert(
            worker_id,
            Driver {
                id: worker_id,
                language,
                job_id,
                port,
            },
        );
        if let Some(state) = self.states_by_language.get_mut(&language) {
            state.registered_drivers.insert(worker_id);
        }
        self.handle_job_started(ctx, job_id, job_config);

        if language != Language::Python {
            let _ = reply.send(Ok(port));
            return;
        }
        if !self.first_job_registered
            && self.options.prestart_worker_first_driver
            && !self.options.enable_worker_prestart
        {
            debug!(
                "prestarting {} workers for the first driver",
                self.options.num_prestart_workers
            );
            self.prestart_workers_internal(
                ctx,
                TaskSpec::warmup(),
                self.options.num_prestart_workers as i64,
            );
        }
        self.execute_on_prestart_workers_started(reply, port);
    }

    fn execute_on_prestart_workers_started(
        &mut self,
        reply: oneshot::Sender<PoolResult<u16>>,
        port: u16,
    ) {
        let prestart =
            self.options.prestart_worker_first_driver || self.options.enable_worker_prestart;
        if self.first_job_registered
            || self.first_job_registered_worker_count >= self.first_job_driver_wait_num_workers
            || !prestart
        {
            let _ = reply.send(Ok(port));
            return;
        }
        self.first_job_registered = true;
        debug_assert!(self.deferred_first_driver_reply.is_none());
        self.deferred_first_driver_reply = Some((reply, port));
    }

    /// A worker becomes available: match it against the pending request
    /// queues first, else put it in the idle pool.
    pub fn push_worker(&mut self, ctx: &mut ActorContext<PoolActor>, worker_id: WorkerId) {
        let Some(worker) = self.workers.get(&worker_id) else {
            warn!("pushed worker {worker_id} is not registered");
            return;
        };
        let language = worker.language;
        let worker_type = worker.worker_type;
        let startup_token = worker.startup_token;
        let is_cold = worker.assigned_task_at.is_none();

        let matched = match self.states_by_language.get(&language) {
            Some(state) => {
                let position = state
                    .pending_registration_requests
                    .iter()
                    .position(|request| self.fits_for_request(worker, request).is_none());
                match position {
                    Some(index) => Some((true, index)),
                    None => state
                        .pending_start_requests
                        .iter()
                        .position(|request| self.fits_for_request(worker, request).is_none())
                        .map(|index| (false, index)),
                }
            }
            None => None,
        };

        if let Some((from_registration, index)) = matched {
            let request = self.states_by_language.get_mut(&language).and_then(|state| {
                if from_registration {
                    state.pending_registration_requests.remove(index)
                } else {
                    state.pending_start_requests.remove(index)
                }
            });
            if let Some(request) = request {
                let assignment = WorkerAssignment::from_request(&request);
                self.pop_worker_callback_async(
                    ctx,
                    request.callback,
                    Some(worker_id),
                    Some(assignment),
                    PopWorkerStatus::Ok,
                    None,
                );
            }
        } else {
            let now = Instant::now();
            let mut keep_alive_until = now + self.options.idle_worker_keep_alive;
            if is_cold {
                // Respect the startup keep-alive of a newly registered
                // worker, and queue it at the front: a worker that never
                // held a task is not warmed up, so it goes first when
                // choosing idle workers to kill.
                if let Some(state) = self.states_by_language.get(&language) {
                    if let Some(worker_process) = state.worker_processes.get(&startup_token) {
                        if let Some(startup_keep_alive) = worker_process.startup_keep_alive {
                            keep_alive_until = keep_alive_until.max(now + startup_keep_alive);
                        }
                    }
                }
                self.idle_of_all_languages.push_front(IdleWorkerEntry {
                    worker_id,
                    keep_alive_until,
                });
            } else {
                self.idle_of_all_languages.push_back(IdleWorkerEntry {
                    worker_id,
                    keep_alive_until,
                });
            }
            if let Some(state) = self.states_by_language.get_mut(&language) {
                state.idle.insert(worker_id);
            }
        }

        // We either have an idle worker or a slot to start a new one.
        if worker_type == WorkerType::Task {
            self.try_pending_start_requests(ctx, language);
        }
    }

    /// Atomically drain the pending-start queue and resubmit every request.
    /// Rate-limited requests re-queue at the tail, so the drain terminates.
    pub(crate) fn try_pending_start_requests(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        language: Language,
    ) {
        let Some(state) = self.states_by_language.get_mut(&language) else {
            return;
        };
        if state.pending_start_requests.is_empty() {
            return;
        }
        let requests = std::mem::take(&mut state.pending_start_requests);
        for request in requests {
            self.start_new_worker(ctx, request);
        }
    }

    /// Registration-timeout timer for a spawned process.
    pub(crate) fn probe_starting_worker_process(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        language: Language,
        startup_token: StartupToken,
    ) {
        let Some(state) = self.states_by_language.get_mut(&language) else {
            return;
        };
        let Some(worker_process) = state.worker_processes.get(&startup_token) else {
            return;
        };
        if !worker_process.is_pending_registration {
            return;
        }
        let alive = worker_process.handle.is_alive();
        error!(
            "worker process {} (startup token {startup_token}) has not registered within the \
             timeout; {}",
            worker_process.handle.pid(),
            if alive {
                "the process is still alive, probably hanging during start"
            } else {
                "the process is dead, probably it crashed during start"
            }
        );
        if alive {
            worker_process.handle.kill();
        }
        let worker_type = worker_process.worker_type;
        let serialized_runtime_env = worker_process
            .runtime_env_info
            .serialized_runtime_env
            .clone();
        self.process_failed_pending_registration += 1;
        state.worker_processes.remove(&startup_token);
        if worker_type.is_io() {
            let io = state.io_state_mut(worker_type);
            io.num_starting = io.num_starting.saturating_sub(1);
        }
        self.delete_runtime_env_if_possible(ctx, serialized_runtime_env);
        // We may have capacity to start more workers now.
        self.try_start_io_workers(ctx, language);
        if worker_type == WorkerType::Task {
            self.try_pending_start_requests(ctx, language);
        }
    }

    /// Registration-wait timer for a pop request. The spawned process may
    /// still register later; it is then recycled into the idle pool.
    pub(crate) fn probe_pending_pop_request(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        language: Language,
        request_id: PopRequestId,
    ) {
        let Some(state) = self.states_by_language.get_mut(&language) else {
            return;
        };
        let Some(index) = state
            .pending_registration_requests
            .iter()
            .position(|request| request.id == request_id)
        else {
            return;
        };
        let Some(request) = state.pending_registration_requests.remove(index) else {
            return;
        };
        self.pop_worker_callback_async(
            ctx,
            request.callback,
            None,
            None,
            PopWorkerStatus::WorkerPendingRegistration,
            None,
        );
    }

    /// Defer a pop callback by one event loop tick so the caller does not
    /// observe mid-mutation state.
    pub(crate) fn pop_worker_callback_async(
        &self,
        ctx: &mut ActorContext<PoolActor>,
        callback: PopWorkerCallback,
        worker_id: Option<WorkerId>,
        assignment: Option<WorkerAssignment>,
        status: PopWorkerStatus,
        message: Option<String>,
    ) {
        ctx.send(PoolEvent::CompletePopWorker {
            callback,
            worker_id,
            assignment,
            status,
            message,
        });
    }

    /// Invoke a pop callback. A worker handed to a request whose job has
    /// finished in the meantime is returned to the pool instead, so the
    /// one-time kill of leased workers for that job cannot leak it. An
    /// unused worker is re-pushed.
    pub(crate) fn complete_pop_worker(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        callback: PopWorkerCallback,
        worker_id: Option<WorkerId>,
        assignment: Option<WorkerAssignment>,
        status: PopWorkerStatus,
        message: Option<String>,
    ) {
        if let (Some(worker_id), Some(assignment)) = (worker_id, &assignment) {
            if status == PopWorkerStatus::Ok
                && self.finished_jobs.contains(&assignment.job_id)
                && assignment.root_detached_actor_id.is_none()
            {
                let _ = callback(None, PopWorkerStatus::JobFinished, None);
                self.push_worker(ctx, worker_id);
                return;
            }
        }
        let leased = worker_id.and_then(|id| self.workers.get(&id)).map(Worker::to_leased);
        if worker_id.is_some() && leased.is_none() {
            // The worker disconnected between the dispatch decision and the
            // callback.
            warn!("dispatched worker disconnected before the pop callback ran");
            let _ = callback(None, PopWorkerStatus::WorkerPendingRegistration, None);
            return;
        }
        let used = callback(leased, status, message);
        let Some(worker_id) = worker_id else {
            return;
        };
        if used {
            if let Some(assignment) = assignment {
                self.bind_assignment(worker_id, assignment);
            }
        } else {
            // The worker was not used; restore it to the pool. It may fit
            // another pending request.
            self.push_worker(ctx, worker_id);
        }
    }

    /// Record the accepted request's attributes on the worker. Absent
    /// tri-state values stay absent so the worker remains reusable by
    /// requests that do not constrain them.
    fn bind_assignment(&mut self, worker_id: WorkerId, assignment: WorkerAssignment) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        worker.job_id = Some(assignment.job_id);
        worker.root_detached_actor_id = worker
            .root_detached_actor_id
            .or(assignment.root_detached_actor_id);
        worker.is_gpu = worker.is_gpu.or(assignment.is_gpu);
        worker.is_actor_worker = worker.is_actor_worker.or(assignment.is_actor_worker);
        worker.assigned_task_at = Some(Instant::now());
    }

    /// Best-effort prestart for a task submission with a backlog, sized by
    /// the CPUs still available on the node.
    pub fn prestart_workers(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        spec: TaskSpec,
        backlog_size: i64,
    ) {
        let num_available_cpus = self.resources.available_cpus();
        debug!(
            "prestart request with backlog {backlog_size} and {num_available_cpus} available CPUs"
        );
        if (spec.is_actor_creation && !spec.dynamic_options.is_empty())
            || spec.language != Language::Python
        {
            return;
        }
        let Some(state) = self.states_by_language.get(&Language::Python) else {
            return;
        };
        let mut num_usable_workers = state.idle.len() as i64;
        num_usable_workers += state
            .worker_processes
            .values()
            .filter(|p| p.is_pending_registration)
            .count() as i64;
        let desired_usable_workers = num_available_cpus.min(backlog_size);
        if num_usable_workers < desired_usable_workers {
            let num_needed = desired_usable_workers - num_usable_workers;
            debug!(
                "prestarting {num_needed} workers given task backlog size {backlog_size} and \
                 {num_available_cpus} available CPUs"
            );
            self.prestart_workers_internal(ctx, spec, num_needed);
        }
    }

    pub(crate) fn prestart_workers_internal(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        spec: TaskSpec,
        num_needed: i64,
    ) {
        for _ in 0..num_needed {
            if spec.runtime_env_info.is_empty() {
                let _ = self.start_worker_process(
                    ctx,
                    spec.language,
                    WorkerType::Task,
                    spec.job_id,
                    &[],
                    0,
                    "",
                    RuntimeEnvInfo::default(),
                    None,
                );
                continue;
            }
            let agent = Arc::clone(&self.runtime_env_agent);
            let handle = ctx.handle().clone();
            let spec = spec.clone();
            ctx.spawn(async move {
                let result = agent
                    .get_or_create(
                        spec.job_id,
                        spec.runtime_env_info.serialized_runtime_env.clone(),
                        spec.runtime_env_info.config.clone(),
                    )
                    .await;
                match result {
                    Ok(serialized_context) => {
                        let _ = handle
                            .send(PoolEvent::PrestartRuntimeEnvCreated {
                                spec,
                                serialized_context,
                            })
                            .await;
                    }
                    Err(message) => {
                        error!("failed to create runtime env for prestart: {message}");
                    }
                }
            });
        }
    }

    pub(crate) fn handle_prestart_runtime_env_created(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        spec: TaskSpec,
        serialized_context: String,
    ) {
        let _ = self.start_worker_process(
            ctx,
            spec.language,
            WorkerType::Task,
            spec.job_id,
            &[],
            spec.runtime_env_hash,
            &serialized_context,
            spec.runtime_env_info.clone(),
            None,
        );
    }

    /// Idempotent job-started hook. Eager runtime environment installation
    /// takes a reference that the job-finished hook releases.
    pub fn handle_job_started(
        &mut self,
        ctx: &mut ActorContext<PoolActor>,
        job_id: JobId,
        job_config: JobConfig,
    ) {
        if self.all_jobs.contains_key(&job_id) {
            info!("job {job_id} already started in the worker pool");
            return;
        }
        if job_config.needs_eager_runtime_env_install() {
            info!("eagerly installing runtime environment for job {job_id}");
            let agent = Arc::clone(&self.runtime_env_agent);
            let serialized_runtime_env =
                job_config.runtime_env_info.serialized_runtime_env.clone();
            let config = job_config.runtime_env_info.config.clone();
            ctx.spawn(async move {
                match agent
                    .get_or_create(Some(job_id), serialized_runtime_env, config)
                    .await
                {
                    Ok(_) => {
                        info!("eager runtime environment creation succeeded for job {job_id}");
                    }
                    Err(message) => {
                        warn!(
                            "could not eagerly create a runtime environment for job {job_id}: \
                             {message}"
                        );
                    }
                }
            });
        }
        self.all_jobs.insert(job_id, job_config);
    }

    pub fn handle_job_finished(&mut self, ctx: &mut ActorContext<PoolActor>, job_id: JobId) {
        // The job stays in `all_jobs`: callbacks that raced with the job
        // termination may still look up its config.
        let Some(job_config) = self.all_jobs.get(&job_id) else {
            warn!("finished job {job_id} is unknown to the worker pool");
            return;
        };
        if job_config.needs_eager_runtime_env_install() {
            let serialized_runtime_env =
                job_config.runtime_env_info.serialized_runtime_env.clone();
            self.delete_runtime_env_if_possible(ctx, serialized_runtime_env);
        }
        self.finished_jobs.insert(job_id);
    }

    /// Full cleanup when a worker connection goes away.
    pub fn disconnect_worker(&mut self, ctx: &mut ActorContext<PoolActor>, worker_id: WorkerId) {
        let Some(worker) = self.workers.remove(&worker_id) else {
            warn!("disconnected worker {worker_id} is not registered");
            return;
        };
        self.port_allocator.release(worker.port);
        let language = worker.language;
        let worker_type = worker.worker_type;
        let startup_token = worker.startup_token;

        let mut serialized_runtime_env = None;
        let mut capacity_freed = false;
        if let Some(state) = self.states_by_language.get_mut(&language) {
            if let Some(worker_process) = state.worker_processes.get_mut(&startup_token) {
                if worker_process.is_pending_registration {
                    // The worker registered but never completed the startup
                    // handshake.
                    worker_process.is_pending_registration = false;
                    capacity_freed = worker_type == WorkerType::Task;
                }
                serialized_runtime_env = Some(
                    worker_process
                        .runtime_env_info
                        .serialized_runtime_env
                        .clone(),
                );
                state.worker_processes.remove(&startup_token);
            }
            state.registered_workers.remove(&worker_id);
            if worker_type.is_io() {
                let io = state.io_state_mut(worker_type);
                if !io.started.remove(&worker_id) {
                    io.num_starting = io.num_starting.saturating_sub(1);
                }
                io.idle.remove(&worker_id);
            } else {
                state.idle.remove(&worker_id);
            }
        }
        if let Some(serialized_runtime_env) = serialized_runtime_env {
            self.delete_runtime_env_if_possible(ctx, serialized_runtime_env);
        }
        if !worker_type.is_io() {
            self.idle_of_all_languages
                .retain(|entry| entry.worker_id != worker_id);
        }
        if capacity_freed {
            self.try_pending_start_requests(ctx, language);
        }
    }

    pub fn disconnect_driver(&mut self, worker_id: WorkerId) {
        let Some(driver) = self.drivers.remove(&worker_id) else {
            warn!("disconnected driver {worker_id} is not registered");
            return;
        };
        if let Some(state) = self.states_by_language.get_mut(&driver.language) {
            state.registered_drivers.remove(&worker_id);
        }
        self.port_allocator.release(driver.port);
    }

    /// Release one runtime environment reference, asynchronously and on a
    /// best-effort basis. Empty environments hold no reference.
    pub(crate) fn delete_runtime_env_if_possible(
        &self,
        ctx: &mut ActorContext<PoolActor>,
        serialized_runtime_env: String,
    ) {
        if is_runtime_env_empty(&serialized_runtime_env) {
            return;
        }
        let agent = Arc::clone(&self.runtime_env_agent);
        ctx.spawn(async move {
            if !agent.delete_if_possible(serialized_runtime_env).await {
                error!("failed to delete runtime env");
            }
        });
    }

    /// Warn when a language's pool grows past successive multiples of the
    /// startup concurrency, which usually indicates a large number of actors
    /// or tasks blocked on remote results.
    pub(crate) fn warn_about_size(&mut self) {
        let max_io_workers = self.options.max_io_workers;
        let node_id = &self.options.node_id;
        let node_ip = &self.options.node_ip;
        for (language, state) in self.states_by_language.iter_mut() {
            let mut num_started_or_registered = state.registered_workers.len() as i64;
            num_started_or_registered += state
                .worker_processes
                .values()
                .filter(|p| !p.is_pending_registration)
                .count() as i64;
            // Don't count I/O workers towards the warning threshold.
            num_started_or_registered -= (max_io_workers * 2) as i64;
            let multiple = num_started_or_registered / state.multiple_for_warning as i64;
            if multiple >= 4 && multiple > state.last_warning_multiple {
                state.last_warning_multiple = multiple;
                warn!(
                    "{num_started_or_registered} {language} worker processes have been started \
                     on node {node_id} with address {node_ip}; this may be caused by a large \
                     number of actors, or by tasks blocked waiting for remote results"
                );
            }
        }
    }
}

impl WorkerAssignment {
    fn from_request(request: &PopWorkerRequest) -> Self {
        Self {
            job_id: request.job_id,
            root_detached_actor_id: request.root_detached_actor_id,
            is_gpu: request.is_gpu,
            is_actor_worker: request.is_actor_worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optionals_match_treats_absent_as_wildcard() {
        assert!(optionals_match(None, None));
        assert!(optionals_match(None, Some(true)));
        assert!(optionals_match(Some(false), None));
        assert!(optionals_match(Some(true), Some(true)));
        assert!(!optionals_match(Some(true), Some(false)));
    }
}
