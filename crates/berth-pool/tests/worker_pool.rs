use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_common::config::AppConfig;
use berth_pool::actor::{PoolActor, PoolActorOptions};
use berth_pool::client::WorkerClient;
use berth_pool::error::PoolResult;
use berth_pool::event::PoolEvent;
use berth_pool::id::{JobId, StartupToken, WorkerId};
use berth_pool::job::{JobConfig, RuntimeEnvConfig, RuntimeEnvInfo};
use berth_pool::pool::{
    IoWorkerCallback, LanguagePoolSnapshot, PoolSnapshot, PopWorkerCallback, PopWorkerStatus,
    WorkerPoolOptions,
};
use berth_pool::ports::PortProbe;
use berth_pool::process::{ProcessEnvironment, ProcessHandle, ProcessSpawner};
use berth_pool::resources::NodeResources;
use berth_pool::runtime_env::RuntimeEnvAgent;
use berth_pool::task::TaskSpec;
use berth_pool::worker::{Language, LeasedWorker, WorkerType};
use berth_server::actor::{ActorHandle, ActorSystem};
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
struct SpawnedProcess {
    pid: u32,
    argv: Vec<String>,
    alive: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl SpawnedProcess {
    fn startup_token(&self) -> StartupToken {
        let token = self
            .argv
            .iter()
            .find_map(|arg| arg.strip_prefix("--startup-token="))
            .and_then(|value| value.parse::<u64>().ok())
            .expect("worker command has no startup token");
        StartupToken::from(token)
    }

    fn runtime_env_hash(&self) -> u64 {
        self.argv
            .iter()
            .find_map(|arg| arg.strip_prefix("--runtime-env-hash="))
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct MockHandle {
    pid: u32,
    alive: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl ProcessHandle for MockHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockSpawner {
    next_pid: AtomicU32,
    processes: Mutex<Vec<SpawnedProcess>>,
}

impl MockSpawner {
    fn spawned(&self) -> Vec<SpawnedProcess> {
        self.processes.lock().unwrap().clone()
    }

    fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(
        &self,
        argv: &[String],
        _env: &ProcessEnvironment,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        let killed = Arc::new(AtomicBool::new(false));
        self.processes.lock().unwrap().push(SpawnedProcess {
            pid,
            argv: argv.to_vec(),
            alive: Arc::clone(&alive),
            killed: Arc::clone(&killed),
        });
        Ok(Box::new(MockHandle { pid, alive, killed }))
    }

    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
        let process = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.pid == pid)
            .cloned();
        match process {
            Some(p) => Box::new(MockHandle {
                pid,
                alive: p.alive,
                killed: p.killed,
            }),
            None => Box::new(MockHandle {
                pid,
                alive: Arc::new(AtomicBool::new(true)),
                killed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }
}

#[derive(Default)]
struct MockRuntimeEnvAgent {
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl MockRuntimeEnvAgent {
    fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl RuntimeEnvAgent for MockRuntimeEnvAgent {
    async fn get_or_create(
        &self,
        _job_id: Option<JobId>,
        serialized_runtime_env: String,
        _config: RuntimeEnvConfig,
    ) -> Result<String, String> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(message);
        }
        self.created
            .lock()
            .unwrap()
            .push(serialized_runtime_env.clone());
        Ok(format!("context:{serialized_runtime_env}"))
    }

    async fn delete_if_possible(&self, serialized_runtime_env: String) -> bool {
        self.deleted.lock().unwrap().push(serialized_runtime_env);
        true
    }
}

struct MockWorkerClient {
    exit_success: bool,
    exits: Mutex<Vec<bool>>,
}

impl MockWorkerClient {
    fn new(exit_success: bool) -> Arc<Self> {
        Arc::new(Self {
            exit_success,
            exits: Mutex::new(vec![]),
        })
    }

    fn exits(&self) -> Vec<bool> {
        self.exits.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl WorkerClient for MockWorkerClient {
    async fn exit(&self, force_exit: bool) -> PoolResult<bool> {
        self.exits.lock().unwrap().push(force_exit);
        Ok(self.exit_success)
    }
}

struct FixedResources {
    cpus: AtomicI64,
}

impl NodeResources for FixedResources {
    fn available_cpus(&self) -> i64 {
        self.cpus.load(Ordering::SeqCst)
    }
}

struct FreePortProbe;

impl PortProbe for FreePortProbe {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

struct TestPool {
    handle: ActorHandle<PoolActor>,
    spawner: Arc<MockSpawner>,
    agent: Arc<MockRuntimeEnvAgent>,
    cpus: Arc<FixedResources>,
    _system: ActorSystem,
}

fn test_config(maximum_startup_concurrency: usize) -> AppConfig {
    let mut config = AppConfig::load().unwrap();
    config.node.node_id = "testnode".to_string();
    config.pool.maximum_startup_concurrency = maximum_startup_concurrency;
    config.pool.num_prestart_workers = 0;
    config.pool.enable_worker_prestart = false;
    config.pool.prestart_worker_first_driver = false;
    config.pool.worker_register_timeout_secs = 30;
    config.pool.idle_worker_keep_alive_ms = 1000;
    // Eviction sweeps are driven explicitly by the tests.
    config.pool.kill_idle_workers_interval_ms = 0;
    config.pool.max_io_workers = 2;
    config.pool.min_worker_port = 0;
    config.pool.max_worker_port = 0;
    config
}

async fn start_pool(config: AppConfig) -> TestPool {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = WorkerPoolOptions::try_from(&config).unwrap();
    let spawner = Arc::new(MockSpawner::default());
    let agent = Arc::new(MockRuntimeEnvAgent::default());
    let cpus = Arc::new(FixedResources {
        cpus: AtomicI64::new(0),
    });
    let mut system = ActorSystem::new();
    let handle = system.spawn::<PoolActor>(PoolActorOptions {
        options,
        spawner: Arc::clone(&spawner) as Arc<dyn ProcessSpawner>,
        runtime_env_agent: Arc::clone(&agent) as Arc<dyn RuntimeEnvAgent>,
        resources: Arc::clone(&cpus) as Arc<dyn NodeResources>,
        port_probe: Box::new(FreePortProbe),
    });
    handle
        .send(PoolEvent::ServerReady { port: 7100 })
        .await
        .unwrap();
    TestPool {
        handle,
        spawner,
        agent,
        cpus,
        _system: system,
    }
}

/// Let spawned tasks and queued events drain; the paused clock auto-advances.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn observe(pool: &TestPool) -> PoolSnapshot {
    let (tx, rx) = oneshot::channel();
    pool.handle
        .send(PoolEvent::ObservePool { reply: tx })
        .await
        .unwrap();
    rx.await.unwrap()
}

fn python(snapshot: &PoolSnapshot) -> &LanguagePoolSnapshot {
    snapshot
        .languages
        .iter()
        .find(|l| l.language == Language::Python)
        .unwrap()
}

type PopResult = (Option<LeasedWorker>, PopWorkerStatus, Option<String>);

fn pop_callback(used: bool) -> (PopWorkerCallback, mpsc::UnboundedReceiver<PopResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: PopWorkerCallback = Box::new(move |worker, status, message| {
        let _ = tx.send((worker, status, message));
        used
    });
    (callback, rx)
}

fn io_callback() -> (IoWorkerCallback, mpsc::UnboundedReceiver<LeasedWorker>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: IoWorkerCallback = Box::new(move |worker| {
        let _ = tx.send(worker);
    });
    (callback, rx)
}

fn task_spec(job_id: u64, runtime_env_hash: u64) -> TaskSpec {
    TaskSpec {
        language: Language::Python,
        job_id: Some(JobId::from(job_id)),
        is_actor_creation: false,
        is_actor_task: false,
        required_gpus: 0.0,
        root_detached_actor_id: None,
        runtime_env_info: RuntimeEnvInfo::default(),
        runtime_env_hash,
        dynamic_options: vec![],
    }
}

fn task_spec_with_env(job_id: u64, runtime_env_hash: u64, serialized_runtime_env: &str) -> TaskSpec {
    TaskSpec {
        runtime_env_info: RuntimeEnvInfo {
            serialized_runtime_env: serialized_runtime_env.to_string(),
            config: RuntimeEnvConfig::default(),
        },
        ..task_spec(job_id, runtime_env_hash)
    }
}

async fn start_job(pool: &TestPool, job_id: u64) {
    pool.handle
        .send(PoolEvent::JobStarted {
            job_id: JobId::from(job_id),
            job_config: JobConfig::default(),
        })
        .await
        .unwrap();
}

async fn pop_worker(pool: &TestPool, spec: TaskSpec, used: bool) -> mpsc::UnboundedReceiver<PopResult> {
    let (callback, rx) = pop_callback(used);
    pool.handle
        .send(PoolEvent::PopWorker { spec, callback })
        .await
        .unwrap();
    rx
}

/// Register a spawned process as a worker and complete the startup
/// handshake.
async fn register_worker(
    pool: &TestPool,
    worker_id: u64,
    process: &SpawnedProcess,
    worker_type: WorkerType,
    client: Arc<MockWorkerClient>,
) -> u16 {
    let (tx, rx) = oneshot::channel();
    pool.handle
        .send(PoolEvent::RegisterWorker {
            worker_id: WorkerId::from(worker_id),
            language: Language::Python,
            worker_type,
            pid: process.pid,
            startup_token: process.startup_token(),
            runtime_env_hash: process.runtime_env_hash(),
            client: client as Arc<dyn WorkerClient>,
            reply: tx,
        })
        .await
        .unwrap();
    let port = rx.await.unwrap().unwrap();
    pool.handle
        .send(PoolEvent::WorkerStarted {
            worker_id: WorkerId::from(worker_id),
        })
        .await
        .unwrap();
    port
}

#[tokio::test(start_paused = true)]
async fn test_pop_worker_cache_hit() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;

    let mut rx1 = pop_worker(&pool, task_spec(1, 7), true).await;
    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 1);

    let process = pool.spawner.spawned()[0].clone();
    register_worker(&pool, 101, &process, WorkerType::Task, MockWorkerClient::new(true)).await;

    let (worker, status, message) = rx1.recv().await.unwrap();
    assert_eq!(status, PopWorkerStatus::Ok);
    assert_eq!(message, None);
    let worker = worker.unwrap();
    assert_eq!(worker.worker_id, WorkerId::from(101));

    // The consumer is done with the worker; it goes back to the pool.
    pool.handle
        .send(PoolEvent::PushWorker {
            worker_id: worker.worker_id,
        })
        .await
        .unwrap();

    // The same fingerprint is served from the idle pool without a spawn.
    let mut rx2 = pop_worker(&pool, task_spec(1, 7), true).await;
    let (worker, status, _) = rx2.recv().await.unwrap();
    assert_eq!(status, PopWorkerStatus::Ok);
    assert_eq!(worker.unwrap().worker_id, WorkerId::from(101));
    assert_eq!(pool.spawner.spawn_count(), 1);

    let snapshot = observe(&pool).await;
    assert_eq!(snapshot.num_workers_started, 1);
    assert_eq!(snapshot.num_workers_started_from_cache, 1);
}

#[tokio::test(start_paused = true)]
async fn test_startup_rate_limiting_queues_requests_in_order() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;

    let mut receivers = vec![];
    for hash in 1..=5 {
        receivers.push(pop_worker(&pool, task_spec(1, hash), true).await);
    }
    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 2);
    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).pending_start_requests, 3);
    assert_eq!(python(&snapshot).pending_registration_requests, 2);
    assert_eq!(snapshot.process_failed_rate_limited, 3);

    // Completing one registration frees startup capacity; the oldest queued
    // request is resubmitted.
    let process = pool.spawner.spawned()[0].clone();
    register_worker(&pool, 201, &process, WorkerType::Task, MockWorkerClient::new(true)).await;
    let (worker, status, _) = receivers[0].recv().await.unwrap();
    assert_eq!(status, PopWorkerStatus::Ok);
    assert!(worker.is_some());

    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 3);
    assert_eq!(pool.spawner.spawned()[2].runtime_env_hash(), 3);
    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).pending_start_requests, 2);
    assert_eq!(python(&snapshot).pending_registration_requests, 2);
}

#[tokio::test(start_paused = true)]
async fn test_registration_timeout_cleans_up_process_and_request() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;

    let env = "{\"pip\":[\"requests\"]}";
    let mut rx = pop_worker(&pool, task_spec_with_env(1, 9, env), true).await;
    settle().await;
    assert_eq!(pool.agent.created(), vec![env.to_string()]);
    assert_eq!(pool.spawner.spawn_count(), 1);

    // The worker never registers.
    tokio::time::advance(Duration::from_secs(31)).await;
    settle().await;

    let (worker, status, _) = rx.recv().await.unwrap();
    assert!(worker.is_none());
    assert_eq!(status, PopWorkerStatus::WorkerPendingRegistration);
    assert!(pool.spawner.spawned()[0].killed());
    assert_eq!(pool.agent.deleted(), vec![env.to_string()]);

    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).worker_processes, 0);
    assert_eq!(python(&snapshot).pending_registration_requests, 0);
    assert_eq!(python(&snapshot).pending_start_requests, 0);
    assert_eq!(snapshot.process_failed_pending_registration, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_eviction_kills_cold_workers_first() {
    let pool = start_pool(test_config(4)).await;
    start_job(&pool, 1).await;
    pool.cpus.cpus.store(1, Ordering::SeqCst);

    // Worker A is dispatched but refused by the consumer, so it has never
    // held a task and idles cold.
    let client_a = MockWorkerClient::new(true);
    let mut rx_a = pop_worker(&pool, task_spec(1, 1), false).await;
    settle().await;
    let process_a = pool.spawner.spawned()[0].clone();
    register_worker(&pool, 301, &process_a, WorkerType::Task, Arc::clone(&client_a)).await;
    let (worker, status, _) = rx_a.recv().await.unwrap();
    assert_eq!(status, PopWorkerStatus::Ok);
    assert!(worker.is_some());

    // Worker B serves a task before idling, so it is warm.
    let client_b = MockWorkerClient::new(true);
    let mut rx_b = pop_worker(&pool, task_spec(1, 2), true).await;
    settle().await;
    let process_b = pool.spawner.spawned()[1].clone();
    register_worker(&pool, 302, &process_b, WorkerType::Task, Arc::clone(&client_b)).await;
    let (worker, _, _) = rx_b.recv().await.unwrap();
    let worker = worker.unwrap();
    assert_eq!(worker.worker_id, WorkerId::from(302));
    pool.handle
        .send(PoolEvent::PushWorker {
            worker_id: worker.worker_id,
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(observe(&pool).await.idle_workers, 2);

    // Both keep-alives expire; with one CPU available only one worker may
    // be killed, and the cold one goes first.
    tokio::time::advance(Duration::from_secs(2)).await;
    pool.handle
        .send(PoolEvent::TickIdleWorkerEviction)
        .await
        .unwrap();
    settle().await;

    assert_eq!(client_a.exits(), vec![false]);
    assert!(client_b.exits().is_empty());
    assert_eq!(observe(&pool).await.idle_workers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_finished_job_workers_are_force_exited() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 5).await;

    let client = MockWorkerClient::new(true);
    let mut rx = pop_worker(&pool, task_spec(5, 3), true).await;
    settle().await;
    let process = pool.spawner.spawned()[0].clone();
    register_worker(&pool, 401, &process, WorkerType::Task, Arc::clone(&client)).await;
    let (worker, _, _) = rx.recv().await.unwrap();
    let worker = worker.unwrap();
    pool.handle
        .send(PoolEvent::PushWorker {
            worker_id: worker.worker_id,
        })
        .await
        .unwrap();

    pool.handle
        .send(PoolEvent::JobFinished {
            job_id: JobId::from(5),
        })
        .await
        .unwrap();

    // The keep-alive has not expired, but the finished job overrides it.
    pool.handle
        .send(PoolEvent::TickIdleWorkerEviction)
        .await
        .unwrap();
    settle().await;

    assert_eq!(client.exits(), vec![true]);
    let snapshot = observe(&pool).await;
    assert_eq!(snapshot.idle_workers, 0);
    assert_eq!(snapshot.pending_exit_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_io_workers_start_on_demand() {
    let pool = start_pool(test_config(4)).await;

    let mut receivers = vec![];
    for _ in 0..3 {
        let (callback, rx) = io_callback();
        pool.handle
            .send(PoolEvent::PopIoWorker {
                worker_type: WorkerType::Spill,
                callback,
            })
            .await
            .unwrap();
        receivers.push(rx);
    }
    settle().await;

    // Demand is three tasks, but the budget caps the sub-pool at two.
    assert_eq!(pool.spawner.spawn_count(), 2);
    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).spill_io.pending_tasks, 3);
    assert_eq!(python(&snapshot).spill_io.num_starting, 2);

    let processes = pool.spawner.spawned();
    register_worker(&pool, 501, &processes[0], WorkerType::Spill, MockWorkerClient::new(true))
        .await;
    register_worker(&pool, 502, &processes[1], WorkerType::Spill, MockWorkerClient::new(true))
        .await;
    settle().await;

    let first = receivers[0].recv().await.unwrap();
    let second = receivers[1].recv().await.unwrap();
    assert_ne!(first.worker_id, second.worker_id);
    assert!(receivers[2].try_recv().is_err());
    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).spill_io.pending_tasks, 1);
    assert_eq!(python(&snapshot).spill_io.idle, 0);

    // Returning a worker hands it to the remaining pending task.
    pool.handle
        .send(PoolEvent::PushIoWorker {
            worker_id: first.worker_id,
        })
        .await
        .unwrap();
    let third = receivers[2].recv().await.unwrap();
    assert_eq!(third.worker_id, first.worker_id);
    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).spill_io.pending_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pop_worker_fails_without_job_config() {
    let pool = start_pool(test_config(2)).await;

    let mut rx = pop_worker(&pool, task_spec(9, 0), true).await;
    let (worker, status, _) = rx.recv().await.unwrap();
    assert!(worker.is_none());
    assert_eq!(status, PopWorkerStatus::JobConfigMissing);
    assert_eq!(pool.spawner.spawn_count(), 0);
    let snapshot = observe(&pool).await;
    assert_eq!(snapshot.process_failed_job_config_missing, 1);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_env_creation_failure_is_terminal() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;
    pool.agent.fail_with("conda solve failed");

    let mut rx = pop_worker(&pool, task_spec_with_env(1, 4, "{\"conda\":\"env\"}"), true).await;
    settle().await;
    let (worker, status, message) = rx.recv().await.unwrap();
    assert!(worker.is_none());
    assert_eq!(status, PopWorkerStatus::RuntimeEnvCreationFailed);
    assert_eq!(message.as_deref(), Some("conda solve failed"));
    assert_eq!(pool.spawner.spawn_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unused_worker_is_requeued_and_reused() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;

    let mut rx1 = pop_worker(&pool, task_spec(1, 6), false).await;
    settle().await;
    let process = pool.spawner.spawned()[0].clone();
    register_worker(&pool, 601, &process, WorkerType::Task, MockWorkerClient::new(true)).await;
    let (worker, status, _) = rx1.recv().await.unwrap();
    assert_eq!(status, PopWorkerStatus::Ok);
    assert!(worker.is_some());
    settle().await;
    assert_eq!(observe(&pool).await.idle_workers, 1);

    // A compatible request receives the requeued worker.
    let mut rx2 = pop_worker(&pool, task_spec(1, 6), true).await;
    let (worker, status, _) = rx2.recv().await.unwrap();
    assert_eq!(status, PopWorkerStatus::Ok);
    assert_eq!(worker.unwrap().worker_id, WorkerId::from(601));
    assert_eq!(pool.spawner.spawn_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_prestart_workers_sized_by_backlog_and_cpus() {
    let pool = start_pool(test_config(8)).await;
    start_job(&pool, 1).await;
    pool.cpus.cpus.store(4, Ordering::SeqCst);

    pool.handle
        .send(PoolEvent::PrestartWorkers {
            spec: task_spec(1, 0),
            backlog_size: 3,
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 3);

    // Workers already starting count as usable; no further prestart.
    pool.handle
        .send(PoolEvent::PrestartWorkers {
            spec: task_spec(1, 0),
            backlog_size: 3,
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_first_driver_registration_waits_for_prestarted_workers() {
    let mut config = test_config(2);
    config.pool.prestart_worker_first_driver = true;
    config.pool.num_prestart_workers = 2;
    let pool = start_pool(config).await;

    let (tx, mut rx) = oneshot::channel();
    pool.handle
        .send(PoolEvent::RegisterDriver {
            worker_id: WorkerId::from(701),
            language: Language::Python,
            job_id: JobId::from(1),
            job_config: JobConfig::default(),
            reply: tx,
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 2);
    // The reply is withheld until the prestarted workers have started.
    assert!(rx.try_recv().is_err());

    let processes = pool.spawner.spawned();
    register_worker(&pool, 801, &processes[0], WorkerType::Task, MockWorkerClient::new(true))
        .await;
    register_worker(&pool, 802, &processes[1], WorkerType::Task, MockWorkerClient::new(true))
        .await;
    settle().await;
    assert!(rx.await.unwrap().is_ok());

    let snapshot = observe(&pool).await;
    assert_eq!(python(&snapshot).registered_drivers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cleans_up_worker_state() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;

    let mut rx = pop_worker(&pool, task_spec(1, 2), false).await;
    settle().await;
    let process = pool.spawner.spawned()[0].clone();
    register_worker(&pool, 901, &process, WorkerType::Task, MockWorkerClient::new(true)).await;
    let (worker, _, _) = rx.recv().await.unwrap();
    assert!(worker.is_some());
    settle().await;
    assert_eq!(observe(&pool).await.idle_workers, 1);

    pool.handle
        .send(PoolEvent::DisconnectWorker {
            worker_id: WorkerId::from(901),
        })
        .await
        .unwrap();
    let snapshot = observe(&pool).await;
    assert_eq!(snapshot.idle_workers, 0);
    assert_eq!(python(&snapshot).registered_workers, 0);
    assert_eq!(python(&snapshot).worker_processes, 0);
    assert_eq!(python(&snapshot).idle_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_kills_remaining_worker_processes() {
    let pool = start_pool(test_config(2)).await;
    start_job(&pool, 1).await;

    let _rx = pop_worker(&pool, task_spec(1, 1), true).await;
    settle().await;
    assert_eq!(pool.spawner.spawn_count(), 1);

    pool.handle.send(PoolEvent::Shutdown).await.unwrap();
    pool.handle.clone().wait_for_stop().await;
    assert!(pool.spawner.spawned()[0].killed());
}
